// Execution Engine Module
// Matrix expansion, job running, scheduling and result aggregation

pub mod cancel;
pub mod events;
pub mod job;
pub mod matrix;
pub mod report;
pub mod scheduler;

// Re-export key types
pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use events::{
    progress_channel, EventSender, ExecutionEvent, JobState, ProgressReceiver,
    ProgressSender,
};
pub use job::{JobRunner, ServiceScope};
pub use matrix::{env_key, JobInstance, JobPlan, MatrixBinding, MatrixExpander};
pub use report::{
    aggregate, DimensionBreakdown, JobError, JobErrorKind, JobResult, JobStatus, PipelineResult,
    PipelineStatus, ValueBreakdown,
};
pub use scheduler::MatrixScheduler;
