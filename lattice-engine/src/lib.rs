// Lattice Engine Library
// Matrix pipeline engine: expansion, ephemeral services, step execution and reporting

pub mod config;
pub mod definition;
pub mod error;
pub mod execution;
pub mod expression;
pub mod runners;
pub mod services;

// Re-export commonly used types
pub use config::{EngineConfig, ServiceConfig};
pub use error::{DefinitionError, DefinitionResult, ServiceError, StepError};

// Re-export definition types
pub use definition::{
    from_file, from_yaml, DefinitionValidator, JobTemplate, LoadError, MatrixSpec,
    PipelineDefinition, PlannedStep, ServiceKind, ServiceRequirement, StepGuard, StepSpec,
    TriggerKind,
};

// Re-export expression types
pub use expression::{Condition, EvalError, Value};

// Re-export execution types
pub use execution::{
    cancel_pair, progress_channel, CancelHandle, CancelSignal, ExecutionEvent, JobInstance,
    JobResult, JobRunner, JobStatus, MatrixBinding, MatrixExpander, MatrixScheduler,
    PipelineResult, PipelineStatus, ProgressReceiver, ProgressSender,
};

// Re-export runner types
pub use runners::{FailureKind, SkipReason, StepExecutor, StepResult, StepStatus};

// Re-export service types
pub use services::{ServiceManager, ServiceProvider};
