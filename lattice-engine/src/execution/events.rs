// Execution Events
// Progress reporting and event types for matrix pipeline execution

use crate::execution::report::JobStatus;
use crate::runners::{OutputLine, SkipReason, StepStatus};

use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Lifecycle of one job instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Provisioning,
    Running,
    Completed,
    Errored,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Errored)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "pending",
            JobState::Provisioning => "provisioning",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Events emitted during pipeline execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Pipeline execution started
    PipelineStarted {
        pipeline_name: String,
        total_jobs: usize,
        max_parallel: usize,
    },

    /// Pipeline execution completed
    PipelineCompleted {
        pipeline_name: String,
        success: bool,
        duration: Duration,
    },

    /// A job instance moved between lifecycle states
    JobStateChanged {
        job_index: usize,
        from: JobState,
        to: JobState,
    },

    /// Job execution started
    JobStarted {
        job_index: usize,
        job_name: String,
        total_steps: usize,
    },

    /// Job execution completed
    JobCompleted {
        job_index: usize,
        job_name: String,
        status: JobStatus,
        duration: Duration,
    },

    /// Job was never dispatched (fail-fast or cancellation)
    JobSkipped {
        job_index: usize,
        job_name: String,
        reason: String,
    },

    /// Service provisioning started
    ServiceStarting {
        job_index: usize,
        service: String,
        port: u16,
    },

    /// Service passed its readiness probe
    ServiceReady {
        job_index: usize,
        service: String,
        port: u16,
        duration: Duration,
    },

    /// Service was stopped and its port returned
    ServiceReleased { job_index: usize, service: String },

    /// Step execution started
    StepStarted {
        job_index: usize,
        step_name: String,
        step_index: usize,
    },

    /// One line of step output
    StepOutput {
        job_index: usize,
        step_name: String,
        line: OutputLine,
    },

    /// Step execution completed
    StepCompleted {
        job_index: usize,
        step_name: String,
        step_index: usize,
        status: StepStatus,
        duration: Duration,
        exit_code: Option<i32>,
    },

    /// Step did not run
    StepSkipped {
        job_index: usize,
        step_name: String,
        step_index: usize,
        reason: SkipReason,
    },
}

impl ExecutionEvent {
    pub fn state_changed(job_index: usize, from: JobState, to: JobState) -> Self {
        Self::JobStateChanged {
            job_index,
            from,
            to,
        }
    }

    pub fn job_completed(
        job_index: usize,
        job_name: impl Into<String>,
        status: JobStatus,
        duration: Duration,
    ) -> Self {
        Self::JobCompleted {
            job_index,
            job_name: job_name.into(),
            status,
            duration,
        }
    }

    pub fn step_completed(
        job_index: usize,
        step_name: impl Into<String>,
        step_index: usize,
        status: StepStatus,
        duration: Duration,
        exit_code: Option<i32>,
    ) -> Self {
        Self::StepCompleted {
            job_index,
            step_name: step_name.into(),
            step_index,
            status,
            duration,
            exit_code,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
