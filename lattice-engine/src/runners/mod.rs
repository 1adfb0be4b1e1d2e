// Runners Module
// Step execution and the step outcome types it produces

pub mod process;

pub use process::StepExecutor;

use serde::Serialize;
use std::fmt;

/// Why a step failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The command ran and exited non-zero or was killed by a signal
    NonZeroExit,
    /// The command could not be started
    LaunchFailure,
    /// The command exceeded its timeout and was killed
    TimedOut,
}

impl FailureKind {
    /// Infrastructure failures may succeed on a retry; a command that ran and
    /// failed will not. The engine itself never retries.
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::LaunchFailure | FailureKind::TimedOut)
    }
}

/// Why a step did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The step's condition evaluated to false for this binding
    ConditionFalse,
    /// An earlier step failed
    PriorFailure,
    /// The job was cancelled or hit an executor fault
    Aborted,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::ConditionFalse => write!(f, "condition is false"),
            SkipReason::PriorFailure => write!(f, "a previous step failed"),
            SkipReason::Aborted => write!(f, "job aborted"),
        }
    }
}

/// Step status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed { kind: FailureKind },
    Skipped { reason: SkipReason },
}

impl StepStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, StepStatus::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, StepStatus::Skipped { .. })
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Succeeded => write!(f, "succeeded"),
            StepStatus::Failed { kind } => match kind {
                FailureKind::NonZeroExit => write!(f, "failed"),
                FailureKind::LaunchFailure => write!(f, "failed to launch"),
                FailureKind::TimedOut => write!(f, "timed out"),
            },
            StepStatus::Skipped { reason } => write!(f, "skipped ({})", reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of step output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Interleaved stdout/stderr, bounded in size
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapturedOutput {
    pub lines: Vec<OutputLine>,
    /// Output was dropped because the limit was reached
    pub truncated: bool,
    #[serde(skip)]
    bytes: usize,
}

impl CapturedOutput {
    /// Append a line unless that would exceed `limit` bytes.
    ///
    /// Returns false once the buffer is full.
    pub fn push(&mut self, line: OutputLine, limit: usize) -> bool {
        if self.truncated {
            return false;
        }
        let size = line.text.len() + 1;
        if self.bytes + size > limit {
            self.truncated = true;
            return false;
        }
        self.bytes += size;
        self.lines.push(line);
        true
    }

    /// Record that output was dropped before it reached the buffer
    pub fn mark_truncated(&mut self) {
        self.truncated = true;
    }

    pub fn text(&self) -> String {
        self.lines
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The last `n` lines, for failure summaries
    pub fn tail(&self, n: usize) -> &[OutputLine] {
        let start = self.lines.len().saturating_sub(n);
        &self.lines[start..]
    }
}

/// Result of one step
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub name: String,
    #[serde(flatten)]
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub output: CapturedOutput,
    pub duration_ms: u64,
}

impl StepResult {
    /// A step that never ran
    pub fn skipped(name: impl Into<String>, reason: SkipReason) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Skipped { reason },
            exit_code: None,
            output: CapturedOutput::default(),
            duration_ms: 0,
        }
    }
}
