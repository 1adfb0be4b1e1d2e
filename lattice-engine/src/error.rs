// Engine Errors
// Error taxonomy shared by definition validation, services and step execution

use std::time::Duration;
use thiserror::Error;

/// Errors detected while validating a pipeline definition.
///
/// These are always reported before any job is expanded or any service is
/// started, so a definition error never has partial side effects.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("{location}: '{name}' is not a declared matrix dimension")]
    UnknownDimension { location: String, name: String },

    #[error("{location}: invalid expression '{expression}': {message}")]
    InvalidCondition {
        location: String,
        expression: String,
        message: String,
    },

    #[error("matrix dimension '{0}' has no values")]
    EmptyDimension(String),

    #[error("matrix dimension '{0}' is declared more than once")]
    DuplicateDimension(String),

    #[error("matrix dimension '{dimension}' lists value '{value}' more than once")]
    DuplicateValue { dimension: String, value: String },

    #[error("matrix dimension name '{0}' is reserved")]
    ReservedDimension(String),

    #[error("step name '{0}' is used more than once")]
    DuplicateStep(String),

    #[error("service name '{0}' is used more than once")]
    DuplicateService(String),

    #[error("matrix exclude entry {index}: {message}")]
    InvalidExclude { index: usize, message: String },

    #[error("step '{0}' has an empty command")]
    EmptyCommand(String),

    #[error("service '{service}': {message}")]
    InvalidService { service: String, message: String },

    #[error("job '{0}' declares no steps")]
    NoSteps(String),

    #[error("max_parallel must be at least 1")]
    ZeroParallelism,

    #[error("matrix exclusions remove every combination")]
    EmptyMatrix,
}

/// Result alias for definition validation
pub type DefinitionResult<T> = Result<T, DefinitionError>;

/// Errors from the service lifecycle manager
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service '{service}' did not become ready within {timeout:?}")]
    StartupTimeout { service: String, timeout: Duration },

    #[error("service '{service}' could not be acquired: {message}")]
    AcquisitionFailure { service: String, message: String },

    #[error("no free port could be allocated: {0}")]
    PortAllocation(String),

    #[error("no provider registered for service kind '{0}'")]
    UnknownProvider(String),

    #[error("startup of service '{0}' was cancelled")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    pub fn acquisition(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AcquisitionFailure {
            service: service.into(),
            message: message.into(),
        }
    }
}

/// Unrecoverable executor faults while running a step.
///
/// A command that ran and failed is never a `StepError`; it is a step result
/// with a failed status. This type covers the cases where the executor itself
/// lost track of the child process.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("lost track of step '{step}': {source}")]
    Wait {
        step: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to render step '{step}': {message}")]
    Render { step: String, message: String },
}
