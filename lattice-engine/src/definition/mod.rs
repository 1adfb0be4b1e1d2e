// Pipeline Definition Module
// Definition model, YAML loading and validation

pub mod loader;
pub mod models;
pub mod validator;

pub use loader::{from_file, from_yaml, LoadError};
pub use models::{
    BranchFilter, Credentials, Dimension, JobTemplate, MatrixSpec, PipelineDefinition, Schedule,
    ServiceKind, ServiceRequirement, StepSpec, TriggerKind, TriggerSet,
};
pub use validator::{DefinitionValidator, PlannedStep, StepGuard};
