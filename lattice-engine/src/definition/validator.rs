// Definition Validator
// Checks a pipeline definition and compiles step guards before anything runs

use crate::definition::models::{PipelineDefinition, ServiceKind, StepSpec};
use crate::error::{DefinitionError, DefinitionResult};
use crate::expression::{check_template, CheckError, Condition};

use std::collections::HashSet;

/// Dimension names that would clash with the expression syntax
const RESERVED_DIMENSIONS: &[&str] = &["matrix", "true", "false"];

/// Whether a step runs unconditionally or behind a condition
#[derive(Debug, Clone, PartialEq)]
pub enum StepGuard {
    Unconditional,
    Guarded(Condition),
}

/// A step specification with its compiled guard
#[derive(Debug, Clone)]
pub struct PlannedStep {
    pub spec: StepSpec,
    pub guard: StepGuard,
}

impl PlannedStep {
    /// Build an unconditional step, mostly useful in tests and tools
    pub fn unconditional(spec: StepSpec) -> Self {
        Self {
            spec,
            guard: StepGuard::Unconditional,
        }
    }
}

/// Validator for pipeline definitions
pub struct DefinitionValidator;

impl DefinitionValidator {
    /// Validate the whole definition and compile every step guard.
    ///
    /// Returns the first problem found; nothing has been started at this
    /// point so a failure has no side effects.
    pub fn validate(definition: &PipelineDefinition) -> DefinitionResult<Vec<PlannedStep>> {
        let job = &definition.job;

        if job.max_parallel == Some(0) {
            return Err(DefinitionError::ZeroParallelism);
        }

        let dimensions = Self::validate_matrix(definition)?;

        for (key, value) in &job.env {
            check_location(value, &dimensions, format!("job env '{}'", key))?;
        }

        Self::validate_services(definition)?;

        if job.steps.is_empty() {
            return Err(DefinitionError::NoSteps(job.name.clone()));
        }

        let mut names = HashSet::new();
        let mut planned = Vec::with_capacity(job.steps.len());
        for step in &job.steps {
            if !names.insert(step.name.as_str()) {
                return Err(DefinitionError::DuplicateStep(step.name.clone()));
            }
            planned.push(Self::plan_step(step, &dimensions)?);
        }

        Ok(planned)
    }

    fn validate_matrix(definition: &PipelineDefinition) -> DefinitionResult<Vec<String>> {
        let matrix = &definition.job.matrix;
        let mut seen = HashSet::new();

        for dimension in &matrix.dimensions {
            if RESERVED_DIMENSIONS
                .iter()
                .any(|r| r.eq_ignore_ascii_case(&dimension.name))
            {
                return Err(DefinitionError::ReservedDimension(dimension.name.clone()));
            }
            if !seen.insert(dimension.name.as_str()) {
                return Err(DefinitionError::DuplicateDimension(dimension.name.clone()));
            }
            if dimension.values.is_empty() {
                return Err(DefinitionError::EmptyDimension(dimension.name.clone()));
            }
            let mut values = HashSet::new();
            for value in &dimension.values {
                if !values.insert(value.as_str()) {
                    return Err(DefinitionError::DuplicateValue {
                        dimension: dimension.name.clone(),
                        value: value.clone(),
                    });
                }
            }
        }

        for (index, entry) in matrix.exclude.iter().enumerate() {
            if entry.is_empty() {
                return Err(DefinitionError::InvalidExclude {
                    index,
                    message: "entry is empty".to_string(),
                });
            }
            for (key, value) in entry {
                let Some(dimension) = matrix.dimensions.iter().find(|d| &d.name == key) else {
                    return Err(DefinitionError::InvalidExclude {
                        index,
                        message: format!("'{}' is not a declared matrix dimension", key),
                    });
                };
                if !dimension.values.contains(value) {
                    return Err(DefinitionError::InvalidExclude {
                        index,
                        message: format!("'{}' is not a value of dimension '{}'", value, key),
                    });
                }
            }
        }

        Ok(matrix.dimensions.iter().map(|d| d.name.clone()).collect())
    }

    fn validate_services(definition: &PipelineDefinition) -> DefinitionResult<()> {
        let mut names = HashSet::new();

        for service in &definition.job.services {
            let invalid = |message: &str| DefinitionError::InvalidService {
                service: service.name.clone(),
                message: message.to_string(),
            };

            if service.name.trim().is_empty() {
                return Err(invalid("name must not be empty"));
            }
            if !names.insert(service.name.as_str()) {
                return Err(DefinitionError::DuplicateService(service.name.clone()));
            }
            match service.kind {
                ServiceKind::Docker => {
                    if service.image.as_deref().map_or(true, str::is_empty) {
                        return Err(invalid("docker services need an image"));
                    }
                    if service.port.is_none() {
                        return Err(invalid("docker services need a port"));
                    }
                }
                ServiceKind::Process => {
                    if service.command.is_empty() {
                        return Err(invalid("process services need a command"));
                    }
                }
            }
            if service.startup_timeout_secs == Some(0) {
                return Err(invalid("startup timeout must be positive"));
            }
        }

        Ok(())
    }

    fn plan_step(step: &StepSpec, dimensions: &[String]) -> DefinitionResult<PlannedStep> {
        let location = format!("step '{}'", step.name);

        if step.run.trim().is_empty() {
            return Err(DefinitionError::EmptyCommand(step.name.clone()));
        }

        check_location(&step.run, dimensions, location.clone())?;
        for arg in &step.args {
            check_location(arg, dimensions, location.clone())?;
        }
        for (key, value) in &step.env {
            check_location(value, dimensions, format!("{} env '{}'", location, key))?;
        }
        if let Some(dir) = &step.working_dir {
            check_location(dir, dimensions, location.clone())?;
        }

        let guard = match step.condition.as_deref().map(str::trim) {
            None | Some("") => StepGuard::Unconditional,
            Some(source) => {
                let condition =
                    Condition::parse(source).map_err(|e| DefinitionError::InvalidCondition {
                        location: location.clone(),
                        expression: source.to_string(),
                        message: e.to_string(),
                    })?;
                condition
                    .check(dimensions)
                    .map_err(|e| into_definition_error(e, &location, source))?;
                StepGuard::Guarded(condition)
            }
        };

        Ok(PlannedStep {
            spec: step.clone(),
            guard,
        })
    }
}

fn check_location(
    template: &str,
    dimensions: &[String],
    location: String,
) -> DefinitionResult<()> {
    check_template(template, dimensions).map_err(|e| into_definition_error(e, &location, template))
}

fn into_definition_error(err: CheckError, location: &str, expression: &str) -> DefinitionError {
    match err {
        CheckError::UnknownDimension(name) => DefinitionError::UnknownDimension {
            location: location.to_string(),
            name,
        },
        CheckError::Invalid(message) => DefinitionError::InvalidCondition {
            location: location.to_string(),
            expression: expression.to_string(),
            message,
        },
    }
}
