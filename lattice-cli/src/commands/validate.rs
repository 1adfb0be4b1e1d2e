use crate::commands::{load_definition, report_definition_error, EXIT_DEFINITION_ERROR};
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use lattice_engine::{DefinitionValidator, MatrixExpander, StepGuard};

/// Validate a pipeline definition without running it
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the pipeline definition (YAML)
    pub definition: PathBuf,
}

pub fn execute(args: ValidateArgs) -> Result<i32> {
    output::status("Validating", &args.definition.display().to_string());

    let Some(definition) = load_definition(&args.definition) else {
        return Ok(EXIT_DEFINITION_ERROR);
    };
    output::check("YAML syntax valid");

    let steps = match DefinitionValidator::validate(&definition) {
        Ok(steps) => steps,
        Err(e) => {
            report_definition_error(&e);
            return Ok(EXIT_DEFINITION_ERROR);
        }
    };

    let guarded = steps
        .iter()
        .filter(|s| matches!(s.guard, StepGuard::Guarded(_)))
        .count();
    let job = &definition.job;
    output::check(&format!(
        "Job '{}': {} steps ({} conditional), {} services",
        job.name,
        steps.len(),
        guarded,
        job.services.len()
    ));

    // Expansion also rejects a matrix whose cells are all excluded
    match MatrixExpander::instances(&definition) {
        Ok(instances) => output::check(&format!(
            "Matrix: {} dimensions, {} job instances",
            job.matrix.dimensions.len(),
            instances.len()
        )),
        Err(e) => {
            report_definition_error(&e);
            return Ok(EXIT_DEFINITION_ERROR);
        }
    }

    println!();
    output::success("Pipeline is valid");

    Ok(0)
}
