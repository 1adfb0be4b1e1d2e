// CLI Commands
// Subcommands plus the definition loading they share

pub mod matrix;
pub mod run;
pub mod validate;

use crate::output;

use std::path::Path;

use lattice_engine::{from_file, DefinitionError, PipelineDefinition};

/// Exit code for definitions that fail to load or validate
pub const EXIT_DEFINITION_ERROR: i32 = 2;

/// Load a definition file, printing the problem when it cannot be read
pub fn load_definition(path: &Path) -> Option<PipelineDefinition> {
    match from_file(path) {
        Ok(definition) => Some(definition),
        Err(e) => {
            output::error(&e.to_string());
            None
        }
    }
}

pub fn report_definition_error(error: &DefinitionError) {
    output::error(&format!("Invalid definition: {}", error));
}
