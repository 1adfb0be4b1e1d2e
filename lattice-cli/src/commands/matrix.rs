use crate::commands::{load_definition, report_definition_error, EXIT_DEFINITION_ERROR};

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use lattice_engine::MatrixExpander;

/// Print the job instances a definition expands to
#[derive(Args, Debug)]
pub struct MatrixArgs {
    /// Path to the pipeline definition (YAML)
    pub definition: PathBuf,

    /// Print the bindings as a JSON array
    #[arg(long)]
    pub json: bool,
}

pub fn execute(args: MatrixArgs) -> Result<i32> {
    let Some(definition) = load_definition(&args.definition) else {
        return Ok(EXIT_DEFINITION_ERROR);
    };

    let instances = match MatrixExpander::instances(&definition) {
        Ok(instances) => instances,
        Err(e) => {
            report_definition_error(&e);
            return Ok(EXIT_DEFINITION_ERROR);
        }
    };

    if args.json {
        let bindings: Vec<_> = instances.iter().map(|i| &i.binding).collect();
        println!("{}", serde_json::to_string_pretty(&bindings)?);
        return Ok(0);
    }

    for instance in &instances {
        println!("{:>4}  {}", instance.index, instance.display_name());
    }

    Ok(0)
}
