// Lattice CLI
// Runs matrix pipeline definitions locally with ephemeral services

mod commands;
mod logging;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;

use commands::matrix::MatrixArgs;
use commands::run::RunArgs;
use commands::validate::ValidateArgs;

/// Run matrix CI pipelines locally
#[derive(Parser, Debug)]
#[command(name = "lattice", version, about)]
struct Cli {
    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "warn", env = "LATTICE_LOG")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
    Validate(ValidateArgs),
    Matrix(MatrixArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    logging::init_logging(&cli.log_level);

    let code = match cli.command {
        Command::Run(args) => commands::run::execute(args).await?,
        Command::Validate(args) => commands::validate::execute(args)?,
        Command::Matrix(args) => commands::matrix::execute(args)?,
    };

    if code != 0 {
        std::process::exit(code);
    }

    Ok(())
}
