use crate::commands::{load_definition, report_definition_error, EXIT_DEFINITION_ERROR};
use crate::output;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use color_eyre::Result;

use lattice_engine::{
    cancel_pair, progress_channel, EngineConfig, MatrixScheduler, ServiceConfig, ServiceManager,
    TriggerKind,
};

/// Run every matrix cell of a pipeline definition
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the pipeline definition (YAML)
    pub definition: PathBuf,

    /// Maximum number of job instances running at once
    #[arg(long, env = "LATTICE_MAX_PARALLEL", value_name = "N")]
    pub max_parallel: Option<usize>,

    /// Stop dispatching jobs after the first failure
    #[arg(long, overrides_with = "no_fail_fast")]
    pub fail_fast: bool,

    /// Run every job regardless of failures
    #[arg(long, overrides_with = "fail_fast")]
    pub no_fail_fast: bool,

    /// Event that triggered this run (push, pull_request, schedule, manual)
    #[arg(long, default_value = "manual", value_name = "KIND")]
    pub event: TriggerKind,

    /// Branch the event refers to
    #[arg(long, env = "LATTICE_BRANCH", value_name = "NAME")]
    pub branch: Option<String>,

    /// Write the JSON report to this path
    #[arg(long, value_name = "PATH")]
    pub report: Option<PathBuf>,

    /// Captured output kept per step, in bytes
    #[arg(long, env = "LATTICE_OUTPUT_LIMIT", value_name = "BYTES")]
    pub output_limit: Option<usize>,

    /// Seconds a service may take to become ready
    #[arg(long, env = "LATTICE_STARTUP_TIMEOUT", value_name = "SECS")]
    pub startup_timeout: Option<u64>,

    /// Docker CLI used for docker services
    #[arg(long, env = "LATTICE_DOCKER", default_value = "docker", value_name = "PATH")]
    pub docker: String,

    /// Hide step output
    #[arg(long, short = 'q')]
    pub quiet: bool,
}

impl RunArgs {
    fn fail_fast_override(&self) -> Option<bool> {
        if self.no_fail_fast {
            Some(false)
        } else if self.fail_fast {
            Some(true)
        } else {
            None
        }
    }

    fn engine_config(&self) -> EngineConfig {
        let mut service = ServiceConfig::default().with_docker_binary(&self.docker);
        if let Some(secs) = self.startup_timeout {
            service = service.with_startup_timeout(Duration::from_secs(secs));
        }

        let mut config = EngineConfig::new().with_service_config(service);
        if let Some(max_parallel) = self.max_parallel {
            config = config.with_max_parallel(max_parallel);
        }
        if let Some(fail_fast) = self.fail_fast_override() {
            config = config.with_fail_fast(fail_fast);
        }
        if let Some(limit) = self.output_limit {
            config = config.with_output_limit(limit);
        }
        config
    }
}

pub async fn execute(args: RunArgs) -> Result<i32> {
    let Some(definition) = load_definition(&args.definition) else {
        return Ok(EXIT_DEFINITION_ERROR);
    };

    if !definition
        .triggers
        .accepts(args.event, args.branch.as_deref())
    {
        output::info(&format!(
            "Pipeline '{}' is not triggered by {:?}{}; nothing to do",
            definition.name,
            args.event,
            args.branch
                .as_deref()
                .map(|b| format!(" on '{}'", b))
                .unwrap_or_default()
        ));
        return Ok(0);
    }

    let config = args.engine_config();
    tracing::debug!(?config, event = ?args.event, "engine configuration");
    let (tx, rx) = progress_channel();

    let services = ServiceManager::with_default_providers(config.service.clone())
        .with_progress(tx.clone());
    let scheduler = MatrixScheduler::new(config)
        .with_services(Arc::new(services))
        .with_progress(tx);

    let (cancel, signal) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            output::warning("Interrupted, cancelling running jobs");
            cancel.cancel();
        }
    });

    // Print events in the background while the scheduler runs
    let printer = tokio::spawn(output::print_events(rx, args.quiet));

    let outcome = scheduler.run(&definition, signal).await;
    drop(scheduler);
    printer.await?;

    let result = match outcome {
        Ok(result) => result,
        Err(e) => {
            report_definition_error(&e);
            return Ok(EXIT_DEFINITION_ERROR);
        }
    };

    output::print_summary(&result);

    if let Some(path) = &args.report {
        std::fs::write(path, result.to_json()?)?;
        output::status("Report", &path.display().to_string());
    }

    Ok(result.exit_code())
}
