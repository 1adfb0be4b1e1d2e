// Output formatting helpers for CLI commands

use lattice_engine::runners::OutputStream;
use lattice_engine::{ExecutionEvent, JobStatus, PipelineResult, ProgressReceiver, StepStatus};

/// Print a status message: "  Status message"
pub fn status(action: &str, message: &str) {
    eprintln!("\x1b[1;36m{:>12}\x1b[0m {}", action, message);
}

/// Print a success message with checkmark
pub fn success(message: &str) {
    eprintln!("\x1b[1;32m  \u{2713}\x1b[0m {}", message);
}

/// Print a failure message with X
pub fn failure(message: &str) {
    eprintln!("\x1b[1;31m  \u{2717}\x1b[0m {}", message);
}

/// Print a check/pass item
pub fn check(message: &str) {
    eprintln!("\x1b[32m  \u{2713}\x1b[0m {}", message);
}

/// Print a warning message
pub fn warning(message: &str) {
    eprintln!("\x1b[33m  !\x1b[0m {}", message);
}

/// Print an error message
pub fn error(message: &str) {
    eprintln!("\x1b[1;31merror:\x1b[0m {}", message);
}

/// Print an info message
pub fn info(message: &str) {
    eprintln!("\x1b[36m  i\x1b[0m {}", message);
}

/// Print a dim/muted message
pub fn dim(message: &str) {
    eprintln!("\x1b[2m{}\x1b[0m", message);
}

/// Print a dim success message
pub fn dim_success(message: &str) {
    eprintln!("\x1b[32m{}\x1b[0m", message);
}

/// Print a dim failure message
pub fn dim_failure(message: &str) {
    eprintln!("\x1b[31m{}\x1b[0m", message);
}

/// Print step output (indented, prefixed with the job index)
pub fn step_output(job_index: usize, line: &str) {
    println!("  [{}]   | {}", job_index, line);
}

/// Print step error output (indented, red)
pub fn step_error(job_index: usize, line: &str) {
    eprintln!("\x1b[31m  [{}]   | {}\x1b[0m", job_index, line);
}

/// Print a header line
pub fn header(message: &str) {
    eprintln!("\x1b[1m==> {}\x1b[0m", message);
}

/// Print progress events until every sender is gone
pub async fn print_events(mut rx: ProgressReceiver, quiet: bool) {
    while let Some(event) = rx.recv().await {
        print_event(&event, quiet);
    }
}

fn print_event(event: &ExecutionEvent, quiet: bool) {
    match event {
        ExecutionEvent::PipelineStarted {
            pipeline_name,
            total_jobs,
            max_parallel,
        } => {
            println!();
            header(&format!(
                "Pipeline '{}' ({} jobs, {} at a time)",
                pipeline_name, total_jobs, max_parallel
            ));
        }

        ExecutionEvent::PipelineCompleted {
            success: ok,
            duration,
            ..
        } => {
            println!();
            if *ok {
                success(&format!(
                    "Pipeline completed successfully in {:.2}s",
                    duration.as_secs_f64()
                ));
            } else {
                failure(&format!("Pipeline failed after {:.2}s", duration.as_secs_f64()));
            }
        }

        ExecutionEvent::JobStateChanged { .. } => {}

        ExecutionEvent::JobStarted {
            job_index,
            job_name,
            total_steps,
        } => {
            println!("  [{}] Job '{}' ({} steps)", job_index, job_name, total_steps);
        }

        ExecutionEvent::JobCompleted {
            job_index,
            job_name,
            status,
            duration,
        } => {
            let line = format!(
                "  [{}] Job '{}' {} ({:.2}s)",
                job_index,
                job_name,
                status,
                duration.as_secs_f64()
            );
            if *status == JobStatus::Succeeded {
                dim_success(&line);
            } else {
                dim_failure(&line);
            }
        }

        ExecutionEvent::JobSkipped {
            job_index,
            job_name,
            reason,
        } => {
            warning(&format!("[{}] Job '{}' skipped: {}", job_index, job_name, reason));
        }

        ExecutionEvent::ServiceStarting {
            job_index,
            service,
            port,
        } => {
            dim(&format!("  [{}]   service '{}' starting on port {}", job_index, service, port));
        }

        ExecutionEvent::ServiceReady {
            job_index,
            service,
            duration,
            ..
        } => {
            dim(&format!(
                "  [{}]   service '{}' ready ({:.2}s)",
                job_index,
                service,
                duration.as_secs_f64()
            ));
        }

        ExecutionEvent::ServiceReleased { job_index, service } => {
            dim(&format!("  [{}]   service '{}' released", job_index, service));
        }

        ExecutionEvent::StepStarted {
            job_index,
            step_name,
            step_index,
        } => {
            println!("  [{}]   [Step {}] {}", job_index, step_index + 1, step_name);
        }

        ExecutionEvent::StepOutput {
            job_index, line, ..
        } => {
            if quiet {
                return;
            }
            match line.stream {
                OutputStream::Stdout => step_output(*job_index, &line.text),
                OutputStream::Stderr => step_error(*job_index, &line.text),
            }
        }

        ExecutionEvent::StepCompleted {
            job_index,
            status,
            duration,
            exit_code,
            ..
        } => {
            let exit_info = match exit_code {
                Some(code) if *code != 0 => format!(" (exit code: {})", code),
                _ => String::new(),
            };
            let line = format!(
                "  [{}]     {} ({:.2}s){}",
                job_index,
                status,
                duration.as_secs_f64(),
                exit_info
            );
            if *status == StepStatus::Succeeded {
                dim_success(&line);
            } else {
                dim_failure(&line);
            }
        }

        ExecutionEvent::StepSkipped {
            job_index,
            step_name,
            reason,
            ..
        } => {
            dim(&format!("  [{}]   {} skipped: {}", job_index, step_name, reason));
        }
    }
}

/// Print the per-dimension breakdown and the failed jobs
pub fn print_summary(result: &PipelineResult) {
    println!();
    header("Summary");

    for dimension in &result.dimensions {
        for value in &dimension.values {
            let line = format!(
                "  {}={}: {} succeeded, {} failed, {} skipped",
                dimension.dimension, value.value, value.succeeded, value.failed, value.skipped
            );
            if value.failed > 0 {
                dim_failure(&line);
            } else {
                dim(&line);
            }
        }
    }

    for job in result.failed_jobs() {
        match (&job.error, job.first_failed_step()) {
            (Some(e), _) => failure(&format!("{}: {}", job.name, e.message)),
            (None, Some(step)) => {
                failure(&format!("{}: step '{}' {}", job.name, step.name, step.status));
                for line in step.output.tail(10) {
                    dim(&format!("      {}", line.text));
                }
            }
            (None, None) => failure(&format!("{}: {}", job.name, job.status)),
        }
    }

    if result.cancelled {
        warning("Run was cancelled");
    }

    info(&format!(
        "{} succeeded, {} failed, {} errored, {} skipped",
        result.count(JobStatus::Succeeded),
        result.count(JobStatus::Failed),
        result.count(JobStatus::Errored),
        result.count(JobStatus::Skipped)
    ));
}
