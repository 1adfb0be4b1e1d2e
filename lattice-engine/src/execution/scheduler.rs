// Matrix Scheduler
// Validates, expands and dispatches job instances with bounded parallelism

use crate::config::EngineConfig;
use crate::definition::models::PipelineDefinition;
use crate::error::DefinitionResult;
use crate::execution::cancel::CancelSignal;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::job::JobRunner;
use crate::execution::matrix::{JobInstance, MatrixExpander};
use crate::execution::report::{aggregate, JobError, JobErrorKind, JobResult, JobStatus, PipelineResult};
use crate::services::ServiceManager;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Pipeline scheduler for matrix jobs
pub struct MatrixScheduler {
    config: EngineConfig,
    services: Arc<ServiceManager>,
    event_tx: Option<ProgressSender>,
}

impl MatrixScheduler {
    /// A scheduler using the built-in docker and process providers
    pub fn new(config: EngineConfig) -> Self {
        let services = Arc::new(ServiceManager::with_default_providers(config.service.clone()));
        Self {
            config,
            services,
            event_tx: None,
        }
    }

    pub fn with_services(mut self, services: Arc<ServiceManager>) -> Self {
        self.services = services;
        self
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate the definition and expand its matrix.
    ///
    /// Deterministic: the same definition always yields the same instances
    /// in the same order.
    pub fn expand(&self, definition: &PipelineDefinition) -> DefinitionResult<Vec<JobInstance>> {
        MatrixExpander::instances(definition)
    }

    /// Run every job instance of the definition.
    ///
    /// Definition errors are returned before anything is started. Once a job
    /// ends `Failed` or `Errored` under fail-fast, or the run is cancelled,
    /// jobs not yet dispatched are reported `Skipped`; running jobs finish.
    pub async fn run(
        &self,
        definition: &PipelineDefinition,
        cancel: CancelSignal,
    ) -> DefinitionResult<PipelineResult> {
        let instances = self.expand(definition)?;
        let started = Instant::now();
        let max_parallel = self.config.effective_max_parallel(definition.job.max_parallel);
        let fail_fast = self.config.effective_fail_fast(definition.fail_fast);

        tracing::info!(
            pipeline = %definition.name,
            jobs = instances.len(),
            max_parallel,
            fail_fast,
            "pipeline started"
        );
        self.event_tx.send_event(ExecutionEvent::PipelineStarted {
            pipeline_name: definition.name.clone(),
            total_jobs: instances.len(),
            max_parallel,
        });

        let mut runner = JobRunner::new(Arc::clone(&self.services), &self.config);
        if let Some(tx) = &self.event_tx {
            runner = runner.with_progress(tx.clone());
        }
        let runner = Arc::new(runner);

        let semaphore = Arc::new(Semaphore::new(max_parallel));
        let halted = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();
        let mut results = Vec::with_capacity(instances.len());
        let mut dispatched = HashMap::new();

        for instance in instances {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };

            let skip_reason = match &permit {
                _ if cancel.is_cancelled() => Some("run was cancelled"),
                _ if halted.load(Ordering::SeqCst) => Some("fail-fast: an earlier job failed"),
                None => Some("scheduler closed"),
                Some(_) => None,
            };

            if let Some(reason) = skip_reason {
                tracing::info!(job = instance.index, reason, "job skipped");
                self.event_tx.send_event(ExecutionEvent::JobSkipped {
                    job_index: instance.index,
                    job_name: instance.display_name(),
                    reason: reason.to_string(),
                });
                results.push(JobResult::skipped(
                    instance.index,
                    instance.display_name(),
                    instance.binding.clone(),
                ));
                continue;
            }

            dispatched.insert(instance.index, instance.clone());

            let runner = Arc::clone(&runner);
            let halted = Arc::clone(&halted);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = runner.run(&instance, &cancel).await;
                // The flag must be visible before the permit frees a slot
                if fail_fast && result.status.is_failure() {
                    halted.store(true, Ordering::SeqCst);
                }
                drop(permit);
                result
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => {
                    dispatched.remove(&result.index);
                    results.push(result);
                }
                Err(e) => tracing::error!(error = %e, "job task failed"),
            }
        }

        // Tasks that panicked never produced a result
        for (index, instance) in dispatched {
            results.push(JobResult {
                index,
                name: instance.display_name(),
                binding: instance.binding.clone(),
                status: JobStatus::Errored,
                steps: Vec::new(),
                error: Some(JobError {
                    kind: JobErrorKind::ExecutorFault,
                    message: "job task panicked".to_string(),
                    source: None,
                }),
                duration_ms: 0,
            });
        }

        let mut report = aggregate(&definition.name, &definition.job.matrix, results);
        report.cancelled = cancel.is_cancelled();
        report.duration_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            pipeline = %definition.name,
            status = ?report.status,
            failed = report.failed_jobs().count(),
            "pipeline finished"
        );
        self.event_tx.send_event(ExecutionEvent::PipelineCompleted {
            pipeline_name: definition.name.clone(),
            success: report.is_success(),
            duration: started.elapsed(),
        });

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::definition::models::{Dimension, JobTemplate, MatrixSpec, StepSpec};
    use crate::error::DefinitionError;

    fn definition(script: &str) -> PipelineDefinition {
        PipelineDefinition {
            name: "ci".to_string(),
            fail_fast: false,
            job: JobTemplate {
                name: "test".to_string(),
                matrix: MatrixSpec {
                    dimensions: vec![Dimension {
                        name: "n".to_string(),
                        values: vec!["1".to_string(), "2".to_string(), "3".to_string()],
                    }],
                    exclude: vec![],
                },
                steps: vec![StepSpec {
                    name: "check".to_string(),
                    run: "sh".to_string(),
                    args: vec!["-c".to_string(), script.to_string()],
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn scheduler() -> MatrixScheduler {
        MatrixScheduler::new(EngineConfig::default())
            .with_services(Arc::new(ServiceManager::new(ServiceConfig::default())))
    }

    #[tokio::test]
    async fn test_run_all_jobs() {
        let result = scheduler()
            .run(&definition("test \"$MATRIX_N\" -gt 0"), CancelSignal::never())
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.jobs.len(), 3);
        let indices: Vec<usize> = result.jobs.iter().map(|j| j.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_without_fail_fast_every_job_runs() {
        let result = scheduler()
            .run(&definition("test \"$MATRIX_N\" != 1"), CancelSignal::never())
            .await
            .unwrap();

        assert!(!result.is_success());
        assert_eq!(result.count(JobStatus::Failed), 1);
        assert_eq!(result.count(JobStatus::Succeeded), 2);
        assert_eq!(result.count(JobStatus::Skipped), 0);
    }

    #[tokio::test]
    async fn test_definition_error_before_run() {
        let mut def = definition("true");
        def.job.steps[0].condition = Some("arch == 'x86'".to_string());

        let (tx, mut rx) = crate::execution::events::progress_channel();
        let err = scheduler()
            .with_progress(tx)
            .run(&def, CancelSignal::never())
            .await
            .unwrap_err();

        assert!(matches!(err, DefinitionError::UnknownDimension { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_skips_everything() {
        let (handle, signal) = crate::execution::cancel::cancel_pair();
        handle.cancel();

        let result = scheduler().run(&definition("true"), signal).await.unwrap();

        assert!(result.cancelled);
        assert_eq!(result.count(JobStatus::Skipped), 3);
        assert_eq!(result.exit_code(), 1);
    }
}
