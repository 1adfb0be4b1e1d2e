// Job Runner
// Drives one job instance: provisioning, ordered steps and teardown

use crate::config::EngineConfig;
use crate::error::ServiceError;
use crate::execution::cancel::CancelSignal;
use crate::execution::events::{EventSender, ExecutionEvent, JobState, ProgressSender};
use crate::execution::matrix::JobInstance;
use crate::execution::report::{JobError, JobErrorKind, JobResult, JobStatus};
use crate::expression::render_template;
use crate::runners::{SkipReason, StepExecutor, StepResult, StepStatus};
use crate::services::{ServiceInstance, ServiceManager};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Services acquired by one job, released in reverse acquisition order.
///
/// If the scope is dropped without [`ServiceScope::release`] having finished
/// (the job future was dropped or panicked), the remaining instances are
/// released on a spawned task.
#[derive(Default)]
pub struct ServiceScope {
    instances: Vec<Arc<ServiceInstance>>,
    released: bool,
}

impl ServiceScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, instance: ServiceInstance) {
        self.instances.push(Arc::new(instance));
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Connection variables of every acquired service
    pub fn env_vars(&self) -> Vec<(String, String)> {
        self.instances.iter().flat_map(|i| i.env_vars()).collect()
    }

    pub async fn release(mut self) {
        for instance in self.instances.iter().rev() {
            instance.release().await;
        }
        self.released = true;
    }
}

impl Drop for ServiceScope {
    fn drop(&mut self) {
        if self.released || self.instances.is_empty() {
            return;
        }
        let instances = std::mem::take(&mut self.instances);
        tracing::warn!(count = instances.len(), "service scope dropped, releasing in background");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    for instance in instances.iter().rev() {
                        instance.release().await;
                    }
                });
            }
            Err(_) => {
                for instance in &instances {
                    tracing::warn!(
                        service = instance.name(),
                        job = instance.owner(),
                        "no runtime to release service"
                    );
                }
            }
        }
    }
}

/// Emits a `JobStateChanged` event for every transition
struct StateTracker<'a> {
    job_index: usize,
    state: JobState,
    event_tx: &'a Option<ProgressSender>,
}

impl StateTracker<'_> {
    fn transition(&mut self, to: JobState) {
        if self.state == to || self.state.is_terminal() {
            return;
        }
        tracing::debug!(job = self.job_index, from = %self.state, to = %to, "job state");
        self.event_tx
            .send_event(ExecutionEvent::state_changed(self.job_index, self.state, to));
        self.state = to;
    }
}

/// Runs job instances against a shared service manager
pub struct JobRunner {
    services: Arc<ServiceManager>,
    output_limit: usize,
    default_step_timeout: Option<Duration>,
    event_tx: Option<ProgressSender>,
}

impl JobRunner {
    pub fn new(services: Arc<ServiceManager>, config: &EngineConfig) -> Self {
        Self {
            services,
            output_limit: config.output_limit,
            default_step_timeout: config.default_step_timeout,
            event_tx: None,
        }
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Run one job instance to a terminal state.
    ///
    /// Every acquired service is released before this returns, whichever way
    /// the job ends.
    pub async fn run(&self, instance: &JobInstance, cancel: &CancelSignal) -> JobResult {
        let started = Instant::now();
        let plan = &instance.plan;
        let name = instance.display_name();
        let mut tracker = StateTracker {
            job_index: instance.index,
            state: JobState::Pending,
            event_tx: &self.event_tx,
        };

        tracing::info!(job = instance.index, binding = %instance.binding, "job started");
        self.event_tx.send_event(ExecutionEvent::JobStarted {
            job_index: instance.index,
            job_name: name.clone(),
            total_steps: plan.steps.len(),
        });

        let mut steps = Vec::with_capacity(plan.steps.len());
        let mut scope = ServiceScope::new();

        let outcome = match self.provision(instance, cancel, &mut tracker, &mut scope).await {
            Ok(()) => {
                tracker.transition(JobState::Running);
                self.run_steps(instance, cancel, &scope, &mut steps).await
            }
            Err(error) => Err(error),
        };

        scope.release().await;

        let (status, error) = match outcome {
            Ok(status) => {
                tracker.transition(JobState::Completed);
                (status, None)
            }
            Err(error) => {
                // Steps that never got a result are aborted
                for step in plan.steps.iter().skip(steps.len()) {
                    let skipped =
                        self.skip(instance.index, steps.len(), &step.spec.name, SkipReason::Aborted);
                    steps.push(skipped);
                }
                tracker.transition(JobState::Errored);
                (JobStatus::Errored, Some(error))
            }
        };

        let duration = started.elapsed();
        match &error {
            Some(e) => {
                tracing::warn!(job = instance.index, kind = ?e.kind, error = %e.message, "job errored")
            }
            None => {
                tracing::info!(job = instance.index, status = %status, ?duration, "job finished")
            }
        }
        self.event_tx
            .send_event(ExecutionEvent::job_completed(instance.index, &name, status, duration));

        JobResult {
            index: instance.index,
            name,
            binding: instance.binding.clone(),
            status,
            steps,
            error,
            duration_ms: duration.as_millis() as u64,
        }
    }

    async fn provision(
        &self,
        instance: &JobInstance,
        cancel: &CancelSignal,
        tracker: &mut StateTracker<'_>,
        scope: &mut ServiceScope,
    ) -> Result<(), JobError> {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        tracker.transition(JobState::Provisioning);

        for requirement in &instance.plan.services {
            let acquired = self
                .services
                .acquire(requirement, instance.index, cancel)
                .await
                .map_err(service_error)?;
            scope.push(acquired);
        }

        Ok(())
    }

    /// Run steps in order; `Err` means the job must end `Errored`
    async fn run_steps(
        &self,
        instance: &JobInstance,
        cancel: &CancelSignal,
        scope: &ServiceScope,
        results: &mut Vec<StepResult>,
    ) -> Result<JobStatus, JobError> {
        let plan = &instance.plan;
        let env = self.job_env(instance, scope)?;
        let executor = StepExecutor::new(self.output_limit)
            .with_default_timeout(plan.timeout.or(self.default_step_timeout))
            .with_events(instance.index, self.event_tx.clone());

        let mut stopped = false;
        let mut job_failed = false;

        for (index, step) in plan.steps.iter().enumerate() {
            let name = &step.spec.name;

            if stopped && !step.spec.always {
                results.push(self.skip(instance.index, index, name, SkipReason::PriorFailure));
                continue;
            }

            self.event_tx.send_event(ExecutionEvent::StepStarted {
                job_index: instance.index,
                step_name: name.clone(),
                step_index: index,
            });

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                outcome = executor.run(step, &instance.binding, &env) => Some(outcome),
            };

            let result = match outcome {
                None => {
                    tracing::info!(job = instance.index, step = %name, "step cancelled");
                    results.push(self.skip(instance.index, index, name, SkipReason::Aborted));
                    return Err(cancelled());
                }
                Some(Err(e)) => {
                    tracing::error!(job = instance.index, step = %name, error = %e, "executor fault");
                    results.push(self.skip(instance.index, index, name, SkipReason::Aborted));
                    return Err(JobError {
                        kind: JobErrorKind::ExecutorFault,
                        message: e.to_string(),
                        source: Some(name.clone()),
                    });
                }
                Some(Ok(result)) => result,
            };

            if let Some(reason) = skip_reason(&result) {
                self.event_tx.send_event(ExecutionEvent::StepSkipped {
                    job_index: instance.index,
                    step_name: name.clone(),
                    step_index: index,
                    reason,
                });
            } else {
                self.event_tx.send_event(ExecutionEvent::step_completed(
                    instance.index,
                    name,
                    index,
                    result.status,
                    Duration::from_millis(result.duration_ms),
                    result.exit_code,
                ));
            }

            if result.status.is_failed() {
                if step.spec.continue_on_error {
                    tracing::info!(job = instance.index, step = %name, "step failed, continuing");
                } else {
                    tracing::info!(
                        job = instance.index,
                        step = %name,
                        status = %result.status,
                        "step failed"
                    );
                    stopped = true;
                    job_failed = true;
                }
            }

            results.push(result);
        }

        Ok(if job_failed {
            JobStatus::Failed
        } else {
            JobStatus::Succeeded
        })
    }

    /// Base step environment: matrix values, service connection details,
    /// then the job's own variables
    fn job_env(
        &self,
        instance: &JobInstance,
        scope: &ServiceScope,
    ) -> Result<BTreeMap<String, String>, JobError> {
        let mut env: BTreeMap<String, String> = instance.binding.env_vars().into_iter().collect();
        env.extend(scope.env_vars());

        for (key, template) in &instance.plan.env {
            let value = render_template(template, &instance.binding).map_err(|e| JobError {
                kind: JobErrorKind::ExecutorFault,
                message: format!("job env '{}': {}", key, e),
                source: None,
            })?;
            env.insert(key.clone(), value);
        }

        Ok(env)
    }

    fn skip(
        &self,
        job_index: usize,
        step_index: usize,
        name: &str,
        reason: SkipReason,
    ) -> StepResult {
        self.event_tx.send_event(ExecutionEvent::StepSkipped {
            job_index,
            step_name: name.to_string(),
            step_index,
            reason,
        });
        StepResult::skipped(name, reason)
    }
}

fn skip_reason(result: &StepResult) -> Option<SkipReason> {
    match result.status {
        StepStatus::Skipped { reason } => Some(reason),
        _ => None,
    }
}

fn cancelled() -> JobError {
    JobError {
        kind: JobErrorKind::Cancelled,
        message: "run was cancelled".to_string(),
        source: None,
    }
}

fn service_error(error: ServiceError) -> JobError {
    let (kind, source) = match &error {
        ServiceError::StartupTimeout { service, .. } => {
            (JobErrorKind::ServiceStartupTimeout, Some(service.clone()))
        }
        ServiceError::AcquisitionFailure { service, .. } => {
            (JobErrorKind::ServiceAcquisition, Some(service.clone()))
        }
        ServiceError::Cancelled(service) => (JobErrorKind::Cancelled, Some(service.clone())),
        _ => (JobErrorKind::ServiceAcquisition, None),
    };
    JobError {
        kind,
        message: error.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::definition::models::StepSpec;
    use crate::definition::validator::PlannedStep;
    use crate::execution::cancel::cancel_pair;
    use crate::execution::matrix::{JobPlan, MatrixBinding};
    use crate::runners::FailureKind;

    fn sh(name: &str, script: &str) -> PlannedStep {
        PlannedStep::unconditional(StepSpec {
            name: name.to_string(),
            run: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ..Default::default()
        })
    }

    fn instance(steps: Vec<PlannedStep>) -> JobInstance {
        JobInstance {
            index: 0,
            binding: MatrixBinding::from_pairs([("channel", "stable")]),
            plan: Arc::new(JobPlan {
                name: "test".to_string(),
                steps,
                services: vec![],
                env: BTreeMap::from([(
                    "LABEL".to_string(),
                    "ch-${{ channel }}".to_string(),
                )]),
                timeout: None,
            }),
        }
    }

    fn runner() -> JobRunner {
        let services = Arc::new(ServiceManager::new(ServiceConfig::default()));
        JobRunner::new(services, &EngineConfig::default())
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let job = instance(vec![sh("a", "true"), sh("b", "test \"$LABEL\" = ch-stable")]);
        let result = runner().run(&job, &CancelSignal::never()).await;

        assert_eq!(result.status, JobStatus::Succeeded);
        assert_eq!(result.steps.len(), 2);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_failure_stops_sequence_but_always_runs() {
        let mut cleanup = sh("cleanup", "true");
        cleanup.spec.always = true;
        let job = instance(vec![sh("build", "exit 1"), sh("test", "true"), cleanup]);

        let result = runner().run(&job, &CancelSignal::never()).await;

        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(
            result.steps[0].status,
            StepStatus::Failed {
                kind: FailureKind::NonZeroExit
            }
        );
        assert_eq!(
            result.steps[1].status,
            StepStatus::Skipped {
                reason: SkipReason::PriorFailure
            }
        );
        assert_eq!(result.steps[2].status, StepStatus::Succeeded);
        assert_eq!(result.first_failed_step().map(|s| s.name.as_str()), Some("build"));
    }

    #[tokio::test]
    async fn test_continue_on_error() {
        let mut lint = sh("lint", "exit 2");
        lint.spec.continue_on_error = true;
        let job = instance(vec![lint, sh("test", "true")]);

        let result = runner().run(&job, &CancelSignal::never()).await;

        assert_eq!(result.status, JobStatus::Succeeded);
        assert!(result.steps[0].status.is_failed());
        assert_eq!(result.steps[1].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_cancellation_errors_job() {
        let job = instance(vec![sh("slow", "exec sleep 30"), sh("after", "true")]);
        let (handle, signal) = cancel_pair();
        let runner = runner();

        let run = runner.run(&job, &signal);
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            handle.cancel();
        };
        let (result, _) = tokio::join!(run, cancel);

        assert_eq!(result.status, JobStatus::Errored);
        assert_eq!(result.error.as_ref().map(|e| e.kind), Some(JobErrorKind::Cancelled));
        assert_eq!(result.steps.len(), 2);
        assert!(result
            .steps
            .iter()
            .all(|s| s.status == StepStatus::Skipped { reason: SkipReason::Aborted }));
    }

    #[tokio::test]
    async fn test_state_transitions_emitted() {
        let (tx, mut rx) = crate::execution::events::progress_channel();
        let job = instance(vec![sh("a", "true")]);
        runner()
            .with_progress(tx)
            .run(&job, &CancelSignal::never())
            .await;

        let mut transitions = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ExecutionEvent::JobStateChanged { to, .. } = event {
                transitions.push(to);
            }
        }
        assert_eq!(
            transitions,
            vec![JobState::Provisioning, JobState::Running, JobState::Completed]
        );
    }
}
