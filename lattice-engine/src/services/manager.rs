// Service Lifecycle Manager
// Acquires and releases ephemeral services on behalf of job instances

use crate::config::ServiceConfig;
use crate::definition::models::{Credentials, ServiceKind, ServiceRequirement};
use crate::error::ServiceError;
use crate::execution::cancel::CancelSignal;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::matrix::env_key;
use crate::services::docker::DockerProvider;
use crate::services::ports::{PortAllocator, PortLease};
use crate::services::process::ProcessProvider;
use crate::services::{ServiceHandle, ServiceLaunch, ServiceProvider};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A running service owned by exactly one job instance
pub struct ServiceInstance {
    name: String,
    owner: usize,
    handle: ServiceHandle,
    credentials: Credentials,
    namespace: String,
    provider: Arc<dyn ServiceProvider>,
    lease: Mutex<Option<PortLease>>,
    released: AtomicBool,
    event_tx: Option<ProgressSender>,
}

impl std::fmt::Debug for ServiceInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceInstance")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("handle", &self.handle)
            .field("released", &self.is_released())
            .finish()
    }
}

impl ServiceInstance {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> usize {
        self.owner
    }

    pub fn host(&self) -> &str {
        &self.handle.host
    }

    pub fn port(&self) -> u16 {
        self.handle.port
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Connection details exported to the owning job's steps
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let prefix = env_key(&self.name);
        vec![
            (format!("{}_HOST", prefix), self.handle.host.clone()),
            (format!("{}_PORT", prefix), self.handle.port.to_string()),
            (format!("{}_USER", prefix), self.credentials.user.clone()),
            (
                format!("{}_PASSWORD", prefix),
                self.credentials.password.clone(),
            ),
            (format!("{}_NAMESPACE", prefix), self.namespace.clone()),
        ]
    }

    /// Stop the service and return its port. Only the first call does
    /// anything; stop failures are logged.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.provider.stop(&self.handle).await {
            tracing::warn!(
                service = %self.name,
                job = self.owner,
                error = %e,
                "failed to stop service"
            );
        }
        self.lease.lock().take();

        tracing::debug!(service = %self.name, job = self.owner, "service released");
        self.event_tx.send_event(ExecutionEvent::ServiceReleased {
            job_index: self.owner,
            service: self.name.clone(),
        });
    }
}

/// Stops a started-but-not-ready service if acquisition is abandoned
struct StartGuard {
    provider: Arc<dyn ServiceProvider>,
    handle: Option<ServiceHandle>,
}

impl StartGuard {
    fn disarm(mut self) {
        self.handle = None;
    }

    async fn stop(mut self, service: &str) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.provider.stop(&handle).await {
                tracing::warn!(service, error = %e, "failed to stop partially started service");
            }
        }
    }
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let provider = Arc::clone(&self.provider);
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        if let Err(e) = provider.stop(&handle).await {
                            tracing::warn!(
                                instance = %handle.id,
                                error = %e,
                                "failed to stop abandoned service"
                            );
                        }
                    });
                }
                Err(_) => tracing::warn!(
                    instance = %handle.id,
                    "no runtime to stop abandoned service"
                ),
            }
        }
    }
}

/// Service lifecycle manager
pub struct ServiceManager {
    providers: HashMap<ServiceKind, Arc<dyn ServiceProvider>>,
    ports: PortAllocator,
    config: ServiceConfig,
    event_tx: Option<ProgressSender>,
}

impl ServiceManager {
    /// A manager with no providers registered
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            providers: HashMap::new(),
            ports: PortAllocator::new(),
            config,
            event_tx: None,
        }
    }

    /// A manager with the docker and process providers registered
    pub fn with_default_providers(config: ServiceConfig) -> Self {
        let docker = DockerProvider::new(config.docker_binary.clone());
        Self::new(config)
            .with_provider(ServiceKind::Docker, Arc::new(docker))
            .with_provider(ServiceKind::Process, Arc::new(ProcessProvider::new()))
    }

    pub fn with_provider(mut self, kind: ServiceKind, provider: Arc<dyn ServiceProvider>) -> Self {
        self.providers.insert(kind, provider);
        self
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Start a service for job `owner` and wait until it is ready.
    ///
    /// On any failure the partially started service is stopped and its port
    /// returned before the error is returned. `cancel` is only honoured once
    /// the provider's `start` has returned, so a started service always has
    /// a guard to stop it.
    pub async fn acquire(
        &self,
        requirement: &ServiceRequirement,
        owner: usize,
        cancel: &CancelSignal,
    ) -> Result<ServiceInstance, ServiceError> {
        let provider = self
            .providers
            .get(&requirement.kind)
            .cloned()
            .ok_or_else(|| ServiceError::UnknownProvider(requirement.kind.to_string()))?;

        let lease = self.ports.allocate()?;
        let launch = self.launch_for(requirement, owner, lease.port());
        let timeout = requirement
            .startup_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.startup_timeout);

        tracing::info!(
            service = %launch.name,
            job = owner,
            port = launch.host_port,
            kind = %requirement.kind,
            "starting service"
        );
        self.event_tx.send_event(ExecutionEvent::ServiceStarting {
            job_index: owner,
            service: launch.name.clone(),
            port: launch.host_port,
        });

        let started = Instant::now();
        let handle = provider.start(&launch).await.map_err(|e| match e {
            failure @ ServiceError::AcquisitionFailure { .. } => failure,
            other => ServiceError::acquisition(&launch.name, other.to_string()),
        })?;

        let guard = StartGuard {
            provider: Arc::clone(&provider),
            handle: Some(handle.clone()),
        };

        let ready = if cancel.is_cancelled() {
            None
        } else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                ready = tokio::time::timeout(
                    timeout,
                    self.wait_ready(&*provider, &handle, &launch),
                ) => Some(ready),
            }
        };

        let Some(ready) = ready else {
            tracing::info!(service = %launch.name, job = owner, "service startup cancelled");
            guard.stop(&launch.name).await;
            return Err(ServiceError::Cancelled(launch.name.clone()));
        };

        match ready {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(service = %launch.name, job = owner, error = %e, "service failed");
                guard.stop(&launch.name).await;
                return Err(match e {
                    failure @ ServiceError::AcquisitionFailure { .. } => failure,
                    other => ServiceError::acquisition(&launch.name, other.to_string()),
                });
            }
            Err(_) => {
                tracing::warn!(service = %launch.name, job = owner, ?timeout, "service not ready in time");
                guard.stop(&launch.name).await;
                return Err(ServiceError::StartupTimeout {
                    service: launch.name.clone(),
                    timeout,
                });
            }
        }

        guard.disarm();
        let duration = started.elapsed();
        tracing::info!(service = %launch.name, job = owner, ?duration, "service ready");
        self.event_tx.send_event(ExecutionEvent::ServiceReady {
            job_index: owner,
            service: launch.name.clone(),
            port: handle.port,
            duration,
        });

        Ok(ServiceInstance {
            name: launch.name,
            owner,
            handle,
            credentials: launch.credentials,
            namespace: launch.namespace,
            provider,
            lease: Mutex::new(Some(lease)),
            released: AtomicBool::new(false),
            event_tx: self.event_tx.clone(),
        })
    }

    /// Release an instance; safe to call any number of times
    pub async fn release(&self, instance: &ServiceInstance) {
        instance.release().await;
    }

    async fn wait_ready(
        &self,
        provider: &dyn ServiceProvider,
        handle: &ServiceHandle,
        launch: &ServiceLaunch,
    ) -> Result<(), ServiceError> {
        loop {
            if provider.health_check(handle, launch).await? {
                return Ok(());
            }
            tokio::time::sleep(self.config.probe_interval).await;
        }
    }

    fn launch_for(&self, requirement: &ServiceRequirement, owner: usize, port: u16) -> ServiceLaunch {
        let instance_id = uuid::Uuid::new_v4().simple().to_string();
        let short_id = &instance_id[..8];

        let credentials = requirement.credentials.clone().unwrap_or_else(|| Credentials {
            user: "lattice".to_string(),
            password: uuid::Uuid::new_v4().simple().to_string(),
        });
        let namespace = requirement
            .namespace
            .clone()
            .unwrap_or_else(|| format!("lattice-{}", short_id));

        let fill = |template: &str| {
            template
                .replace("{user}", &credentials.user)
                .replace("{password}", &credentials.password)
                .replace("{namespace}", &namespace)
                .replace("{port}", &port.to_string())
        };

        let env = requirement
            .env
            .iter()
            .map(|(k, v)| (k.clone(), fill(v.as_str())))
            .collect();
        let command = requirement.command.iter().map(|arg| fill(arg.as_str())).collect();

        ServiceLaunch {
            name: requirement.name.clone(),
            owner,
            image: requirement.image.clone(),
            command,
            container_port: requirement.port,
            host_port: port,
            env,
            health_cmd: requirement.health_cmd.clone(),
            credentials,
            namespace,
            instance_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::cancel::cancel_pair;
    use std::sync::atomic::AtomicUsize;

    /// Provider double: ready after `ready_after` probes, or never
    #[derive(Default)]
    struct FakeProvider {
        starts: AtomicUsize,
        stops: AtomicUsize,
        probes: AtomicUsize,
        ready_after: Option<usize>,
        fail_start: bool,
        fail_stop: bool,
        start_delay: Option<Duration>,
    }

    #[async_trait::async_trait]
    impl ServiceProvider for FakeProvider {
        async fn start(&self, launch: &ServiceLaunch) -> Result<ServiceHandle, ServiceError> {
            if let Some(delay) = self.start_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_start {
                return Err(ServiceError::acquisition(&launch.name, "image not found"));
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(ServiceHandle {
                id: launch.instance_id.clone(),
                host: "127.0.0.1".to_string(),
                port: launch.host_port,
            })
        }

        async fn health_check(
            &self,
            _handle: &ServiceHandle,
            _launch: &ServiceLaunch,
        ) -> Result<bool, ServiceError> {
            let probes = self.probes.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(self.ready_after.is_some_and(|n| probes >= n))
        }

        async fn stop(&self, _handle: &ServiceHandle) -> Result<(), ServiceError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if self.fail_stop {
                return Err(ServiceError::acquisition("rabbit-mq", "container is gone"));
            }
            Ok(())
        }
    }

    fn config() -> ServiceConfig {
        ServiceConfig::default()
            .with_startup_timeout(Duration::from_millis(300))
            .with_probe_interval(Duration::from_millis(10))
    }

    fn requirement() -> ServiceRequirement {
        ServiceRequirement {
            name: "rabbit-mq".to_string(),
            kind: ServiceKind::Process,
            command: vec!["broker".to_string(), "--port={port}".to_string()],
            env: HashMap::from([("VHOST".to_string(), "{namespace}".to_string())]),
            ..Default::default()
        }
    }

    fn manager(provider: Arc<FakeProvider>) -> ServiceManager {
        ServiceManager::new(config()).with_provider(ServiceKind::Process, provider)
    }

    #[tokio::test]
    async fn test_acquire_and_release_once() {
        let provider = Arc::new(FakeProvider {
            ready_after: Some(3),
            ..Default::default()
        });
        let manager = manager(Arc::clone(&provider));

        let instance = manager.acquire(&requirement(), 4, &CancelSignal::never()).await.unwrap();
        assert_eq!(instance.owner(), 4);
        assert!(manager.ports().is_leased(instance.port()));
        assert_eq!(provider.probes.load(Ordering::SeqCst), 3);

        manager.release(&instance).await;
        manager.release(&instance).await;
        instance.release().await;

        assert!(instance.is_released());
        assert_eq!(provider.starts.load(Ordering::SeqCst), 1);
        assert_eq!(provider.stops.load(Ordering::SeqCst), 1);
        assert_eq!(manager.ports().leased(), 0);
    }

    #[tokio::test]
    async fn test_startup_timeout_stops_service() {
        let provider = Arc::new(FakeProvider::default());
        let manager = manager(Arc::clone(&provider));

        let err = manager.acquire(&requirement(), 0, &CancelSignal::never()).await.unwrap_err();
        assert!(matches!(err, ServiceError::StartupTimeout { ref service, .. } if service == "rabbit-mq"));
        assert_eq!(provider.starts.load(Ordering::SeqCst), 1);
        assert_eq!(provider.stops.load(Ordering::SeqCst), 1);
        assert_eq!(manager.ports().leased(), 0);
    }

    #[tokio::test]
    async fn test_start_failure_returns_port() {
        let provider = Arc::new(FakeProvider {
            fail_start: true,
            ..Default::default()
        });
        let manager = manager(Arc::clone(&provider));

        let err = manager.acquire(&requirement(), 0, &CancelSignal::never()).await.unwrap_err();
        assert!(matches!(err, ServiceError::AcquisitionFailure { .. }));
        assert_eq!(provider.stops.load(Ordering::SeqCst), 0);
        assert_eq!(manager.ports().leased(), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_slow_start_stops_service() {
        let provider = Arc::new(FakeProvider {
            ready_after: Some(1),
            start_delay: Some(Duration::from_millis(150)),
            ..Default::default()
        });
        let manager = manager(Arc::clone(&provider));
        let (handle, signal) = cancel_pair();

        let req = requirement();
        let acquire = manager.acquire(&req, 2, &signal);
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            handle.cancel();
        };
        let (result, _) = tokio::join!(acquire, cancel);

        assert!(matches!(result, Err(ServiceError::Cancelled(ref name)) if name == "rabbit-mq"));
        assert_eq!(provider.starts.load(Ordering::SeqCst), 1);
        assert_eq!(provider.stops.load(Ordering::SeqCst), 1);
        assert_eq!(manager.ports().leased(), 0);
    }

    #[tokio::test]
    async fn test_already_cancelled_still_stops_started_service() {
        let provider = Arc::new(FakeProvider {
            ready_after: Some(1),
            ..Default::default()
        });
        let manager = manager(Arc::clone(&provider));
        let (handle, signal) = cancel_pair();
        handle.cancel();

        let err = manager.acquire(&requirement(), 0, &signal).await.unwrap_err();
        assert!(matches!(err, ServiceError::Cancelled(_)));
        assert_eq!(provider.probes.load(Ordering::SeqCst), 0);
        assert_eq!(provider.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_guard_still_stops_when_stop_fails() {
        let provider = Arc::new(FakeProvider {
            fail_stop: true,
            ..Default::default()
        });
        let guard = StartGuard {
            provider: Arc::clone(&provider) as Arc<dyn ServiceProvider>,
            handle: Some(ServiceHandle {
                id: "abc".to_string(),
                host: "127.0.0.1".to_string(),
                port: 1,
            }),
        };
        drop(guard);

        for _ in 0..50 {
            if provider.stops.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(provider.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let manager = ServiceManager::new(config());
        let err = manager.acquire(&requirement(), 0, &CancelSignal::never()).await.unwrap_err();
        assert!(matches!(err, ServiceError::UnknownProvider(ref kind) if kind == "process"));
    }

    #[tokio::test]
    async fn test_env_vars_and_placeholders() {
        let provider = Arc::new(FakeProvider {
            ready_after: Some(1),
            ..Default::default()
        });
        let manager = manager(provider);

        let instance = manager.acquire(&requirement(), 0, &CancelSignal::never()).await.unwrap();
        let env: HashMap<String, String> = instance.env_vars().into_iter().collect();

        assert_eq!(env["RABBIT_MQ_HOST"], "127.0.0.1");
        assert_eq!(env["RABBIT_MQ_PORT"], instance.port().to_string());
        assert_eq!(env["RABBIT_MQ_USER"], "lattice");
        assert!(!env["RABBIT_MQ_PASSWORD"].is_empty());
        assert!(env["RABBIT_MQ_NAMESPACE"].starts_with("lattice-"));

        let launch = manager.launch_for(&requirement(), 0, 5000);
        assert_eq!(launch.command, vec!["broker", "--port=5000"]);
        assert_eq!(launch.env["VHOST"], launch.namespace);

        instance.release().await;
    }

    #[tokio::test]
    async fn test_generated_credentials_differ_per_instance() {
        let manager = ServiceManager::new(config());
        let a = manager.launch_for(&requirement(), 0, 1000);
        let b = manager.launch_for(&requirement(), 1, 1001);
        assert_ne!(a.credentials.password, b.credentials.password);
        assert_ne!(a.namespace, b.namespace);
        assert_ne!(a.instance_id, b.instance_id);
    }
}
