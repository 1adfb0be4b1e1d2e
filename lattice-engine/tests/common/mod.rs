// Shared fixtures for the scheduler scenarios

#![allow(dead_code)]

use lattice_engine::error::ServiceError;
use lattice_engine::services::{ServiceHandle, ServiceLaunch, ServiceProvider};
use lattice_engine::{
    from_yaml, EngineConfig, MatrixScheduler, PipelineDefinition, ServiceConfig, ServiceKind,
    ServiceManager,
};

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderMode {
    #[default]
    Ready,
    NeverReady,
    FailStart,
    /// Start takes `SLOW_START` and then the service is ready
    SlowStart,
}

pub const SLOW_START: Duration = Duration::from_millis(300);

/// In-memory provider that records every start and stop
#[derive(Default)]
pub struct CountingProvider {
    mode: ProviderMode,
    starts: AtomicUsize,
    stops: AtomicUsize,
    live: Mutex<HashSet<String>>,
    stopped_twice: AtomicUsize,
}

impl CountingProvider {
    pub fn new(mode: ProviderMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            ..Default::default()
        })
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Instances started and not yet stopped
    pub fn live(&self) -> usize {
        self.live.lock().len()
    }

    /// Stops for an instance that was not live
    pub fn double_stops(&self) -> usize {
        self.stopped_twice.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ServiceProvider for CountingProvider {
    async fn start(&self, launch: &ServiceLaunch) -> Result<ServiceHandle, ServiceError> {
        if self.mode == ProviderMode::FailStart {
            return Err(ServiceError::acquisition(&launch.name, "image pull failed"));
        }
        if self.mode == ProviderMode::SlowStart {
            tokio::time::sleep(SLOW_START).await;
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.live.lock().insert(launch.instance_id.clone());
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
        Ok(matches!(self.mode, ProviderMode::Ready | ProviderMode::SlowStart))
    }

    async fn stop(&self, handle: &ServiceHandle) -> Result<(), ServiceError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if !self.live.lock().remove(&handle.id) {
            self.stopped_twice.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

pub fn service_config() -> ServiceConfig {
    ServiceConfig::default()
        .with_startup_timeout(Duration::from_millis(200))
        .with_probe_interval(Duration::from_millis(10))
}

/// Scheduler whose `process` services are backed by `provider`
pub fn scheduler(provider: Arc<CountingProvider>, config: EngineConfig) -> MatrixScheduler {
    let config = config.with_service_config(service_config());
    let services = ServiceManager::new(config.service.clone())
        .with_provider(ServiceKind::Process, provider);
    MatrixScheduler::new(config).with_services(Arc::new(services))
}

pub fn definition(yaml: &str) -> PipelineDefinition {
    from_yaml(yaml).expect("fixture parses")
}
