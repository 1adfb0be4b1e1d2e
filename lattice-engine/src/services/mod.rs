// Services Module
// Ephemeral service dependencies provisioned per job instance

pub mod docker;
pub mod manager;
pub mod ports;
pub mod process;

pub use docker::DockerProvider;
pub use manager::{ServiceInstance, ServiceManager};
pub use ports::{PortAllocator, PortLease};
pub use process::ProcessProvider;

use crate::definition::models::Credentials;
use crate::error::ServiceError;

use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;

/// Everything a provider needs to start one service instance
#[derive(Debug, Clone)]
pub struct ServiceLaunch {
    /// Service name from the requirement
    pub name: String,
    /// Unique per instance, used to name containers
    pub instance_id: String,
    /// Index of the owning job instance
    pub owner: usize,
    pub image: Option<String>,
    /// Command line with placeholders already substituted
    pub command: Vec<String>,
    /// Port the service listens on inside its container
    pub container_port: Option<u16>,
    /// Port reachable from the host
    pub host_port: u16,
    pub credentials: Credentials,
    pub namespace: String,
    /// Environment with placeholders already substituted
    pub env: HashMap<String, String>,
    pub health_cmd: Vec<String>,
}

/// Provider-specific reference to a started service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    /// Container id or process key
    pub id: String,
    pub host: String,
    pub port: u16,
}

/// Something that can start, probe and stop a service
#[async_trait::async_trait]
pub trait ServiceProvider: Send + Sync {
    async fn start(&self, launch: &ServiceLaunch) -> Result<ServiceHandle, ServiceError>;

    /// `Ok(false)` means "not ready yet"; `Err` means the service is gone
    async fn health_check(
        &self,
        handle: &ServiceHandle,
        launch: &ServiceLaunch,
    ) -> Result<bool, ServiceError>;

    async fn stop(&self, handle: &ServiceHandle) -> Result<(), ServiceError>;
}

/// True once something accepts TCP connections on `host:port`
pub async fn tcp_probe(host: &str, port: u16) -> bool {
    matches!(
        tokio::time::timeout(Duration::from_secs(1), TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}
