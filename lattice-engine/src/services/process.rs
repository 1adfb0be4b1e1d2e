// Process Provider
// Runs a service as a local child process

use crate::error::ServiceError;
use crate::services::{tcp_probe, ServiceHandle, ServiceLaunch, ServiceProvider};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::process::{Child, Command};

const LOCALHOST: &str = "127.0.0.1";

/// Service provider that spawns the requirement's command on this host.
///
/// The command is expected to listen on `{port}`; readiness is a TCP probe.
#[derive(Default)]
pub struct ProcessProvider {
    children: Mutex<HashMap<String, Child>>,
}

impl ProcessProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of children still tracked
    pub fn running(&self) -> usize {
        self.children.lock().len()
    }
}

#[async_trait::async_trait]
impl ServiceProvider for ProcessProvider {
    async fn start(&self, launch: &ServiceLaunch) -> Result<ServiceHandle, ServiceError> {
        let Some((program, args)) = launch.command.split_first() else {
            return Err(ServiceError::acquisition(&launch.name, "empty command"));
        };

        let program = which::which(program).map_err(|e| {
            ServiceError::acquisition(&launch.name, format!("'{}' not found: {}", program, e))
        })?;

        let child = Command::new(program)
            .args(args)
            .envs(&launch.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ServiceError::acquisition(&launch.name, e.to_string()))?;

        tracing::debug!(service = %launch.name, pid = ?child.id(), "service process started");

        self.children.lock().insert(launch.instance_id.clone(), child);

        Ok(ServiceHandle {
            id: launch.instance_id.clone(),
            host: LOCALHOST.to_string(),
            port: launch.host_port,
        })
    }

    async fn health_check(
        &self,
        handle: &ServiceHandle,
        launch: &ServiceLaunch,
    ) -> Result<bool, ServiceError> {
        let exited = match self.children.lock().get_mut(&handle.id) {
            Some(child) => child.try_wait()?,
            None => return Err(ServiceError::acquisition(&launch.name, "process is gone")),
        };

        if let Some(status) = exited {
            return Err(ServiceError::acquisition(
                &launch.name,
                format!("process exited early with {}", status),
            ));
        }

        Ok(tcp_probe(&handle.host, handle.port).await)
    }

    async fn stop(&self, handle: &ServiceHandle) -> Result<(), ServiceError> {
        let child = self.children.lock().remove(&handle.id);
        if let Some(mut child) = child {
            if child.try_wait()?.is_none() {
                child.kill().await?;
            }
        }
        Ok(())
    }
}
