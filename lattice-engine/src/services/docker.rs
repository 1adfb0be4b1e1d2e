// Docker Provider
// Runs service containers through the docker CLI

use crate::error::ServiceError;
use crate::services::{tcp_probe, ServiceHandle, ServiceLaunch, ServiceProvider};

use std::process::Output;
use tokio::process::Command;

const LOCALHOST: &str = "127.0.0.1";

/// Service provider backed by `docker run -d`
pub struct DockerProvider {
    binary: String,
}

impl DockerProvider {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Check if Docker is available
    pub async fn is_available(&self) -> bool {
        self.docker(["version", "--format", "{{.Server.Version}}"])
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Arguments for `docker run`
    pub fn run_args(launch: &ServiceLaunch) -> Vec<String> {
        let short_id: String = launch.instance_id.chars().take(8).collect();
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            format!("lattice-{}-{}", launch.name, short_id),
            "--label".to_string(),
            format!("lattice.job={}", launch.owner),
        ];

        if let Some(container_port) = launch.container_port {
            args.push("-p".to_string());
            args.push(format!("{}:{}:{}", LOCALHOST, launch.host_port, container_port));
        }

        let mut env: Vec<_> = launch.env.iter().collect();
        env.sort();
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        if let Some(image) = &launch.image {
            args.push(image.clone());
        }
        args.extend(launch.command.iter().cloned());
        args
    }

    async fn docker<I, S>(&self, args: I) -> Result<Output, ServiceError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        Ok(Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?)
    }
}

#[async_trait::async_trait]
impl ServiceProvider for DockerProvider {
    async fn start(&self, launch: &ServiceLaunch) -> Result<ServiceHandle, ServiceError> {
        let output = self
            .docker(Self::run_args(launch))
            .await
            .map_err(|e| {
                ServiceError::acquisition(&launch.name, format!("docker is not available: {}", e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ServiceError::acquisition(&launch.name, stderr.trim()));
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        tracing::debug!(service = %launch.name, container = %id, "container started");

        Ok(ServiceHandle {
            id,
            host: LOCALHOST.to_string(),
            port: launch.host_port,
        })
    }

    async fn health_check(
        &self,
        handle: &ServiceHandle,
        launch: &ServiceLaunch,
    ) -> Result<bool, ServiceError> {
        let state = self
            .docker(["inspect", "-f", "{{.State.Running}}", handle.id.as_str()])
            .await?;
        if !state.status.success() || String::from_utf8_lossy(&state.stdout).trim() != "true" {
            return Err(ServiceError::acquisition(
                &launch.name,
                "container is not running",
            ));
        }

        if launch.health_cmd.is_empty() {
            return Ok(tcp_probe(&handle.host, handle.port).await);
        }

        let mut args = vec!["exec".to_string(), handle.id.clone()];
        args.extend(launch.health_cmd.iter().cloned());
        let probe = self.docker(args).await?;
        Ok(probe.status.success())
    }

    async fn stop(&self, handle: &ServiceHandle) -> Result<(), ServiceError> {
        let output = self.docker(["rm", "-f", "-v", handle.id.as_str()]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ServiceError::acquisition(&handle.id, stderr.trim()));
        }
        Ok(())
    }
}
