// Engine Configuration
// Runtime settings for the scheduler, step executor and service manager

use std::time::Duration;

/// Matrix cells run concurrently when neither the caller nor the
/// definition says otherwise
pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// Bytes of step output kept per step
pub const DEFAULT_OUTPUT_LIMIT: usize = 1024 * 1024;

/// Engine configuration
///
/// Values set here override the definition (`max_parallel`, `fail_fast`);
/// anything left unset falls back to the definition, then to the defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Overrides `job.max_parallel`
    pub max_parallel: Option<usize>,
    /// Overrides the definition's `fail_fast` flag
    pub fail_fast: Option<bool>,
    /// Step timeout when neither the step nor the job sets one
    pub default_step_timeout: Option<Duration>,
    /// Maximum captured output per step, in bytes
    pub output_limit: usize,
    /// Service lifecycle settings
    pub service: ServiceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: None,
            fail_fast: None,
            default_step_timeout: Some(Duration::from_secs(60 * 60)),
            output_limit: DEFAULT_OUTPUT_LIMIT,
            service: ServiceConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = Some(max_parallel);
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = Some(fail_fast);
        self
    }

    pub fn with_default_step_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_step_timeout = timeout;
        self
    }

    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit = bytes;
        self
    }

    pub fn with_service_config(mut self, service: ServiceConfig) -> Self {
        self.service = service;
        self
    }

    /// Concurrency limit for a run, never below one
    pub fn effective_max_parallel(&self, from_definition: Option<usize>) -> usize {
        self.max_parallel
            .or(from_definition)
            .unwrap_or(DEFAULT_MAX_PARALLEL)
            .max(1)
    }

    pub fn effective_fail_fast(&self, from_definition: bool) -> bool {
        self.fail_fast.unwrap_or(from_definition)
    }
}

/// Service lifecycle settings
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// How long a service may take to pass its readiness probe
    pub startup_timeout: Duration,
    /// Delay between readiness probes
    pub probe_interval: Duration,
    /// Docker CLI executable
    pub docker_binary: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(60),
            probe_interval: Duration::from_millis(500),
            docker_binary: "docker".to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn with_docker_binary(mut self, binary: impl Into<String>) -> Self {
        self.docker_binary = binary.into();
        self
    }
}
