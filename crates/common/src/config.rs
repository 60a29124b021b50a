//! Configuration structures for TokenLoom
//!
//! One top-level config covers both halves of the system: the options the
//! supervisor resolves per model load (and forwards to the runner as launch
//! flags), and the supervisor's own monitoring knobs. Configurations are
//! loaded from YAML files and individual fields can be overridden by
//! environment variables.

use crate::error::{LoomError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for TokenLoom components
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoomConfig {
    /// Address the runner binds its loopback server to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Runner load options
    #[serde(default)]
    pub runner: RunnerSettings,

    /// Supervisor monitoring knobs
    #[serde(default)]
    pub supervisor: SupervisorSettings,

    /// Observability configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

/// Options resolved per model load. The supervisor derives the runner's
/// launch flags from these; the runner consumes them from its command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSettings {
    /// Number of sequences handled simultaneously (slot count)
    #[serde(default = "default_parallel")]
    pub parallel: usize,

    /// Maximum batch entries contributed per sequence per cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Context (KV cache) size per slot, in inputs
    #[serde(default = "default_ctx_size")]
    pub ctx_size: usize,

    /// Number of layers to offload to GPU; negative means as many as fit
    #[serde(default = "default_gpu_layers")]
    pub n_gpu_layers: i32,

    /// Index of the GPU hosting non-repeating tensors
    #[serde(default)]
    pub main_gpu: usize,

    /// Threads used during generation (0 = CPU count)
    #[serde(default)]
    pub threads: usize,

    /// Enable flash attention when the backend supports it
    #[serde(default)]
    pub flash_attention: bool,

    /// Do not memory-map the model file
    #[serde(default)]
    pub no_mmap: bool,

    /// Lock model pages in RAM
    #[serde(default)]
    pub mlock: bool,

    /// Optimize the slot-reuse policy for many distinct users
    #[serde(default)]
    pub multiuser_cache: bool,

    /// LoRA adapter to apply, if any
    pub lora: Option<PathBuf>,

    /// Vision projector weights, if any
    pub projector: Option<PathBuf>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            parallel: default_parallel(),
            batch_size: default_batch_size(),
            ctx_size: default_ctx_size(),
            n_gpu_layers: default_gpu_layers(),
            main_gpu: 0,
            threads: 0,
            flash_attention: false,
            no_mmap: false,
            mlock: false,
            multiuser_cache: false,
            lora: None,
            projector: None,
        }
    }
}

/// Supervisor monitoring knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSettings {
    /// Maximum time without load progress before the launch fails
    #[serde(default = "default_load_timeout")]
    pub load_timeout_secs: u64,

    /// Interval between health probes during readiness and serving
    #[serde(default = "default_health_poll")]
    pub health_poll_ms: u64,

    /// Retries when the runner reports no slot available
    #[serde(default = "default_no_slot_retries")]
    pub no_slot_retries: u32,

    /// Backoff between no-slot retries
    #[serde(default = "default_no_slot_backoff")]
    pub no_slot_backoff_ms: u64,

    /// Extra VRAM reserved per GPU beyond the driver's own floor
    #[serde(default)]
    pub gpu_overhead_bytes: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            load_timeout_secs: default_load_timeout(),
            health_poll_ms: default_health_poll(),
            no_slot_retries: default_no_slot_retries(),
            no_slot_backoff_ms: default_no_slot_backoff(),
            gpu_overhead_bytes: 0,
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable Prometheus metrics
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,
}

impl LoomConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            LoomError::config(format!(
                "failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: LoomConfig = serde_yaml::from_str(&content).map_err(|e| {
            LoomError::config(format!(
                "failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment-variable overrides (`LOOM_PARALLEL`,
    /// `LOOM_CTX_SIZE`, `LOOM_LOAD_TIMEOUT_SECS`)
    pub fn apply_env(mut self) -> Result<Self> {
        if let Ok(v) = std::env::var("LOOM_PARALLEL") {
            self.runner.parallel = v
                .parse()
                .map_err(|_| LoomError::config("invalid LOOM_PARALLEL"))?;
        }
        if let Ok(v) = std::env::var("LOOM_CTX_SIZE") {
            self.runner.ctx_size = v
                .parse()
                .map_err(|_| LoomError::config("invalid LOOM_CTX_SIZE"))?;
        }
        if let Ok(v) = std::env::var("LOOM_LOAD_TIMEOUT_SECS") {
            self.supervisor.load_timeout_secs = v
                .parse()
                .map_err(|_| LoomError::config("invalid LOOM_LOAD_TIMEOUT_SECS"))?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.runner.validate()?;
        if self.supervisor.load_timeout_secs == 0 {
            return Err(LoomError::config("load_timeout_secs must be positive"));
        }
        Ok(())
    }
}

impl Default for LoomConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            runner: RunnerSettings::default(),
            supervisor: SupervisorSettings::default(),
            observability: None,
        }
    }
}

impl RunnerSettings {
    /// Validate runner options
    pub fn validate(&self) -> Result<()> {
        if self.parallel == 0 {
            return Err(LoomError::config("parallel must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(LoomError::config("batch_size must be at least 1"));
        }
        if self.ctx_size < 2 {
            return Err(LoomError::config(
                "ctx_size must leave room for at least one eviction",
            ));
        }
        Ok(())
    }
}

impl SupervisorSettings {
    /// Get the load stall window as a Duration
    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }

    /// Get the health-probe interval as a Duration
    pub fn health_poll(&self) -> Duration {
        Duration::from_millis(self.health_poll_ms)
    }

    /// Get the no-slot retry backoff as a Duration
    pub fn no_slot_backoff(&self) -> Duration {
        Duration::from_millis(self.no_slot_backoff_ms)
    }
}

/// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_parallel() -> usize {
    1
}

fn default_batch_size() -> usize {
    512
}

fn default_ctx_size() -> usize {
    2048
}

fn default_gpu_layers() -> i32 {
    -1
}

fn default_load_timeout() -> u64 {
    300
}

fn default_health_poll() -> u64 {
    100
}

fn default_no_slot_retries() -> u32 {
    6
}

fn default_no_slot_backoff() -> u64 {
    50
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}
