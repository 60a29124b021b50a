//! Contract with the model-load scheduler.
//!
//! The policy deciding which model lands on which GPU, and when a runner
//! is evicted, lives outside this crate. What it needs from the supervisor
//! is this call surface: obtain a runner for a model (launching one if
//! necessary), mark one expired, and enumerate what is loaded with its
//! memory estimates for process listings.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use tokenloom_common::{Result, RunnerSettings};

use crate::memory::MemoryEstimate;
use crate::process::RunnerProcess;

/// A resolved model reference: the display name plus the on-disk weights.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelRef {
    pub name: String,
    pub path: PathBuf,
}

/// One loaded runner as reported to process listings.
#[derive(Debug, Clone)]
pub struct LoadedRunner {
    pub model: String,
    pub estimate: MemoryEstimate,

    /// When the keep-alive window closes, if one is set.
    pub expires_at: Option<Instant>,
}

/// The surface the external model-load scheduler drives.
#[async_trait]
pub trait RunnerScheduler: Send + Sync {
    /// Ensure a ready runner serves `model`, launching and waiting for one
    /// when none exists. `keep_alive` extends the runner's idle lifetime.
    ///
    /// Load-scoped failures (process launch, stall, insufficient memory)
    /// propagate to the caller; the runner is not left half-loaded.
    async fn get_runner(
        &self,
        model: &ModelRef,
        settings: RunnerSettings,
        keep_alive: Duration,
    ) -> Result<Arc<RunnerProcess>>;

    /// Mark a model's runner for eviction at the scheduler's next pass.
    fn expire_runner(&self, model: &ModelRef);

    /// Currently loaded runners with their memory estimates.
    fn loaded_runners(&self) -> Vec<LoadedRunner>;
}
