//! TokenLoom runner supervision.
//!
//! The supervising half of the system: it sizes a model load against the
//! available GPUs, launches the runner process with the matching flags,
//! watches it through readiness and serving, and proxies completion and
//! embedding requests over the loopback transport. The model-load
//! scheduler above it drives everything through [`RunnerScheduler`].

pub mod client;
pub mod memory;
pub mod process;
pub mod registry;

pub use client::RunnerClient;
pub use memory::{estimate_gpu_layers, GpuDevice, MemoryEstimate, ModelMetadata};
pub use process::{LaunchSpec, RunnerProcess};
pub use registry::{LoadedRunner, ModelRef, RunnerScheduler};
