//! TokenLoom model runner.
//!
//! The runner process multiplexes concurrent generation and embedding
//! requests onto a single model: sequences share a fixed pool of KV cache
//! slots, a single cooperative loop composes homogeneous decode batches,
//! and results stream back over a loopback HTTP transport to the
//! supervisor that launched the process.

pub mod backend;
pub mod cache;
pub mod scheduler;
pub mod sequence;
pub mod server;
pub mod stop;

pub use backend::TensorEngine;
pub use scheduler::Scheduler;
pub use sequence::{DoneReason, Sequence, SequenceHandle, SequenceParams};
pub use server::{AppState, RunnerState};
