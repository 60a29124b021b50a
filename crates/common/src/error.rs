//! Common error types for TokenLoom
//!
//! One taxonomy shared by the runner and the supervisor. The variants map
//! the failure domains of the system: a `Config` or `Runtime` error is
//! scoped to a single sequence, while `Process`, `StallTimeout` and
//! `Resource` abort an entire load attempt and propagate to the caller
//! that asked for a runner.

use thiserror::Error;

/// Main error type for TokenLoom
#[derive(Error, Debug)]
pub enum LoomError {
    /// Unschedulable configuration, e.g. a context/num_keep combination
    /// that leaves no room for eviction
    #[error("configuration error: {0}")]
    Config(String),

    /// No admission slot, queue full, or no-slot retries exhausted
    #[error("capacity exhausted: {0}")]
    Capacity(String),

    /// Insufficient VRAM or system memory for the requested load
    #[error("insufficient resources: {0}")]
    Resource(String),

    /// Runner subprocess failed to start or died unexpectedly
    #[error("runner process error: {0}")]
    Process(String),

    /// No load or generation progress within the configured window
    #[error("stalled: {0}")]
    StallTimeout(String),

    /// Decode failure, tokenization failure, or another engine-level fault
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Malformed response on the local transport
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Caller-initiated cancellation
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LoomError {
    /// Map the error to an HTTP status code for the local transport.
    pub fn http_status(&self) -> u16 {
        match self {
            LoomError::Config(_) => 400,
            LoomError::Capacity(_) => 503,
            LoomError::Resource(_) => 507,
            LoomError::Cancelled(_) => 499,
            LoomError::Process(_)
            | LoomError::StallTimeout(_)
            | LoomError::Runtime(_)
            | LoomError::Protocol(_)
            | LoomError::Io(_)
            | LoomError::Serialization(_) => 500,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        LoomError::Config(msg.into())
    }

    /// Create a capacity error
    pub fn capacity(msg: impl Into<String>) -> Self {
        LoomError::Capacity(msg.into())
    }

    /// Create a resource error
    pub fn resource(msg: impl Into<String>) -> Self {
        LoomError::Resource(msg.into())
    }

    /// Create a process error
    pub fn process(msg: impl Into<String>) -> Self {
        LoomError::Process(msg.into())
    }

    /// Create a stall-timeout error
    pub fn stall(msg: impl Into<String>) -> Self {
        LoomError::StallTimeout(msg.into())
    }

    /// Create a runtime error
    pub fn runtime(msg: impl Into<String>) -> Self {
        LoomError::Runtime(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        LoomError::Protocol(msg.into())
    }

    /// Create a cancellation error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        LoomError::Cancelled(msg.into())
    }
}

/// Result type alias for TokenLoom operations
pub type Result<T> = std::result::Result<T, LoomError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(LoomError::capacity("full").http_status(), 503);
        assert_eq!(LoomError::config("bad n_keep").http_status(), 400);
        assert_eq!(LoomError::runtime("decode failed").http_status(), 500);
    }

    #[test]
    fn display_includes_context() {
        let err = LoomError::stall("no progress for 300s");
        assert_eq!(err.to_string(), "stalled: no progress for 300s");
    }
}
