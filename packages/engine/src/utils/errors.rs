// packages/engine/src/utils/errors.rs
//! Engine-wide error type
//!
//! Domain-level failures (unknown agent, duplicate id, agent-raised
//! exceptions) are *not* errors: they travel back to clients as
//! `ok=false` plus a message. `EngineError` covers the engine's own
//! failure modes: IPC objects, process control, encoding.

use thiserror::Error;

/// Convenience alias used across the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the engine core
#[derive(Debug, Error)]
pub enum EngineError {
    /// Shared-memory segment creation, mapping, or layout failure
    #[error("shared memory failure: {0}")]
    Shm(String),

    /// POSIX or System-V semaphore failure
    #[error("semaphore failure: {0}")]
    Semaphore(String),

    /// Fork, signal, or wait failure
    #[error("process control failure: {0}")]
    Process(String),

    /// Argument/result frame could not be encoded or decoded
    #[error("frame encoding failure: {0}")]
    Encoding(String),

    /// Invalid or unparsable configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Plain I/O failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<prost::DecodeError> for EngineError {
    fn from(err: prost::DecodeError) -> Self {
        EngineError::Encoding(err.to_string())
    }
}
