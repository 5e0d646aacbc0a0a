//! Error taxonomy for the pipeline engine.
//!
//! Every expected failure crosses component boundaries as a typed
//! `EngineError` value. Invariants that can only be broken by a defective
//! build (e.g. registering a kind under two ranks) are enforced with
//! assertions instead, since no caller can meaningfully recover from them.

use thiserror::Error;

/// Error type shared by all engine components.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An unknown step/container/kind/pipe/analysis name, or a malformed
    /// pipeline description.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A Global or diff was requested or applied at the wrong concrete type.
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// Disk read/write failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted or transported data that could not be decoded.
    #[error("Malformed data: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A pipe's precondition was violated or an external tool failed.
    #[error("Pipe '{pipe}' failed: {message}")]
    PipeExecution { pipe: String, message: String },

    /// A target path inconsistent with its kind, or a request no pipe in the
    /// chain can satisfy.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl EngineError {
    /// Shorthand for an unknown-name configuration error.
    pub fn unknown(entity: &str, name: &str) -> Self {
        EngineError::Configuration(format!("Unknown {entity}: '{name}'"))
    }

    /// Shorthand for a pipe execution failure.
    pub fn pipe(pipe: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::PipeExecution { pipe: pipe.into(), message: message.into() }
    }
}

/// Convenience result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
