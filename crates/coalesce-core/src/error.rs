//! Error taxonomy shared across the engine.
//!
//! Configuration and invariant failures abort; transient I/O is retried by
//! the caller; `Paused` is a return path rather than a failure and carries
//! enough state for the resume handshake.

use thiserror::Error;

/// Errors emitted by the coalescence engine.
#[derive(Debug, Error)]
pub enum SimError {
    /// Bad parameters or missing inputs. Never retried.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Map size/offset inconsistency, or a historical regression under the
    /// strict landscape policy.
    #[error("map error: {message}")]
    Map { message: String },

    /// A structural invariant has been violated (for example a cell's
    /// wrapped-lineage list disagreeing with its lineages). Aborts with
    /// enough context to reproduce under the same seed.
    #[error("invariant violated: {message}")]
    Invariant { message: String },

    /// Output location not writable or otherwise unusable.
    #[error("resource error: {message}")]
    Resource { message: String },

    /// Transient I/O failure; retried a bounded number of times before
    /// being promoted to a hard error.
    #[error("transient I/O error: {message}")]
    TransientIo { message: String },

    /// Not a failure: the wall clock ran out and the engine dumped its
    /// state. Exit status 1.
    #[error("simulation paused with {lineages_remaining} lineages remaining")]
    Paused { lineages_remaining: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SimError>;

impl SimError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn map(message: impl Into<String>) -> Self {
        Self::Map {
            message: message.into(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant {
            message: message.into(),
        }
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::Resource {
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientIo {
            message: message.into(),
        }
    }

    /// Process exit code for the top-level handler: 0 completed, 1 paused,
    /// 2 configuration, 3 invariant or other runtime failure.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Paused { .. } => 1,
            Self::Config { .. } | Self::Map { .. } => 2,
            _ => 3,
        }
    }
}
