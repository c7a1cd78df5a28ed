//! Error kinds for bulk transfer operations.
//!
//! Workers never propagate errors past their own thread boundary. They
//! record the first failure into the shared execution context (see
//! [`crate::context::SharedProgress`]) and terminate their own loop; the
//! orchestrator observes the failure slot during its wait loop.

use std::path::Path;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = TransferError> = std::result::Result<T, E>;

/// The closed set of failure kinds a transfer worker can hit.
#[derive(Debug, Error)]
pub enum TransferError {
    /// File open/read/write failure. Fatal to the owning worker, never retried.
    #[error("I/O failure on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Query or connection failure reported by the backing store.
    #[error("database failure: {0}")]
    Database(String),

    /// Record framing could not locate an expected delimiter, or a framed
    /// record does not match the table shape. Fatal, because silent data
    /// loss is worse than stopping.
    #[error("malformed record in {path} near byte {offset}: {reason}")]
    MalformedRecord {
        path: String,
        offset: u64,
        reason: String,
    },

    /// Invalid run configuration. Detected before any worker starts.
    #[error("configuration error: {0}")]
    Config(String),
}

impl TransferError {
    /// Wrap a `std::io::Error` together with the path it occurred on.
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        TransferError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        TransferError::Config(msg.into())
    }

    pub fn database(msg: impl Into<String>) -> Self {
        TransferError::Database(msg.into())
    }
}
