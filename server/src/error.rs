//! Error taxonomy shared by the block store, the lifecycle controller and the reaper.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for block lifecycle operations.
pub type BlockResult<T> = Result<T, BlockError>;

#[derive(Debug, Error)]
pub enum BlockError {
    /// Malformed intake payload (missing id, non-finite dimension, bad base64, ...).
    #[error("invalid block payload: {0}")]
    Validation(String),

    /// Stage, block or file is absent.
    #[error("{0} not found")]
    NotFound(String),

    /// Untrusted id or filename that is not a plain path segment.
    #[error("invalid {field} {value:?}: must be a single path segment")]
    InvalidKey { field: &'static str, value: String },

    /// Underlying filesystem operation failed.
    #[error("storage failure while trying to {operation} {}: {source}", path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Block metadata could not be encoded or decoded.
    #[error("block metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// The external mesh generator did not produce an artifact.
    #[error("mesh generator failed: {0}")]
    ExternalTool(String),
}

impl BlockError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        BlockError::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BlockError::NotFound(_))
    }
}
