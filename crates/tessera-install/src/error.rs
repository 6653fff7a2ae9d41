//! Install error taxonomy

use tessera_formats::{ChunkError, ManifestError};
use tessera_protocol::ProtocolError;
use thiserror::Error;

use crate::arena::ArenaError;

/// Result type for install operations.
pub type Result<T> = std::result::Result<T, InstallError>;

/// Errors that can occur while planning or running an install.
#[derive(Debug, Error)]
pub enum InstallError {
    /// Chunk blob failed to decode or verify.
    #[error("Corrupt chunk: {0}")]
    CorruptChunk(#[from] ChunkError),

    /// Manifest failed to decode.
    #[error("Corrupt manifest: {0}")]
    CorruptManifest(ManifestError),

    /// Manifest feature level is newer than supported.
    #[error("Unsupported manifest: {0}")]
    UnsupportedManifest(ManifestError),

    /// Network failure (transient, permanent or authentication).
    #[error("Network error: {0}")]
    Network(#[from] ProtocolError),

    /// The plan does not fit into the configured arena.
    #[error(
        "Shared memory too small: plan needs {required} bytes, {available} configured; \
         enable processing reordering or raise the memory limit"
    )]
    InsufficientArena {
        /// Minimum arena size for the plan
        required: u64,
        /// Configured arena size
        available: u64,
    },

    /// A chunk or read did not fit the arena slot it was assigned.
    #[error("Arena error: {0}")]
    Arena(#[from] ArenaError),

    /// Not enough free disk space at the install location.
    #[error("Not enough disk space: {required} bytes required, {available} available")]
    InsufficientSpace {
        /// Bytes required
        required: u64,
        /// Bytes free
        available: u64,
    },

    /// Another process holds the install lock.
    #[error("Another install operation is running (lock held at {0})")]
    InstallLocked(String),

    /// Files on disk do not match the manifest.
    #[error("Verification failed: {failed} mismatched, {missing} missing")]
    VerificationFailed {
        /// Files whose hash differs
        failed: usize,
        /// Files that do not exist
        missing: usize,
    },

    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Installed-games store could not be read or written.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No record for the requested application.
    #[error("Not installed: {0}")]
    NotInstalled(String),

    /// The run finished with terminal task failures.
    #[error("Install incomplete: {failed} task(s) failed, first error: {first_error}")]
    Incomplete {
        /// Number of failed tasks
        failed: usize,
        /// First failure message
        first_error: String,
    },

    /// The run was cancelled.
    #[error("Install cancelled")]
    Cancelled,

    /// Invalid configuration or request.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<ManifestError> for InstallError {
    fn from(err: ManifestError) -> Self {
        if err.is_unsupported() {
            Self::UnsupportedManifest(err)
        } else {
            Self::CorruptManifest(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_errors_split() {
        let unsupported: InstallError = ManifestError::UnsupportedFeatureLevel {
            level: 99,
            max: 21,
        }
        .into();
        assert!(matches!(unsupported, InstallError::UnsupportedManifest(_)));

        let corrupt: InstallError = ManifestError::InvalidMagic(0).into();
        assert!(matches!(corrupt, InstallError::CorruptManifest(_)));
    }
}
