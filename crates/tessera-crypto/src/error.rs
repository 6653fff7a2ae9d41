//! Error types for hash and identifier handling

use thiserror::Error;

/// Errors that can occur when decoding hashes and identifiers
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid length for a fixed-size value
    #[error("Invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length in bytes
        expected: usize,
        /// Actual length in bytes
        actual: usize,
    },

    /// Hex string could not be decoded
    #[error("Invalid hex string: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}
