//! Error types for manifest parsing and building

use thiserror::Error;

/// Errors that can occur when parsing or building manifests
#[derive(Error, Debug)]
pub enum ManifestError {
    /// Invalid magic number detected
    #[error("Invalid manifest magic: expected 0x44BEC00C, got 0x{0:08X}")]
    InvalidMagic(u32),

    /// Feature level newer than this codec understands
    #[error("Unsupported manifest feature level {level} (max supported {max})")]
    UnsupportedFeatureLevel {
        /// Feature level found in the manifest
        level: u32,
        /// Highest supported feature level
        max: u32,
    },

    /// A section did not consume exactly its declared size
    #[error("Section {section} size mismatch: declared {declared}, read {read}")]
    SectionSizeMismatch {
        /// Section name
        section: &'static str,
        /// Declared size in bytes
        declared: u32,
        /// Bytes actually read
        read: u64,
    },

    /// SHA-1 of the decompressed body differs from the header
    #[error("Manifest body hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        /// Hash stored in the header
        expected: String,
        /// Hash of the body
        actual: String,
    },

    /// Structural problem not covered by a more specific variant
    #[error("Corrupt manifest: {0}")]
    Corrupt(String),

    /// String with invalid encoding
    #[error("Invalid string: {0}")]
    InvalidString(String),

    /// Decompression failed
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),

    /// JSON manifest could not be decoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Hex decoding error
    #[error("Hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `BinRW` parsing/writing error
    #[error("Binary format error: {0}")]
    BinRw(#[from] binrw::Error),
}

impl ManifestError {
    /// Whether the manifest is well formed but newer than supported
    pub const fn is_unsupported(&self) -> bool {
        matches!(self, Self::UnsupportedFeatureLevel { .. })
    }
}

impl From<tessera_crypto::CryptoError> for ManifestError {
    fn from(err: tessera_crypto::CryptoError) -> Self {
        Self::Corrupt(err.to_string())
    }
}

/// Type alias for manifest operation results
pub type Result<T> = std::result::Result<T, ManifestError>;
