//! Chunk error types

use thiserror::Error;

/// Chunk-specific error type
#[derive(Debug, Error)]
pub enum ChunkError {
    /// Invalid chunk magic
    #[error("invalid chunk magic: expected 0xB1FE3AA2, got 0x{0:08X}")]
    InvalidMagic(u32),

    /// Bytes consumed by the header differ from the declared header size
    #[error("header size mismatch: declared {declared}, read {read}")]
    HeaderSizeMismatch {
        /// Declared header size
        declared: u32,
        /// Bytes actually read
        read: u64,
    },

    /// Body shorter than the declared compressed size
    #[error("truncated chunk body: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Declared compressed size
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Payload larger than allowed
    #[error("chunk payload too large: {size} bytes (max {max})")]
    TooLarge {
        /// Payload size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Stored hash does not match the payload
    #[error("{kind} mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        /// Which hash failed ("sha1" or "rolling hash")
        kind: &'static str,
        /// Expected value
        expected: String,
        /// Actual value
        actual: String,
    },

    /// Decompression failed
    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Binary parsing error
    #[error("binary parsing error: {0}")]
    BinRw(#[from] binrw::Error),
}

/// Result type for chunk operations
pub type ChunkResult<T> = Result<T, ChunkError>;
