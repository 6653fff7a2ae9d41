//! Hash primitives and identifiers for chunked content delivery
//!
//! This crate provides the small, dependency-light building blocks shared by
//! the manifest codec and the install pipeline.
//!
//! # Components
//!
//! - **Rolling hash**: 64-bit polynomial hash over a chunk window
//! - **SHA-1 digests**: file and chunk integrity hashes
//! - **Chunk identifiers**: 128-bit GUIDs stored as four little-endian words
//!
//! # Examples
//!
//! ```
//! use tessera_crypto::{ChunkGuid, ShaHash, rolling_hash};
//!
//! let data = b"Hello, World!";
//! let sha = ShaHash::from_data(data);
//! println!("SHA-1: {sha}");
//!
//! let hash = rolling_hash(data);
//! println!("Rolling: {hash:016X}");
//!
//! let guid = ChunkGuid::from_parts([1, 2, 3, 4]);
//! assert_eq!(guid.to_string(), "00000001000000020000000300000004");
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod guid;
pub mod rolling;
pub mod sha;

pub use error::CryptoError;

// Re-export commonly used types
pub use guid::ChunkGuid;
pub use rolling::{ROLLING_TABLE, RollingHasher, rolling_hash};
pub use sha::ShaHash;
