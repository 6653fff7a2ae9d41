//! Chunk and manifest codecs for chunked game content delivery
//!
#![allow(clippy::cast_possible_truncation)] // Intentional for binary format parsing
#![allow(clippy::cast_possible_wrap)] // Signed string lengths
#![allow(clippy::cast_lossless)] // Sometimes clearer than From
#![allow(clippy::doc_markdown)] // Format names don't need backticks
#![allow(clippy::module_name_repetitions)] // Clear naming is preferred
//! This crate provides symmetric (parser and builder) implementations of the
//! two formats a content-addressed installer consumes:
//!
//! - **Chunk**: a single downloadable blob of up to 1 MiB, optionally zlib
//!   compressed, carrying its own rolling hash and SHA-1
//! - **Manifest**: the description of a build (metadata, chunk list, file
//!   list, custom fields), either in the binary form or the JSON form
//!
//! On top of the codecs it implements the manifest-level operations the
//! installer needs: comparing two builds file by file, overlaying a delta
//! manifest onto a base, and deriving CDN paths for chunks.
//!
//! # Design Principles
//!
//! - **Symmetric Operations**: binary manifests and chunks parse and build
//! - **Column Layout**: manifest sections are read and written column by
//!   column, exactly as stored
//! - **Index Caches**: path and identifier lookups are built lazily and
//!   dropped whenever the underlying lists change

#![warn(missing_docs)]

pub mod chunk;
pub mod manifest;

// Test utilities module
#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
pub(crate) mod test_utils;

pub use chunk::{CHUNK_WINDOW_SIZE, Chunk, ChunkError, ChunkHeader};
pub use manifest::{
    ChunkDataList, ChunkInfo, ChunkPart, CustomFields, FileManifest, FileManifestList, Manifest,
    ManifestComparison, ManifestError, ManifestHeader, ManifestMeta,
};
