//! Manifest header

use binrw::{BinRead, BinWrite};
use tessera_crypto::ShaHash;

/// Manifest magic number
pub const MANIFEST_MAGIC: u32 = 0x44BE_C00C;

/// Size of the header written by the encoder
pub const MANIFEST_HEADER_SIZE: u32 = 41;

/// Storage flag: body is zlib compressed
pub const MANIFEST_COMPRESSED: u8 = 0x01;

/// Fixed-size header preceding the manifest body
#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little, magic = 0x44BE_C00Cu32)]
pub struct ManifestHeader {
    /// Header size in bytes, including magic
    pub header_size: u32,
    /// Body size before compression
    pub size_uncompressed: u32,
    /// Body size as stored
    pub size_compressed: u32,
    /// SHA-1 of the uncompressed body
    pub sha_hash: ShaHash,
    /// Storage flags (bit 0 = compressed, other bits preserved)
    pub stored_as: u8,
    /// Serialisation version
    pub version: u32,
}

impl ManifestHeader {
    /// Whether the body is zlib compressed
    pub const fn is_compressed(&self) -> bool {
        self.stored_as & MANIFEST_COMPRESSED != 0
    }
}

impl Default for ManifestHeader {
    fn default() -> Self {
        Self {
            header_size: MANIFEST_HEADER_SIZE,
            size_uncompressed: 0,
            size_compressed: 0,
            sha_hash: ShaHash::default(),
            stored_as: MANIFEST_COMPRESSED,
            version: super::DEFAULT_FEATURE_LEVEL,
        }
    }
}
