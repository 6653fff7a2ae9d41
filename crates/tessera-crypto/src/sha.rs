//! SHA-1 digests for files and chunks

use binrw::{BinRead, BinWrite};
use sha1::{Digest, Sha1};
use std::fmt;

use crate::CryptoError;

/// 20-byte SHA-1 digest
#[derive(BinRead, BinWrite, Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaHash([u8; 20]);

impl ShaHash {
    /// Length of a digest in bytes
    pub const LEN: usize = 20;

    /// Create digest from raw bytes
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Create digest from a slice, checking its length
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; 20] = bytes.try_into().map_err(|_| CryptoError::InvalidLength {
            expected: Self::LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(array))
    }

    /// Hash data with SHA-1
    pub fn from_data(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Self::from_hasher(hasher)
    }

    /// Finalise a running SHA-1 state
    pub fn from_hasher(hasher: Sha1) -> Self {
        let result = hasher.finalize();
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&result);
        Self(bytes)
    }

    /// Parse digest from hex string (either case)
    pub fn from_hex(hex: &str) -> Result<Self, CryptoError> {
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(hex.trim(), &mut bytes)?;
        Ok(Self(bytes))
    }

    /// Get raw bytes
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Convert to lowercase hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Whether every byte is zero (digest not populated)
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl fmt::Display for ShaHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 20]> for ShaHash {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}
