//! Chunk identifiers
//!
//! A chunk is addressed by a 128-bit GUID made of four 32-bit words. On the
//! wire the words are stored little-endian one after another; in text form
//! (chunk file names, JSON manifests) each word is rendered as eight
//! uppercase hex digits, most significant word first.

use binrw::{BinRead, BinWrite};
use std::fmt;

use crate::CryptoError;

/// 128-bit chunk identifier
#[derive(BinRead, BinWrite, Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[brw(little)]
pub struct ChunkGuid([u32; 4]);

impl ChunkGuid {
    /// Create identifier from its four words
    pub const fn from_parts(parts: [u32; 4]) -> Self {
        Self(parts)
    }

    /// Create identifier from a 128-bit integer, first word in the high bits
    pub const fn from_u128(value: u128) -> Self {
        Self([
            (value >> 96) as u32,
            (value >> 64) as u32,
            (value >> 32) as u32,
            value as u32,
        ])
    }

    /// Create identifier from 16 bytes read as four big-endian words
    ///
    /// This matches the byte order of a UUID string.
    pub fn from_be_bytes(bytes: [u8; 16]) -> Self {
        Self::from_u128(u128::from_be_bytes(bytes))
    }

    /// Parse identifier from 32 hex digits (four big-endian words)
    pub fn from_hex(hex: &str) -> Result<Self, CryptoError> {
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(hex.trim(), &mut bytes)?;
        Ok(Self::from_be_bytes(bytes))
    }

    /// The four words
    pub const fn parts(&self) -> [u32; 4] {
        self.0
    }

    /// Identifier as a single integer, first word in the high bits
    pub const fn as_u128(&self) -> u128 {
        ((self.0[0] as u128) << 96)
            | ((self.0[1] as u128) << 64)
            | ((self.0[2] as u128) << 32)
            | self.0[3] as u128
    }

    /// On-wire bytes: each word little-endian
    pub fn to_le_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        for (dst, word) in bytes.chunks_exact_mut(4).zip(self.0) {
            dst.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /// CDN group number: CRC32 of the on-wire bytes modulo 100
    pub fn group_num(&self) -> u8 {
        (crc32fast::hash(&self.to_le_bytes()) % 100) as u8
    }

    /// Uppercase hex form used in chunk file names
    pub fn to_hex(&self) -> String {
        format!(
            "{:08X}{:08X}{:08X}{:08X}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

impl fmt::Display for ChunkGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
