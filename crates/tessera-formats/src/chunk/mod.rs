//! Chunk blob codec
//!
//! A chunk is the unit of network transfer: a header followed by a body of
//! at most one 1 MiB window, optionally zlib compressed.
//!
//! ## Layout
//!
//! ```text
//! +--------+---------+-------------+-----------------+------+------------+
//! | magic  | version | header size | compressed size | guid | rolling .. |
//! +--------+---------+-------------+-----------------+------+------------+
//! | stored_as | sha1 (v2+) | hash type (v2+) | uncompressed size (v3+) |
//! +-----------+------------+-----------------+-------------------------+
//! | body (compressed_size bytes)                                       |
//! +--------------------------------------------------------------------+
//! ```
//!
//! All integers are little-endian.
//!
//! ## Example
//!
//! ```
//! use tessera_crypto::ChunkGuid;
//! use tessera_formats::chunk::Chunk;
//!
//! let chunk = Chunk::new(ChunkGuid::from_parts([1, 2, 3, 4]), b"payload").unwrap();
//! let wire = chunk.build(true).unwrap();
//! let parsed = Chunk::parse(&wire).unwrap();
//! assert_eq!(&parsed.data()[..7], b"payload");
//! parsed.verify().unwrap();
//! ```

mod error;
mod header;

pub use error::{ChunkError, ChunkResult};
pub use header::{
    CHUNK_HEADER_SIZE, CHUNK_HEADER_VERSION, CHUNK_MAGIC, ChunkHeader, HASH_ROLLING, HASH_SHA1,
    STORED_COMPRESSED,
};

use binrw::io::Cursor;
use binrw::{BinRead, BinWrite};
use flate2::Compression;
use flate2::read::{ZlibDecoder, ZlibEncoder};
use std::io::Read;
use tessera_crypto::{ChunkGuid, ShaHash, rolling_hash};

/// Size of a chunk window (uncompressed payload)
pub const CHUNK_WINDOW_SIZE: usize = 1024 * 1024;

/// A decoded chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Parsed or generated header
    pub header: ChunkHeader,
    data: Vec<u8>,
}

impl Chunk {
    /// Create a chunk from a payload of at most one window
    ///
    /// The payload is zero-padded to a full window and both hashes are
    /// computed over the padded bytes.
    pub fn new(guid: ChunkGuid, payload: &[u8]) -> ChunkResult<Self> {
        if payload.len() > CHUNK_WINDOW_SIZE {
            return Err(ChunkError::TooLarge {
                size: payload.len(),
                max: CHUNK_WINDOW_SIZE,
            });
        }

        let mut data = Vec::with_capacity(CHUNK_WINDOW_SIZE);
        data.extend_from_slice(payload);
        data.resize(CHUNK_WINDOW_SIZE, 0);

        let header = ChunkHeader {
            header_version: CHUNK_HEADER_VERSION,
            header_size: CHUNK_HEADER_SIZE,
            compressed_size: CHUNK_WINDOW_SIZE as u32,
            guid,
            rolling_hash: rolling_hash(&data),
            stored_as: 0,
            sha_hash: Some(ShaHash::from_data(&data)),
            hash_type: Some(HASH_ROLLING | HASH_SHA1),
            uncompressed_size: Some(CHUNK_WINDOW_SIZE as u32),
        };

        Ok(Self { header, data })
    }

    /// Parse a chunk blob and decompress its body
    pub fn parse(data: &[u8]) -> ChunkResult<Self> {
        let mut cursor = Cursor::new(data);
        let header = ChunkHeader::read_le(&mut cursor).map_err(unwrap_custom)?;

        let body = &data[header.header_size as usize..];
        let stored = header.compressed_size as usize;
        if body.len() < stored {
            return Err(ChunkError::Truncated {
                expected: stored,
                actual: body.len(),
            });
        }
        let body = &body[..stored];
        let limit = header.window_size();

        let payload = if header.is_compressed() {
            decompress(body, limit)?
        } else {
            body.to_vec()
        };

        if payload.len() > limit {
            return Err(ChunkError::TooLarge {
                size: payload.len(),
                max: limit,
            });
        }

        Ok(Self {
            header,
            data: payload,
        })
    }

    /// Serialise the chunk with a version 3 header
    ///
    /// The payload is padded to a full window and the hashes recomputed.
    /// Storage-flag bits other than the compression bit are kept.
    pub fn build(&self, compress: bool) -> ChunkResult<Vec<u8>> {
        let mut payload = self.data.clone();
        if payload.len() < CHUNK_WINDOW_SIZE {
            payload.resize(CHUNK_WINDOW_SIZE, 0);
        }

        let body = if compress {
            let mut encoder = ZlibEncoder::new(payload.as_slice(), Compression::default());
            let mut out = Vec::new();
            encoder.read_to_end(&mut out)?;
            out
        } else {
            payload.clone()
        };

        let mut stored_as = self.header.stored_as & !STORED_COMPRESSED;
        if compress {
            stored_as |= STORED_COMPRESSED;
        }

        let header = ChunkHeader {
            header_version: CHUNK_HEADER_VERSION,
            header_size: CHUNK_HEADER_SIZE,
            compressed_size: body.len() as u32,
            guid: self.header.guid,
            rolling_hash: rolling_hash(&payload),
            stored_as,
            sha_hash: Some(ShaHash::from_data(&payload)),
            hash_type: Some(HASH_ROLLING | HASH_SHA1),
            uncompressed_size: Some(payload.len() as u32),
        };

        let mut cursor = Cursor::new(Vec::with_capacity(body.len() + CHUNK_HEADER_SIZE as usize));
        header.write_le(&mut cursor)?;
        let mut out = cursor.into_inner();
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Check the payload against whichever hashes the header declares
    pub fn verify(&self) -> ChunkResult<()> {
        let hash_type = self.header.hash_type.unwrap_or(HASH_ROLLING);

        if hash_type & HASH_SHA1 != 0
            && let Some(expected) = self.header.sha_hash
        {
            let actual = ShaHash::from_data(&self.data);
            if actual != expected {
                return Err(ChunkError::HashMismatch {
                    kind: "sha1",
                    expected: expected.to_hex(),
                    actual: actual.to_hex(),
                });
            }
        }

        if hash_type & HASH_ROLLING != 0 {
            let actual = rolling_hash(&self.data);
            if actual != self.header.rolling_hash {
                return Err(ChunkError::HashMismatch {
                    kind: "rolling hash",
                    expected: format!("{:016X}", self.header.rolling_hash),
                    actual: format!("{actual:016X}"),
                });
            }
        }

        Ok(())
    }

    /// Chunk identifier
    pub const fn guid(&self) -> ChunkGuid {
        self.header.guid
    }

    /// Decoded payload
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Take ownership of the decoded payload
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Inflate a zlib body, refusing to produce more than `limit` bytes
fn decompress(body: &[u8], limit: usize) -> ChunkResult<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(body).take(limit as u64 + 1);
    let mut out = Vec::with_capacity(limit);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ChunkError::DecompressionFailed(e.to_string()))?;
    Ok(out)
}

/// Recover a [`ChunkError`] raised inside a `BinRead` impl
fn unwrap_custom(err: binrw::Error) -> ChunkError {
    match err {
        binrw::Error::Custom { err, .. } => match err.downcast::<ChunkError>() {
            Ok(chunk_err) => *chunk_err,
            Err(other) => ChunkError::DecompressionFailed(format!("{other:?}")),
        },
        other => ChunkError::BinRw(other),
    }
}
