//! Chunk header structure and parsing

use binrw::io::{Read, Seek, Write};
use binrw::{BinRead, BinResult, BinWrite};
use tessera_crypto::{ChunkGuid, ShaHash};

use super::error::ChunkError;

/// Chunk magic number
pub const CHUNK_MAGIC: u32 = 0xB1FE_3AA2;

/// Header version written by the encoder
pub const CHUNK_HEADER_VERSION: u32 = 3;

/// Size of a version 3 header in bytes
pub const CHUNK_HEADER_SIZE: u32 = 66;

/// Storage flag: body is zlib compressed
pub const STORED_COMPRESSED: u8 = 0x01;

/// Hash type flag: rolling hash present
pub const HASH_ROLLING: u8 = 0x01;

/// Hash type flag: SHA-1 present
pub const HASH_SHA1: u8 = 0x02;

/// Chunk header
///
/// Fields after `stored_as` depend on the header version:
/// version 2 adds the SHA-1 and the hash-type byte, version 3 adds the
/// uncompressed size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Header layout version
    pub header_version: u32,
    /// Declared header size in bytes (including magic)
    pub header_size: u32,
    /// Size of the body as stored
    pub compressed_size: u32,
    /// Chunk identifier
    pub guid: ChunkGuid,
    /// Rolling hash of the uncompressed payload
    pub rolling_hash: u64,
    /// Storage flags (bit 0 = compressed, other bits preserved)
    pub stored_as: u8,
    /// SHA-1 of the uncompressed payload (version >= 2)
    pub sha_hash: Option<ShaHash>,
    /// Which hashes are valid (version >= 2)
    pub hash_type: Option<u8>,
    /// Uncompressed payload size (version >= 3)
    pub uncompressed_size: Option<u32>,
}

impl ChunkHeader {
    /// Whether the body is zlib compressed
    pub const fn is_compressed(&self) -> bool {
        self.stored_as & STORED_COMPRESSED != 0
    }

    /// Declared uncompressed size, defaulting to a full window
    pub fn window_size(&self) -> usize {
        self.uncompressed_size
            .map_or(super::CHUNK_WINDOW_SIZE, |size| size as usize)
    }
}

impl BinRead for ChunkHeader {
    type Args<'a> = ();

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        endian: binrw::Endian,
        _args: Self::Args<'_>,
    ) -> BinResult<Self> {
        let start = reader.stream_position()?;

        let magic = u32::read_options(reader, endian, ())?;
        if magic != CHUNK_MAGIC {
            return Err(binrw::Error::Custom {
                pos: start,
                err: Box::new(ChunkError::InvalidMagic(magic)),
            });
        }

        let header_version = u32::read_options(reader, endian, ())?;
        let header_size = u32::read_options(reader, endian, ())?;
        let compressed_size = u32::read_options(reader, endian, ())?;
        let guid = ChunkGuid::read_options(reader, endian, ())?;
        let rolling_hash = u64::read_options(reader, endian, ())?;
        let stored_as = u8::read_options(reader, endian, ())?;

        let (sha_hash, hash_type) = if header_version >= 2 {
            (
                Some(ShaHash::read_options(reader, endian, ())?),
                Some(u8::read_options(reader, endian, ())?),
            )
        } else {
            (None, None)
        };

        let uncompressed_size = if header_version >= 3 {
            Some(u32::read_options(reader, endian, ())?)
        } else {
            None
        };

        let read = reader.stream_position()? - start;
        if read != u64::from(header_size) {
            return Err(binrw::Error::Custom {
                pos: start,
                err: Box::new(ChunkError::HeaderSizeMismatch {
                    declared: header_size,
                    read,
                }),
            });
        }

        Ok(Self {
            header_version,
            header_size,
            compressed_size,
            guid,
            rolling_hash,
            stored_as,
            sha_hash,
            hash_type,
            uncompressed_size,
        })
    }
}

impl BinWrite for ChunkHeader {
    type Args<'a> = ();

    fn write_options<W: Write + Seek>(
        &self,
        writer: &mut W,
        endian: binrw::Endian,
        _args: Self::Args<'_>,
    ) -> BinResult<()> {
        CHUNK_MAGIC.write_options(writer, endian, ())?;
        self.header_version.write_options(writer, endian, ())?;
        self.header_size.write_options(writer, endian, ())?;
        self.compressed_size.write_options(writer, endian, ())?;
        self.guid.write_options(writer, endian, ())?;
        self.rolling_hash.write_options(writer, endian, ())?;
        self.stored_as.write_options(writer, endian, ())?;

        if self.header_version >= 2 {
            self.sha_hash
                .unwrap_or_default()
                .write_options(writer, endian, ())?;
            self.hash_type.unwrap_or(0).write_options(writer, endian, ())?;
        }
        if self.header_version >= 3 {
            self.uncompressed_size
                .unwrap_or(0)
                .write_options(writer, endian, ())?;
        }

        Ok(())
    }
}
