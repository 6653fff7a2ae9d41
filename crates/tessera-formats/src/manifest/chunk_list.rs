//! Chunk data list section

use binrw::io::{Read, Seek, Write};
use binrw::{BinRead, BinReaderExt, BinWrite};
use std::collections::HashMap;
use std::sync::OnceLock;
use tessera_crypto::{ChunkGuid, ShaHash};

use super::codec::{check_section, write_section};
use super::error::Result;

/// Manifest-side record for a chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Chunk identifier
    pub guid: ChunkGuid,
    /// Rolling hash of the uncompressed window
    pub hash: u64,
    /// SHA-1 of the uncompressed window
    pub sha_hash: ShaHash,
    /// CDN group number
    pub group_num: u8,
    /// Uncompressed window size
    pub window_size: u32,
    /// Size of the chunk blob on the CDN
    pub file_size: u64,
}

impl ChunkInfo {
    /// CDN path relative to a base URL
    ///
    /// `ChunksV{N}/{group:02}/{hash:016X}_{guid}.chunk`
    pub fn path(&self, feature_level: u32) -> String {
        format!(
            "{}/{:02}/{:016X}_{}.chunk",
            super::chunk_dir(feature_level),
            self.group_num,
            self.hash,
            self.guid
        )
    }
}

/// Column-oriented list of chunks
#[derive(Debug, Clone, Default)]
pub struct ChunkDataList {
    /// Section layout version
    pub version: u8,
    elements: Vec<ChunkInfo>,
    guid_index: OnceLock<HashMap<ChunkGuid, usize>>,
}

impl PartialEq for ChunkDataList {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version && self.elements == other.elements
    }
}

impl Eq for ChunkDataList {}

impl ChunkDataList {
    /// Create a list from chunk records
    pub fn new(elements: Vec<ChunkInfo>) -> Self {
        Self {
            version: 0,
            elements,
            guid_index: OnceLock::new(),
        }
    }

    /// All chunk records in stored order
    pub fn elements(&self) -> &[ChunkInfo] {
        &self.elements
    }

    /// Number of chunks
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Look up a chunk by identifier
    pub fn get(&self, guid: &ChunkGuid) -> Option<&ChunkInfo> {
        let index = self.guid_index.get_or_init(|| {
            self.elements
                .iter()
                .enumerate()
                .map(|(i, c)| (c.guid, i))
                .collect()
        });
        index.get(guid).map(|&i| &self.elements[i])
    }

    /// Whether a chunk is present
    pub fn contains(&self, guid: &ChunkGuid) -> bool {
        self.get(guid).is_some()
    }

    /// Append a chunk record
    pub fn push(&mut self, info: ChunkInfo) {
        self.elements.push(info);
        self.invalidate();
    }

    /// Drop the identifier index; it is rebuilt on the next lookup
    pub fn invalidate(&mut self) {
        self.guid_index = OnceLock::new();
    }

    pub(crate) fn read_from<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        let start = reader.stream_position()?;
        let size: u32 = reader.read_le()?;
        let version: u8 = reader.read_le()?;
        let count: u32 = reader.read_le()?;
        let count = count as usize;

        let mut guids = Vec::with_capacity(count.min(1 << 20));
        for _ in 0..count {
            guids.push(ChunkGuid::read_le(reader)?);
        }
        let mut hashes = Vec::with_capacity(guids.len());
        for _ in 0..count {
            hashes.push(reader.read_le::<u64>()?);
        }
        let mut shas = Vec::with_capacity(guids.len());
        for _ in 0..count {
            shas.push(ShaHash::read_le(reader)?);
        }
        let mut groups = Vec::with_capacity(guids.len());
        for _ in 0..count {
            groups.push(reader.read_le::<u8>()?);
        }
        let mut windows = Vec::with_capacity(guids.len());
        for _ in 0..count {
            windows.push(reader.read_le::<u32>()?);
        }
        let mut file_sizes = Vec::with_capacity(guids.len());
        for _ in 0..count {
            file_sizes.push(reader.read_le::<i64>()?);
        }

        check_section(reader, "chunk data list", start, size)?;

        let elements = (0..count)
            .map(|i| ChunkInfo {
                guid: guids[i],
                hash: hashes[i],
                sha_hash: shas[i],
                group_num: groups[i],
                window_size: windows[i],
                file_size: file_sizes[i].max(0) as u64,
            })
            .collect();

        Ok(Self {
            version,
            elements,
            guid_index: OnceLock::new(),
        })
    }

    pub(crate) fn write_to<W: Write + Seek>(&self, writer: &mut W) -> Result<()> {
        write_section(writer, |w| {
            self.version.write_le(w)?;
            (self.elements.len() as u32).write_le(w)?;
            for chunk in &self.elements {
                chunk.guid.write_le(w)?;
            }
            for chunk in &self.elements {
                chunk.hash.write_le(w)?;
            }
            for chunk in &self.elements {
                chunk.sha_hash.write_le(w)?;
            }
            for chunk in &self.elements {
                chunk.group_num.write_le(w)?;
            }
            for chunk in &self.elements {
                chunk.window_size.write_le(w)?;
            }
            for chunk in &self.elements {
                (chunk.file_size as i64).write_le(w)?;
            }
            Ok(())
        })
    }
}
