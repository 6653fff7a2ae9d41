//! File manifest list section

use binrw::io::{Read, Seek, SeekFrom, Write};
use binrw::{BinRead, BinReaderExt, BinWrite};
use std::collections::HashMap;
use std::sync::OnceLock;
use tessera_crypto::{ChunkGuid, ShaHash};

use super::codec::{check_section, read_fstring, write_fstring, write_fstring_list};
use super::error::{ManifestError, Result};

/// File flag: read-only
pub const FILE_READ_ONLY: u8 = 0x01;
/// File flag: compressed
pub const FILE_COMPRESSED: u8 = 0x02;
/// File flag: unix executable
pub const FILE_EXECUTABLE: u8 = 0x04;

/// Size of a serialised chunk part record
const CHUNK_PART_SIZE: u32 = 28;

/// A slice of a chunk that contributes to a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkPart {
    /// Chunk identifier
    pub guid: ChunkGuid,
    /// Offset into the chunk window
    pub offset: u32,
    /// Number of bytes taken from the chunk
    pub size: u32,
}

/// Per-file record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileManifest {
    /// Relative path, forward-slash separated
    pub filename: String,
    /// Symlink target, empty for regular files
    pub symlink_target: String,
    /// SHA-1 of the full file
    pub sha_hash: ShaHash,
    /// Flag bits (read-only, compressed, executable)
    pub flags: u8,
    /// Install tags grouping this file
    pub install_tags: Vec<String>,
    /// Ordered chunk slices making up the file
    pub chunk_parts: Vec<ChunkPart>,
    /// MD5 of the full file (list version >= 1)
    pub md5: Option<[u8; 16]>,
    /// MIME type (list version >= 1)
    pub mime_type: String,
    /// SHA-256 of the full file (list version >= 2)
    pub sha256: Option<[u8; 32]>,
}

impl FileManifest {
    /// File size: sum of all part sizes
    pub fn file_size(&self) -> u64 {
        self.chunk_parts.iter().map(|p| u64::from(p.size)).sum()
    }

    /// Whether the read-only flag is set
    pub const fn is_read_only(&self) -> bool {
        self.flags & FILE_READ_ONLY != 0
    }

    /// Whether the compressed flag is set
    pub const fn is_compressed(&self) -> bool {
        self.flags & FILE_COMPRESSED != 0
    }

    /// Whether the executable flag is set
    pub const fn is_executable(&self) -> bool {
        self.flags & FILE_EXECUTABLE != 0
    }
}

/// Column-oriented list of files
#[derive(Debug, Clone, Default)]
pub struct FileManifestList {
    /// Section layout version (0, 1 or 2)
    pub version: u8,
    elements: Vec<FileManifest>,
    path_index: OnceLock<HashMap<String, usize>>,
}

impl PartialEq for FileManifestList {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version && self.elements == other.elements
    }
}

impl Eq for FileManifestList {}

impl FileManifestList {
    /// Create a list from file records
    pub fn new(elements: Vec<FileManifest>) -> Self {
        Self {
            version: 0,
            elements,
            path_index: OnceLock::new(),
        }
    }

    /// All file records in stored order
    pub fn elements(&self) -> &[FileManifest] {
        &self.elements
    }

    /// Number of files
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Look up a file by path
    pub fn get(&self, path: &str) -> Option<&FileManifest> {
        self.position(path).map(|i| &self.elements[i])
    }

    /// Index of a file by path
    pub fn position(&self, path: &str) -> Option<usize> {
        let index = self.path_index.get_or_init(|| {
            self.elements
                .iter()
                .enumerate()
                .map(|(i, f)| (f.filename.clone(), i))
                .collect()
        });
        index.get(path).copied()
    }

    /// Append a file record
    pub fn push(&mut self, file: FileManifest) {
        self.elements.push(file);
        self.invalidate();
    }

    /// Replace the record at `index`
    pub fn replace(&mut self, index: usize, file: FileManifest) {
        self.elements[index] = file;
        self.invalidate();
    }

    /// Drop the path index; it is rebuilt on the next lookup
    pub fn invalidate(&mut self) {
        self.path_index = OnceLock::new();
    }

    /// Total size of all files
    pub fn total_size(&self) -> u64 {
        self.elements.iter().map(FileManifest::file_size).sum()
    }

    pub(crate) fn read_from<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        let start = reader.stream_position()?;
        let size: u32 = reader.read_le()?;
        let version: u8 = reader.read_le()?;
        let count: u32 = reader.read_le()?;
        let count = count as usize;

        let mut files: Vec<FileManifest> = Vec::with_capacity(count.min(1 << 20));
        for _ in 0..count {
            files.push(FileManifest {
                filename: read_fstring(reader)?,
                ..FileManifest::default()
            });
        }
        for file in &mut files {
            file.symlink_target = read_fstring(reader)?;
        }
        for file in &mut files {
            file.sha_hash = ShaHash::read_le(reader)?;
        }
        for file in &mut files {
            file.flags = reader.read_le()?;
        }
        for file in &mut files {
            let tag_count: u32 = reader.read_le()?;
            file.install_tags = (0..tag_count)
                .map(|_| read_fstring(reader))
                .collect::<Result<_>>()?;
        }
        for file in &mut files {
            let part_count: u32 = reader.read_le()?;
            file.chunk_parts = Vec::with_capacity((part_count as usize).min(1 << 16));
            for _ in 0..part_count {
                file.chunk_parts.push(read_chunk_part(reader)?);
            }
        }

        if version >= 1 {
            for file in &mut files {
                let has_md5: u32 = reader.read_le()?;
                if has_md5 != 0 {
                    let mut md5 = [0u8; 16];
                    reader.read_exact(&mut md5)?;
                    file.md5 = Some(md5);
                }
            }
            for file in &mut files {
                file.mime_type = read_fstring(reader)?;
            }
        }

        if version >= 2 {
            for file in &mut files {
                let mut sha256 = [0u8; 32];
                reader.read_exact(&mut sha256)?;
                file.sha256 = Some(sha256);
            }
        }

        check_section(reader, "file manifest list", start, size)?;

        Ok(Self {
            version,
            elements: files,
            path_index: OnceLock::new(),
        })
    }

    pub(crate) fn write_to<W: Write + Seek>(&self, writer: &mut W) -> Result<()> {
        super::codec::write_section(writer, |w| {
            self.version.write_le(w)?;
            (self.elements.len() as u32).write_le(w)?;
            for file in &self.elements {
                write_fstring(w, &file.filename)?;
            }
            for file in &self.elements {
                write_fstring(w, &file.symlink_target)?;
            }
            for file in &self.elements {
                file.sha_hash.write_le(w)?;
            }
            for file in &self.elements {
                file.flags.write_le(w)?;
            }
            for file in &self.elements {
                write_fstring_list(w, &file.install_tags)?;
            }
            for file in &self.elements {
                (file.chunk_parts.len() as u32).write_le(w)?;
                for part in &file.chunk_parts {
                    CHUNK_PART_SIZE.write_le(w)?;
                    part.guid.write_le(w)?;
                    part.offset.write_le(w)?;
                    part.size.write_le(w)?;
                }
            }

            if self.version >= 1 {
                for file in &self.elements {
                    match &file.md5 {
                        Some(md5) => {
                            1u32.write_le(w)?;
                            w.write_all(md5)?;
                        }
                        None => 0u32.write_le(w)?,
                    }
                }
                for file in &self.elements {
                    write_fstring(w, &file.mime_type)?;
                }
            }

            if self.version >= 2 {
                for file in &self.elements {
                    w.write_all(&file.sha256.unwrap_or([0u8; 32]))?;
                }
            }
            Ok(())
        })
    }
}

/// Read one size-prefixed chunk part, skipping any trailing fields
fn read_chunk_part<R: Read + Seek>(reader: &mut R) -> Result<ChunkPart> {
    let start = reader.stream_position()?;
    let size: u32 = reader.read_le()?;
    if size < CHUNK_PART_SIZE {
        return Err(ManifestError::Corrupt(format!(
            "chunk part record of {size} bytes"
        )));
    }
    let part = ChunkPart {
        guid: ChunkGuid::read_le(reader)?,
        offset: reader.read_le()?,
        size: reader.read_le()?,
    };
    if size > CHUNK_PART_SIZE {
        reader.seek(SeekFrom::Start(start + u64::from(size)))?;
    }
    Ok(part)
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use binrw::io::Cursor;
    use pretty_assertions::assert_eq;

    fn file(name: &str, parts: &[(u32, u32, u32)]) -> FileManifest {
        FileManifest {
            filename: name.to_string(),
            sha_hash: ShaHash::from_data(name.as_bytes()),
            flags: FILE_EXECUTABLE,
            install_tags: vec!["core".to_string()],
            chunk_parts: parts
                .iter()
                .map(|&(g, offset, size)| ChunkPart {
                    guid: ChunkGuid::from_parts([g, 0, 0, g]),
                    offset,
                    size,
                })
                .collect(),
            ..FileManifest::default()
        }
    }

    fn round_trip(list: &FileManifestList) -> FileManifestList {
        let mut cursor = Cursor::new(Vec::new());
        list.write_to(&mut cursor).unwrap();
        cursor.set_position(0);
        FileManifestList::read_from(&mut cursor).unwrap()
    }

    #[test]
    fn test_round_trip_v0() {
        let list = FileManifestList::new(vec![
            file("bin/game", &[(1, 0, 100), (2, 50, 10)]),
            file("data/ünïcode.pak", &[]),
        ]);
        assert_eq!(round_trip(&list), list);
    }

    #[test]
    fn test_round_trip_v2_extras() {
        let mut a = file("a", &[(1, 0, 5)]);
        a.md5 = Some([7u8; 16]);
        a.mime_type = "application/octet-stream".to_string();
        a.sha256 = Some([9u8; 32]);
        let mut b = file("b", &[]);
        b.sha256 = Some([0u8; 32]);
        let mut list = FileManifestList::new(vec![a, b]);
        list.version = 2;
        assert_eq!(round_trip(&list), list);
    }

    #[test]
    fn test_file_size_and_flags() {
        let f = file("x", &[(1, 0, 100), (2, 0, 28)]);
        assert_eq!(f.file_size(), 128);
        assert!(f.is_executable());
        assert!(!f.is_read_only());
        assert!(!f.is_compressed());
    }

    #[test]
    fn test_lookup_by_path() {
        let mut list = FileManifestList::new(vec![file("a", &[]), file("b", &[])]);
        assert_eq!(list.position("b"), Some(1));
        assert!(list.get("c").is_none());
        list.push(file("c", &[]));
        assert_eq!(list.position("c"), Some(2));
    }
}
