//! Build manifests
//!
//! A manifest describes one build of an application: every file as an
//! ordered list of chunk slices, every chunk those slices reference, and
//! metadata such as the launch executable.
//!
//! ## Binary layout
//!
//! ```text
//! header (41 bytes, magic 0x44BEC00C)
//! body (optionally zlib compressed, SHA-1 over the uncompressed bytes)
//!   meta               size-prefixed
//!   chunk data list    size-prefixed, column oriented
//!   file manifest list size-prefixed, column oriented
//!   custom fields      size-prefixed
//! ```
//!
//! Every section's size includes its own 4-byte size field and the reader
//! rejects sections that do not consume exactly that many bytes.
//!
//! ## JSON form
//!
//! Older builds ship a JSON manifest instead. It is accepted as input only
//! and converted to the same model; see [`Manifest::from_json`].
//!
//! ## Example
//!
//! ```
//! use tessera_formats::manifest::Manifest;
//!
//! let manifest = Manifest::default();
//! let bytes = manifest.build().unwrap();
//! let parsed = Manifest::parse(&bytes).unwrap();
//! assert_eq!(parsed.meta, manifest.meta);
//! ```

mod chunk_list;
mod codec;
mod compare;
mod custom_fields;
mod error;
mod file_list;
mod header;
mod json;
mod merge;
mod meta;

pub use chunk_list::{ChunkDataList, ChunkInfo};
pub use codec::{read_fstring, write_fstring};
pub use compare::ManifestComparison;
pub use custom_fields::CustomFields;
pub use error::{ManifestError, Result};
pub use file_list::{
    ChunkPart, FILE_COMPRESSED, FILE_EXECUTABLE, FILE_READ_ONLY, FileManifest, FileManifestList,
};
pub use header::{MANIFEST_COMPRESSED, MANIFEST_HEADER_SIZE, MANIFEST_MAGIC, ManifestHeader};
pub use json::{blob_to_bytes, blob_to_num};
pub use meta::ManifestMeta;

use binrw::io::{Cursor, SeekFrom};
use binrw::{BinRead, BinWrite};
use flate2::Compression;
use flate2::read::{ZlibDecoder, ZlibEncoder};
use std::collections::HashSet;
use std::io::{Read, Seek};
use tessera_crypto::{ChunkGuid, ShaHash};

/// Feature level written by new manifests
pub const DEFAULT_FEATURE_LEVEL: u32 = 18;

/// Highest feature level this codec understands
pub const MAX_FEATURE_LEVEL: u32 = 21;

/// CDN directory for chunks of a given manifest feature level
pub const fn chunk_dir(feature_level: u32) -> &'static str {
    if feature_level >= 15 {
        "ChunksV4"
    } else if feature_level >= 6 {
        "ChunksV3"
    } else if feature_level >= 3 {
        "ChunksV2"
    } else {
        "ChunksV1"
    }
}

/// A complete manifest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    /// Header as read, or the template used when building
    pub header: ManifestHeader,
    /// Build metadata
    pub meta: ManifestMeta,
    /// Every chunk referenced by the files
    pub chunk_data_list: ChunkDataList,
    /// Every file in the build
    pub file_manifest_list: FileManifestList,
    /// Free-form fields
    pub custom_fields: CustomFields,
}

impl Manifest {
    /// Parse a binary manifest
    ///
    /// # Errors
    /// Returns error if:
    /// - The magic or header is invalid
    /// - The body fails to decompress or its SHA-1 differs from the header
    /// - Any section does not consume exactly its declared size
    /// - The feature level is newer than [`MAX_FEATURE_LEVEL`]
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(ManifestError::Corrupt("manifest too short".to_string()));
        }
        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic != MANIFEST_MAGIC {
            return Err(ManifestError::InvalidMagic(magic));
        }

        let mut cursor = Cursor::new(data);
        let header = ManifestHeader::read(&mut cursor)?;
        if header.header_size < MANIFEST_HEADER_SIZE || header.header_size as usize > data.len() {
            return Err(ManifestError::Corrupt(format!(
                "invalid header size {}",
                header.header_size
            )));
        }
        if header.version > MAX_FEATURE_LEVEL {
            return Err(ManifestError::UnsupportedFeatureLevel {
                level: header.version,
                max: MAX_FEATURE_LEVEL,
            });
        }

        let stored = &data[header.header_size as usize..];
        let stored_len = header.size_compressed as usize;
        if stored.len() < stored_len {
            return Err(ManifestError::Corrupt(format!(
                "body truncated: expected {stored_len} bytes, got {}",
                stored.len()
            )));
        }
        let stored = &stored[..stored_len];

        let body = if header.is_compressed() {
            let body = decompress(stored, header.size_uncompressed as usize)?;
            let actual = ShaHash::from_data(&body);
            if actual != header.sha_hash {
                return Err(ManifestError::HashMismatch {
                    expected: header.sha_hash.to_hex(),
                    actual: actual.to_hex(),
                });
            }
            body
        } else {
            stored.to_vec()
        };

        let mut cursor = Cursor::new(body.as_slice());
        let meta = ManifestMeta::read_from(&mut cursor)?;
        if meta.feature_level > MAX_FEATURE_LEVEL {
            return Err(ManifestError::UnsupportedFeatureLevel {
                level: meta.feature_level,
                max: MAX_FEATURE_LEVEL,
            });
        }
        let chunk_data_list = ChunkDataList::read_from(&mut cursor)?;
        let file_manifest_list = FileManifestList::read_from(&mut cursor)?;
        let custom_fields = CustomFields::read_from(&mut cursor)?;

        Ok(Self {
            header,
            meta,
            chunk_data_list,
            file_manifest_list,
            custom_fields,
        })
    }

    /// Parse either form, detecting JSON by a leading `{`
    pub fn parse_any(data: &[u8]) -> Result<Self> {
        let first = data.iter().find(|b| !b.is_ascii_whitespace());
        if first == Some(&b'{') {
            Self::from_json(data)
        } else {
            Self::parse(data)
        }
    }

    /// Build the binary form, compressing if the header says so
    pub fn build(&self) -> Result<Vec<u8>> {
        self.build_with(self.header.is_compressed())
    }

    /// Build the binary form with explicit compression
    ///
    /// Storage-flag bits other than the compression bit are kept.
    pub fn build_with(&self, compress: bool) -> Result<Vec<u8>> {
        let mut body = Cursor::new(Vec::new());
        self.meta.write_to(&mut body)?;
        self.chunk_data_list.write_to(&mut body)?;
        self.file_manifest_list.write_to(&mut body)?;
        self.custom_fields.write_to(&mut body)?;
        let body = body.into_inner();

        let stored = if compress {
            let mut encoder = ZlibEncoder::new(body.as_slice(), Compression::default());
            let mut out = Vec::new();
            encoder.read_to_end(&mut out)?;
            out
        } else {
            body.clone()
        };

        let mut stored_as = self.header.stored_as & !MANIFEST_COMPRESSED;
        if compress {
            stored_as |= MANIFEST_COMPRESSED;
        }

        let header = ManifestHeader {
            header_size: MANIFEST_HEADER_SIZE,
            size_uncompressed: u32::try_from(body.len())
                .map_err(|_| ManifestError::Corrupt("body larger than 4 GiB".to_string()))?,
            size_compressed: stored.len() as u32,
            sha_hash: ShaHash::from_data(&body),
            stored_as,
            version: self.header.version,
        };

        let mut out = Cursor::new(Vec::with_capacity(stored.len() + 64));
        header.write(&mut out)?;
        out.seek(SeekFrom::End(0))?;
        let mut out = out.into_inner();
        out.extend_from_slice(&stored);
        Ok(out)
    }

    /// Check the structural invariants between files and chunks
    ///
    /// Every referenced chunk must appear exactly once in the chunk list and
    /// every part must lie inside its chunk's window.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.chunk_data_list.len());
        for chunk in self.chunk_data_list.elements() {
            if !seen.insert(chunk.guid) {
                return Err(ManifestError::Corrupt(format!(
                    "chunk {} listed more than once",
                    chunk.guid
                )));
            }
        }

        let mut paths = HashSet::with_capacity(self.file_manifest_list.len());
        for file in self.file_manifest_list.elements() {
            if !paths.insert(file.filename.as_str()) {
                return Err(ManifestError::Corrupt(format!(
                    "file {} listed more than once",
                    file.filename
                )));
            }
            for part in &file.chunk_parts {
                let Some(chunk) = self.chunk_data_list.get(&part.guid) else {
                    return Err(ManifestError::Corrupt(format!(
                        "file {} references unknown chunk {}",
                        file.filename, part.guid
                    )));
                };
                if u64::from(part.offset) + u64::from(part.size) > u64::from(chunk.window_size) {
                    return Err(ManifestError::Corrupt(format!(
                        "file {} part {}+{} exceeds window of chunk {}",
                        file.filename, part.offset, part.size, part.guid
                    )));
                }
            }
        }
        Ok(())
    }

    /// CDN path of a chunk for this manifest's feature level
    pub fn chunk_path(&self, chunk: &ChunkInfo) -> String {
        chunk.path(self.meta.feature_level)
    }

    /// Look up a file by path
    pub fn file(&self, path: &str) -> Option<&FileManifest> {
        self.file_manifest_list.get(path)
    }

    /// Look up a chunk by identifier
    pub fn chunk(&self, guid: &ChunkGuid) -> Option<&ChunkInfo> {
        self.chunk_data_list.get(guid)
    }

    /// CDN base URLs listed in the comma separated `BaseUrl` custom field
    pub fn base_urls(&self) -> Vec<String> {
        self.custom_fields
            .get("BaseUrl")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Largest chunk window, or one full window for an empty manifest
    pub fn biggest_chunk(&self) -> u64 {
        self.chunk_data_list
            .elements()
            .iter()
            .map(|c| u64::from(c.window_size))
            .max()
            .unwrap_or(crate::chunk::CHUNK_WINDOW_SIZE as u64)
    }
}

fn decompress(stored: &[u8], expected: usize) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(stored).take(expected as u64 + 1);
    let mut body = Vec::with_capacity(expected);
    decoder
        .read_to_end(&mut body)
        .map_err(|e| ManifestError::DecompressionFailed(e.to_string()))?;
    if body.len() != expected {
        return Err(ManifestError::Corrupt(format!(
            "body decompressed to {} bytes, header declares {expected}",
            body.len()
        )));
    }
    Ok(body)
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_utils::{sample_manifest, set_part_size};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_round_trip_compressed_and_plain() {
        let manifest = sample_manifest();
        for compress in [true, false] {
            let bytes = manifest.build_with(compress).unwrap();
            let parsed = Manifest::parse(&bytes).unwrap();
            assert_eq!(parsed.header.is_compressed(), compress);
            assert_eq!(parsed.meta, manifest.meta);
            assert_eq!(parsed.chunk_data_list, manifest.chunk_data_list);
            assert_eq!(parsed.file_manifest_list, manifest.file_manifest_list);
            assert_eq!(parsed.custom_fields, manifest.custom_fields);
        }
    }

    #[test]
    fn test_rebuild_is_stable() {
        let bytes = sample_manifest().build().unwrap();
        let rebuilt = Manifest::parse(&bytes).unwrap().build().unwrap();
        assert_eq!(bytes, rebuilt);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = sample_manifest().build().unwrap();
        bytes[0] = 0;
        assert!(matches!(
            Manifest::parse(&bytes),
            Err(ManifestError::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_body_hash_checked() {
        let manifest = sample_manifest();
        let mut bytes = manifest.build_with(true).unwrap();
        // flip a byte of the stored SHA-1
        bytes[16] ^= 0xFF;
        assert!(matches!(
            Manifest::parse(&bytes),
            Err(ManifestError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_newer_feature_level_rejected() {
        let mut manifest = sample_manifest();
        manifest.meta.feature_level = MAX_FEATURE_LEVEL + 1;
        let bytes = manifest.build().unwrap();
        let err = Manifest::parse(&bytes).unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn test_validate_accepts_sample() {
        sample_manifest().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_part_outside_window() {
        let mut manifest = sample_manifest();
        set_part_size(&mut manifest, 0, 0, 2 * 1024 * 1024);
        assert!(matches!(
            manifest.validate(),
            Err(ManifestError::Corrupt(_))
        ));
    }

    #[test]
    fn test_validate_rejects_unknown_chunk() {
        let mut manifest = sample_manifest();
        manifest.chunk_data_list = ChunkDataList::new(Vec::new());
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_chunk_dir_thresholds() {
        assert_eq!(chunk_dir(21), "ChunksV4");
        assert_eq!(chunk_dir(15), "ChunksV4");
        assert_eq!(chunk_dir(14), "ChunksV3");
        assert_eq!(chunk_dir(6), "ChunksV3");
        assert_eq!(chunk_dir(5), "ChunksV2");
        assert_eq!(chunk_dir(3), "ChunksV2");
        assert_eq!(chunk_dir(2), "ChunksV1");
    }

    #[test]
    fn test_parse_any_detects_binary() {
        let bytes = sample_manifest().build().unwrap();
        let parsed = Manifest::parse_any(&bytes).unwrap();
        assert_eq!(parsed.meta.app_name, "Sugar");
    }

    #[test]
    fn test_base_urls_split_and_trimmed() {
        let mut manifest = sample_manifest();
        assert!(manifest.base_urls().is_empty());
        manifest
            .custom_fields
            .insert("BaseUrl", "http://a.test/builds, http://b.test/builds,");
        assert_eq!(
            manifest.base_urls(),
            vec!["http://a.test/builds", "http://b.test/builds"]
        );
    }
}
