//! Manifest and chunk builders for unit tests
//!
//! Chunk `n` has identifier `[0, 0, 0, n]` and a deterministic payload, so
//! file hashes computed here match what the writer produces.

use std::collections::BTreeMap;

use sha1::{Digest, Sha1};
use tessera_crypto::{ChunkGuid, ShaHash};
use tessera_formats::manifest::{DEFAULT_FEATURE_LEVEL, FILE_EXECUTABLE};
use tessera_formats::{
    CHUNK_WINDOW_SIZE, Chunk, ChunkDataList, ChunkInfo, ChunkPart, FileManifest, FileManifestList,
    Manifest, ManifestMeta,
};

pub fn guid(n: u32) -> ChunkGuid {
    ChunkGuid::from_parts([0, 0, 0, n])
}

pub fn payload_byte(n: u32, index: u32) -> u8 {
    (index.wrapping_mul(2_654_435_761).wrapping_add(n.wrapping_mul(97)) >> 24) as u8
}

pub fn chunk_payload(n: u32) -> Vec<u8> {
    (0..CHUNK_WINDOW_SIZE as u32)
        .map(|i| payload_byte(n, i))
        .collect()
}

/// Serialised chunk blob as served by a CDN
pub fn chunk_blob(n: u32, compress: bool) -> Vec<u8> {
    Chunk::new(guid(n), &chunk_payload(n))
        .unwrap()
        .build(compress)
        .unwrap()
}

/// Bytes of a file made of `(chunk, offset, size)` parts
pub fn file_content(parts: &[(u32, u32, u32)]) -> Vec<u8> {
    parts
        .iter()
        .flat_map(|&(n, offset, size)| (offset..offset + size).map(move |i| payload_byte(n, i)))
        .collect()
}

#[derive(Default)]
pub struct ManifestBuilder {
    files: Vec<FileManifest>,
    chunks: BTreeMap<u32, ChunkInfo>,
}

impl ManifestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(self, name: &str, parts: &[(u32, u32, u32)]) -> Self {
        self.add(name, parts, &[], 0)
    }

    pub fn tagged_file(self, name: &str, parts: &[(u32, u32, u32)], tags: &[&str]) -> Self {
        self.add(name, parts, tags, 0)
    }

    pub fn executable_file(self, name: &str, parts: &[(u32, u32, u32)]) -> Self {
        self.add(name, parts, &[], FILE_EXECUTABLE)
    }

    pub fn empty_file(self, name: &str) -> Self {
        self.add(name, &[], &[], 0)
    }

    fn add(mut self, name: &str, parts: &[(u32, u32, u32)], tags: &[&str], flags: u8) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(file_content(parts));

        for &(n, _, _) in parts {
            self.chunks.entry(n).or_insert_with(|| ChunkInfo {
                guid: guid(n),
                hash: u64::from(n),
                sha_hash: ShaHash::from_data(&n.to_le_bytes()),
                group_num: guid(n).group_num(),
                window_size: CHUNK_WINDOW_SIZE as u32,
                file_size: 1000 + u64::from(n),
            });
        }

        self.files.push(FileManifest {
            filename: name.to_string(),
            sha_hash: ShaHash::from_hasher(hasher),
            flags,
            install_tags: tags.iter().map(ToString::to_string).collect(),
            chunk_parts: parts
                .iter()
                .map(|&(n, offset, size)| ChunkPart {
                    guid: guid(n),
                    offset,
                    size,
                })
                .collect(),
            ..FileManifest::default()
        });
        self
    }

    pub fn build(self) -> Manifest {
        Manifest {
            meta: ManifestMeta {
                app_name: "Sugar".to_string(),
                build_version: "1.0".to_string(),
                feature_level: DEFAULT_FEATURE_LEVEL,
                ..ManifestMeta::default()
            },
            chunk_data_list: ChunkDataList::new(self.chunks.into_values().collect()),
            file_manifest_list: FileManifestList::new(self.files),
            ..Manifest::default()
        }
    }
}

/// Serves the blobs of every chunk a manifest references
pub struct MemorySource {
    blobs: std::collections::HashMap<String, bytes::Bytes>,
    requests: std::sync::atomic::AtomicU32,
}

impl MemorySource {
    pub fn for_manifest(manifest: &Manifest) -> Self {
        let blobs = manifest
            .chunk_data_list
            .elements()
            .iter()
            .map(|c| {
                let blob = chunk_blob(c.guid.parts()[3], true);
                (manifest.chunk_path(c), bytes::Bytes::from(blob))
            })
            .collect();
        Self {
            blobs,
            requests: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn requests(&self) -> u32 {
        self.requests.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl tessera_protocol::ChunkSource for MemorySource {
    async fn fetch(&self, path: &str) -> tessera_protocol::Result<bytes::Bytes> {
        self.requests
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.blobs
            .get(path)
            .cloned()
            .ok_or(tessera_protocol::ProtocolError::Timeout)
    }
}
