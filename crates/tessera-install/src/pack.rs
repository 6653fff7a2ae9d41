//! Savegame packer
//!
//! Turns a directory into a fresh manifest plus the chunk blobs it
//! references, ready for upload. Files are visited in case-folded path
//! order and streamed back to back into 1 MiB chunks, so small files share
//! chunks and large ones span several.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha1::{Digest, Sha1};
use tessera_crypto::{ChunkGuid, ShaHash};
use tessera_formats::manifest::DEFAULT_FEATURE_LEVEL;
use tessera_formats::{
    CHUNK_WINDOW_SIZE, Chunk, ChunkDataList, ChunkInfo, ChunkPart, FileManifest, FileManifestList,
    Manifest, ManifestMeta,
};
use tracing::{debug, info};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::Result;

/// Custom field naming the Windows save folder
pub const SAVE_FOLDER_FIELD: &str = "CloudSaveFolder";

/// Custom field naming the macOS save folder
pub const SAVE_FOLDER_MAC_FIELD: &str = "CloudSaveFolder_MAC";

/// What to pack and how to label it
#[derive(Debug, Clone, Default)]
pub struct PackOptions {
    /// Application the saves belong to
    pub app_name: String,
    /// Account owning the saves, appended to the app name
    pub account_id: String,
    /// Save folder as configured for the game, stored in the manifest
    pub save_folder: String,
    /// macOS save folder, stored as `CloudSaveFolder_MAC`
    pub save_folder_mac: Option<String>,
    /// Build version; the local time when unset
    pub build_version: Option<String>,
}

/// Manifest and blobs keyed by upload path
#[derive(Debug, Clone)]
pub struct PackOutput {
    /// Manifest describing the packed files
    pub manifest: Manifest,
    /// Chunk blobs by CDN path, plus `manifests/{build_version}.manifest`
    pub files: BTreeMap<String, Vec<u8>>,
}

struct OpenChunk {
    guid: ChunkGuid,
    data: Vec<u8>,
}

impl OpenChunk {
    fn new() -> Self {
        Self {
            guid: ChunkGuid::from_u128(Uuid::new_v4().as_u128()),
            data: Vec::with_capacity(CHUNK_WINDOW_SIZE),
        }
    }
}

/// Pack every regular file below `source`
pub fn pack_directory(source: &Path, options: &PackOptions) -> Result<PackOutput> {
    let mut paths: Vec<(String, std::path::PathBuf)> = Vec::new();
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(source)
            .unwrap_or(entry.path())
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        paths.push((relative, entry.into_path()));
    }
    paths.sort_by_cached_key(|(relative, _)| relative.to_lowercase());

    let meta = ManifestMeta {
        app_name: format!("{}{}", options.app_name, options.account_id),
        build_version: options
            .build_version
            .clone()
            .unwrap_or_else(|| chrono::Local::now().format("%Y.%m.%d-%H.%M.%S").to_string()),
        feature_level: DEFAULT_FEATURE_LEVEL,
        ..ManifestMeta::default()
    };

    let mut manifest = Manifest {
        meta,
        ..Manifest::default()
    };
    let mut files = BTreeMap::new();
    let mut chunks = Vec::new();
    let mut file_list = Vec::with_capacity(paths.len());
    let mut current = OpenChunk::new();

    for (relative, path) in paths {
        let mut reader = File::open(&path)?;
        let mut hasher = Sha1::new();
        let mut parts = Vec::new();

        loop {
            let start = current.data.len();
            let space = (CHUNK_WINDOW_SIZE - start) as u64;
            let read = (&mut reader).take(space).read_to_end(&mut current.data)?;
            if read == 0 {
                break;
            }
            hasher.update(&current.data[start..]);
            parts.push(ChunkPart {
                guid: current.guid,
                offset: start as u32,
                size: read as u32,
            });
            if current.data.len() == CHUNK_WINDOW_SIZE {
                let full = std::mem::replace(&mut current, OpenChunk::new());
                chunks.push(finish_chunk(full, &manifest, &mut files)?);
            }
        }

        debug!("Packed {relative} in {} part(s)", parts.len());
        file_list.push(FileManifest {
            filename: relative,
            sha_hash: ShaHash::from_hasher(hasher),
            chunk_parts: parts,
            ..FileManifest::default()
        });
    }
    if !current.data.is_empty() {
        chunks.push(finish_chunk(current, &manifest, &mut files)?);
    }

    manifest.chunk_data_list = ChunkDataList::new(chunks);
    manifest.file_manifest_list = FileManifestList::new(file_list);
    manifest
        .custom_fields
        .insert(SAVE_FOLDER_FIELD, options.save_folder.clone());
    if let Some(mac) = &options.save_folder_mac {
        manifest.custom_fields.insert(SAVE_FOLDER_MAC_FIELD, mac.clone());
    }

    files.insert(
        format!("manifests/{}.manifest", manifest.meta.build_version),
        manifest.build()?,
    );
    info!(
        "Packed {} file(s) into {} chunk(s) for {}",
        manifest.file_manifest_list.len(),
        manifest.chunk_data_list.len(),
        manifest.meta.app_name
    );

    Ok(PackOutput { manifest, files })
}

fn finish_chunk(
    open: OpenChunk,
    manifest: &Manifest,
    files: &mut BTreeMap<String, Vec<u8>>,
) -> Result<ChunkInfo> {
    let chunk = Chunk::new(open.guid, &open.data)?;
    let blob = chunk.build(true)?;
    let info = ChunkInfo {
        guid: open.guid,
        hash: chunk.header.rolling_hash,
        sha_hash: chunk
            .header
            .sha_hash
            .unwrap_or_else(|| ShaHash::from_data(chunk.data())),
        group_num: open.guid.group_num(),
        window_size: CHUNK_WINDOW_SIZE as u32,
        file_size: blob.len() as u64,
    };
    files.insert(manifest.chunk_path(&info), blob);
    Ok(info)
}
