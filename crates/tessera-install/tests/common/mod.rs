//! Shared fixtures: real chunk blobs, manifests built from them and a mock CDN

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha1::{Digest, Sha1};
use tempfile::TempDir;
use tessera_crypto::{ChunkGuid, ShaHash};
use tessera_formats::manifest::DEFAULT_FEATURE_LEVEL;
use tessera_formats::{
    CHUNK_WINDOW_SIZE, Chunk, ChunkDataList, ChunkInfo, ChunkPart, CustomFields, FileManifest,
    FileManifestList, Manifest, ManifestMeta,
};
use tessera_install::{InstallRequest, Installer, InstallerConfig, StateDir};
use tessera_protocol::RetryPolicy;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const MIB: u64 = 1024 * 1024;

pub fn guid(n: u32) -> ChunkGuid {
    ChunkGuid::from_parts([0x5EED, 0, 0, n])
}

/// Uncompressed window of chunk `n`
pub fn window(n: u32) -> Vec<u8> {
    (0..CHUNK_WINDOW_SIZE as u32)
        .map(|i| (i.wrapping_mul(31).wrapping_add(n.wrapping_mul(7919)) >> 3) as u8)
        .collect()
}

pub fn chunk(n: u32) -> Chunk {
    Chunk::new(guid(n), &window(n)).unwrap()
}

pub fn blob(n: u32) -> Vec<u8> {
    chunk(n).build(true).unwrap()
}

pub fn chunk_info(n: u32) -> ChunkInfo {
    let chunk = chunk(n);
    ChunkInfo {
        guid: guid(n),
        hash: chunk.header.rolling_hash,
        sha_hash: chunk.header.sha_hash.unwrap(),
        group_num: guid(n).group_num(),
        window_size: CHUNK_WINDOW_SIZE as u32,
        file_size: blob(n).len() as u64,
    }
}

/// Bytes of a file made of `(chunk, offset, size)` parts
pub fn content(parts: &[(u32, u32, u32)]) -> Vec<u8> {
    parts
        .iter()
        .flat_map(|&(n, offset, size)| window(n)[offset as usize..(offset + size) as usize].to_vec())
        .collect()
}

/// Manifest builder over real chunks
pub struct Build {
    version: String,
    base_url: Option<String>,
    chunks: BTreeMap<u32, ChunkInfo>,
    files: Vec<FileManifest>,
}

impl Build {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            base_url: None,
            chunks: BTreeMap::new(),
            files: Vec::new(),
        }
    }

    pub fn base_url(mut self, url: String) -> Self {
        self.base_url = Some(url);
        self
    }

    pub fn file(self, name: &str, parts: &[(u32, u32, u32)]) -> Self {
        self.tagged(name, parts, &[])
    }

    pub fn tagged(mut self, name: &str, parts: &[(u32, u32, u32)], tags: &[&str]) -> Self {
        for &(n, _, _) in parts {
            self.chunks.entry(n).or_insert_with(|| chunk_info(n));
        }
        let mut hasher = Sha1::new();
        hasher.update(content(parts));
        self.files.push(FileManifest {
            filename: name.to_string(),
            sha_hash: ShaHash::from_hasher(hasher),
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

    pub fn manifest(self) -> Manifest {
        let mut custom_fields = CustomFields::default();
        if let Some(url) = self.base_url {
            custom_fields.insert("BaseUrl", url);
        }
        Manifest {
            meta: ManifestMeta {
                app_name: "Sugar".to_string(),
                build_version: self.version,
                launch_exe: "Sugar.exe".to_string(),
                feature_level: DEFAULT_FEATURE_LEVEL,
                ..ManifestMeta::default()
            },
            chunk_data_list: ChunkDataList::new(self.chunks.into_values().collect()),
            file_manifest_list: FileManifestList::new(self.files),
            custom_fields,
            ..Manifest::default()
        }
    }
}

fn digits(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:03}")).collect()
}

/// The JSON form of a manifest built by [`Build`]
pub fn to_json(manifest: &Manifest) -> String {
    let files: Vec<serde_json::Value> = manifest
        .file_manifest_list
        .elements()
        .iter()
        .map(|f| {
            serde_json::json!({
                "Filename": f.filename,
                "FileHash": digits(f.sha_hash.as_bytes()),
                "InstallTags": f.install_tags,
                "FileChunkParts": f.chunk_parts.iter().map(|p| serde_json::json!({
                    "Guid": p.guid.to_string(),
                    "Offset": digits(&p.offset.to_le_bytes()),
                    "Size": digits(&p.size.to_le_bytes()),
                })).collect::<Vec<_>>(),
            })
        })
        .collect();

    let mut hashes = serde_json::Map::new();
    let mut shas = serde_json::Map::new();
    let mut groups = serde_json::Map::new();
    let mut sizes = serde_json::Map::new();
    for c in manifest.chunk_data_list.elements() {
        let key = c.guid.to_string();
        hashes.insert(key.clone(), digits(&c.hash.to_le_bytes()).into());
        shas.insert(key.clone(), c.sha_hash.to_hex().into());
        groups.insert(key.clone(), digits(&[c.group_num]).into());
        sizes.insert(key, digits(&c.file_size.to_le_bytes()).into());
    }
    let custom: serde_json::Map<String, serde_json::Value> = manifest
        .base_urls()
        .first()
        .map(|url| ("BaseUrl".to_string(), url.clone().into()))
        .into_iter()
        .collect();

    serde_json::json!({
        "ManifestFileVersion": digits(&manifest.meta.feature_level.to_le_bytes()),
        "AppNameString": manifest.meta.app_name,
        "BuildVersionString": manifest.meta.build_version,
        "LaunchExeString": manifest.meta.launch_exe,
        "FileManifestList": files,
        "ChunkHashList": hashes,
        "ChunkShaList": shas,
        "DataGroupList": groups,
        "ChunkFilesizeList": sizes,
        "CustomFields": custom,
    })
    .to_string()
}

/// CDN root on the mock server
pub fn cdn_base(server: &MockServer) -> String {
    format!("{}/Builds/Sugar/CloudDir", server.uri())
}

pub fn chunk_url_path(manifest: &Manifest, n: u32) -> String {
    let info = manifest.chunk(&guid(n)).unwrap();
    format!("/Builds/Sugar/CloudDir/{}", manifest.chunk_path(info))
}

/// Serve every chunk of `manifest`
pub async fn serve(server: &MockServer, manifest: &Manifest) {
    for info in manifest.chunk_data_list.elements() {
        serve_chunk(server, manifest, info.guid.parts()[3]).await;
    }
}

pub async fn serve_chunk(server: &MockServer, manifest: &Manifest, n: u32) {
    Mock::given(method("GET"))
        .and(path(chunk_url_path(manifest, n)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(blob(n)))
        .mount(server)
        .await;
}

/// Requests the server saw for chunk `n`
pub async fn hits(server: &MockServer, manifest: &Manifest, n: u32) -> usize {
    let wanted = chunk_url_path(manifest, n);
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == wanted)
        .count()
}

pub fn config() -> InstallerConfig {
    InstallerConfig::default()
        .with_workers(2)
        .with_shared_memory(64 * MIB)
        .with_update_interval(Duration::from_millis(50))
        .with_retry(
            RetryPolicy::default()
                .with_max_attempts(1)
                .with_initial_backoff(Duration::from_millis(5)),
        )
        .with_max_requeues(0)
        .with_verify_writes(true)
}

/// Temporary state and install directories
pub struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn state(&self) -> StateDir {
        StateDir::new(self.dir.path().join("state"))
    }

    pub fn game(&self) -> PathBuf {
        self.dir.path().join("game")
    }

    pub fn installer(&self) -> Installer {
        Installer::new(self.state(), config())
    }

    pub fn request(&self) -> InstallRequest {
        InstallRequest::new(self.game())
    }

    pub fn read(&self, name: &str) -> Vec<u8> {
        std::fs::read(self.game().join(name)).unwrap()
    }
}

/// Every path below `root`, relative and sorted
pub fn tree(root: &Path) -> Vec<String> {
    let mut paths: Vec<String> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            e.path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/")
        })
        .collect();
    paths.sort();
    paths
}
