//! JSON manifest ingest
//!
//! The JSON form stores integers as "digit triplet" strings: each byte of
//! the little-endian value is written as a zero-padded three digit decimal
//! number, so `0x0102` becomes `"002001"`. Chunk identifiers are plain hex
//! (four big-endian words) and chunk SHA-1s are hex digests.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use tessera_crypto::{ChunkGuid, ShaHash};

use super::error::{ManifestError, Result};
use super::{
    ChunkDataList, ChunkInfo, ChunkPart, CustomFields, FILE_COMPRESSED, FILE_EXECUTABLE,
    FILE_READ_ONLY, FileManifest, FileManifestList, Manifest, ManifestHeader, ManifestMeta,
    MAX_FEATURE_LEVEL,
};
use crate::chunk::CHUNK_WINDOW_SIZE;

/// Feature level assumed when a JSON manifest omits it
const JSON_DEFAULT_VERSION: &str = "013000000000";

#[derive(Debug, Deserialize)]
struct JsonManifest {
    #[serde(rename = "ManifestFileVersion", default = "default_version")]
    manifest_file_version: String,
    #[serde(rename = "bIsFileData", default)]
    is_file_data: bool,
    #[serde(rename = "AppID", default)]
    app_id: Option<String>,
    #[serde(rename = "AppNameString", default)]
    app_name: String,
    #[serde(rename = "BuildVersionString", default)]
    build_version: String,
    #[serde(rename = "LaunchExeString", default)]
    launch_exe: String,
    #[serde(rename = "LaunchCommand", default)]
    launch_command: String,
    #[serde(rename = "PrereqIds", default)]
    prereq_ids: Vec<String>,
    #[serde(rename = "PrereqName", default)]
    prereq_name: String,
    #[serde(rename = "PrereqPath", default)]
    prereq_path: String,
    #[serde(rename = "PrereqArgs", default)]
    prereq_args: String,
    #[serde(rename = "FileManifestList", default)]
    file_manifest_list: Vec<JsonFile>,
    #[serde(rename = "ChunkHashList", default)]
    chunk_hash_list: HashMap<String, String>,
    #[serde(rename = "ChunkShaList", default)]
    chunk_sha_list: HashMap<String, String>,
    #[serde(rename = "DataGroupList", default)]
    data_group_list: HashMap<String, String>,
    #[serde(rename = "ChunkFilesizeList", default)]
    chunk_filesize_list: HashMap<String, String>,
    #[serde(rename = "CustomFields", default)]
    custom_fields: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct JsonFile {
    #[serde(rename = "Filename", default)]
    filename: String,
    #[serde(rename = "FileHash")]
    file_hash: String,
    #[serde(rename = "bIsReadOnly", default)]
    is_read_only: bool,
    #[serde(rename = "bIsCompressed", default)]
    is_compressed: bool,
    #[serde(rename = "bIsUnixExecutable", default)]
    is_unix_executable: bool,
    #[serde(rename = "InstallTags", default)]
    install_tags: Vec<String>,
    #[serde(rename = "FileChunkParts", default)]
    file_chunk_parts: Vec<JsonChunkPart>,
}

#[derive(Debug, Deserialize)]
struct JsonChunkPart {
    #[serde(rename = "Guid")]
    guid: String,
    #[serde(rename = "Offset")]
    offset: String,
    #[serde(rename = "Size")]
    size: String,
}

fn default_version() -> String {
    JSON_DEFAULT_VERSION.to_string()
}

/// Decode a digit-triplet string into an integer
///
/// # Examples
///
/// ```
/// use tessera_formats::manifest::blob_to_num;
///
/// assert_eq!(blob_to_num("002001").unwrap(), 0x0102);
/// assert_eq!(blob_to_num("018000000000").unwrap(), 18);
/// ```
pub fn blob_to_num(blob: &str) -> Result<u64> {
    let bytes = blob_to_bytes(blob)?;
    if bytes.iter().skip(8).any(|&b| b != 0) {
        return Err(ManifestError::Corrupt(format!(
            "digit blob {blob} does not fit in 64 bits"
        )));
    }
    Ok(bytes
        .iter()
        .take(8)
        .enumerate()
        .fold(0u64, |acc, (i, &b)| acc | (u64::from(b) << (8 * i))))
}

/// Decode a digit-triplet string into its little-endian bytes
pub fn blob_to_bytes(blob: &str) -> Result<Vec<u8>> {
    let blob = blob.as_bytes();
    if blob.len() % 3 != 0 {
        return Err(ManifestError::Corrupt(format!(
            "digit blob length {} is not a multiple of 3",
            blob.len()
        )));
    }
    blob.chunks_exact(3)
        .map(|triplet| {
            let text = std::str::from_utf8(triplet)
                .map_err(|_| ManifestError::Corrupt("non-ASCII digit blob".to_string()))?;
            text.parse::<u8>()
                .map_err(|_| ManifestError::Corrupt(format!("invalid digit triplet {text}")))
        })
        .collect()
}

fn blob_to<T: TryFrom<u64>>(blob: &str, what: &str) -> Result<T> {
    let value = blob_to_num(blob)?;
    T::try_from(value).map_err(|_| ManifestError::Corrupt(format!("{what} {value} out of range")))
}

impl Manifest {
    /// Convert a JSON manifest into the binary model
    ///
    /// The chunk list is ordered by first reference from the file list;
    /// chunks no file references follow in identifier order.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let json: JsonManifest = serde_json::from_slice(data)?;

        let feature_level: u32 = blob_to(&json.manifest_file_version, "feature level")?;
        if feature_level > MAX_FEATURE_LEVEL {
            return Err(ManifestError::UnsupportedFeatureLevel {
                level: feature_level,
                max: MAX_FEATURE_LEVEL,
            });
        }

        let meta = ManifestMeta {
            data_version: 0,
            feature_level,
            is_file_data: json.is_file_data,
            app_id: match &json.app_id {
                Some(blob) => blob_to(blob, "app id")?,
                None => 0,
            },
            app_name: json.app_name,
            build_version: json.build_version,
            launch_exe: json.launch_exe,
            launch_command: json.launch_command,
            prereq_ids: json.prereq_ids,
            prereq_name: json.prereq_name,
            prereq_path: json.prereq_path,
            prereq_args: json.prereq_args,
            ..ManifestMeta::default()
        };

        let mut files = Vec::with_capacity(json.file_manifest_list.len());
        let mut chunk_order: Vec<String> = Vec::new();
        let mut ordered: HashSet<String> = HashSet::new();

        for file in json.file_manifest_list {
            let mut hash = blob_to_bytes(&file.file_hash)?;
            if hash.len() > ShaHash::LEN && hash[ShaHash::LEN..].iter().any(|&b| b != 0) {
                return Err(ManifestError::Corrupt(format!(
                    "file hash of {} longer than 20 bytes",
                    file.filename
                )));
            }
            hash.resize(ShaHash::LEN, 0);

            let mut flags = 0u8;
            if file.is_read_only {
                flags |= FILE_READ_ONLY;
            }
            if file.is_compressed {
                flags |= FILE_COMPRESSED;
            }
            if file.is_unix_executable {
                flags |= FILE_EXECUTABLE;
            }

            let mut chunk_parts = Vec::with_capacity(file.file_chunk_parts.len());
            for part in file.file_chunk_parts {
                let key = part.guid.to_ascii_uppercase();
                if ordered.insert(key.clone()) {
                    chunk_order.push(key);
                }
                chunk_parts.push(ChunkPart {
                    guid: ChunkGuid::from_hex(&part.guid)?,
                    offset: blob_to(&part.offset, "chunk part offset")?,
                    size: blob_to(&part.size, "chunk part size")?,
                });
            }

            files.push(FileManifest {
                filename: file.filename,
                sha_hash: ShaHash::from_slice(&hash)?,
                flags,
                install_tags: file.install_tags,
                chunk_parts,
                ..FileManifest::default()
            });
        }

        let hashes = upper_keys(json.chunk_hash_list);
        let shas = upper_keys(json.chunk_sha_list);
        let groups = upper_keys(json.data_group_list);
        let sizes = upper_keys(json.chunk_filesize_list);

        let mut unreferenced: Vec<&String> = sizes.keys().filter(|k| !ordered.contains(*k)).collect();
        unreferenced.sort();
        let unreferenced: Vec<String> = unreferenced.into_iter().cloned().collect();

        let mut chunks = Vec::with_capacity(chunk_order.len() + unreferenced.len());
        for key in chunk_order.iter().chain(&unreferenced) {
            let missing = |list: &str| {
                ManifestError::Corrupt(format!("chunk {key} missing from {list}"))
            };
            let guid = ChunkGuid::from_hex(key)?;
            chunks.push(ChunkInfo {
                guid,
                hash: blob_to_num(hashes.get(key).ok_or_else(|| missing("ChunkHashList"))?)?,
                sha_hash: ShaHash::from_hex(shas.get(key).ok_or_else(|| missing("ChunkShaList"))?)?,
                group_num: match groups.get(key) {
                    Some(blob) => blob_to(blob, "data group")?,
                    None => guid.group_num(),
                },
                window_size: CHUNK_WINDOW_SIZE as u32,
                file_size: blob_to_num(
                    sizes.get(key).ok_or_else(|| missing("ChunkFilesizeList"))?,
                )?,
            });
        }

        Ok(Self {
            header: ManifestHeader {
                version: feature_level,
                ..ManifestHeader::default()
            },
            meta,
            chunk_data_list: ChunkDataList::new(chunks),
            file_manifest_list: FileManifestList::new(files),
            custom_fields: CustomFields {
                version: 0,
                fields: json.custom_fields,
            },
        })
    }
}

fn upper_keys(map: HashMap<String, String>) -> HashMap<String, String> {
    map.into_iter()
        .map(|(k, v)| (k.to_ascii_uppercase(), v))
        .collect()
}
