//! Builders for manifests used across unit tests

use tessera_crypto::{ChunkGuid, ShaHash};

use crate::manifest::{
    ChunkDataList, ChunkInfo, ChunkPart, CustomFields, FILE_EXECUTABLE, FileManifest,
    FileManifestList, Manifest, ManifestMeta,
};

pub fn chunk_info(guid: ChunkGuid) -> ChunkInfo {
    ChunkInfo {
        guid,
        hash: guid.as_u128() as u64,
        sha_hash: ShaHash::from_data(&guid.to_le_bytes()),
        group_num: guid.group_num(),
        window_size: 1024 * 1024,
        file_size: 4096,
    }
}

/// Manifest with one single-part file per entry; the number picks the content
pub fn manifest_with_files(files: &[(&str, u8)]) -> Manifest {
    let mut chunks = Vec::new();
    let mut entries = Vec::new();
    for (name, variant) in files {
        let digest = ShaHash::from_data(format!("{name}:{variant}").as_bytes());
        let mut guid_bytes = [0u8; 16];
        guid_bytes.copy_from_slice(&digest.as_bytes()[..16]);
        let guid = ChunkGuid::from_be_bytes(guid_bytes);
        chunks.push(chunk_info(guid));
        entries.push(FileManifest {
            filename: (*name).to_string(),
            sha_hash: digest,
            chunk_parts: vec![ChunkPart {
                guid,
                offset: 0,
                size: 100,
            }],
            ..FileManifest::default()
        });
    }
    Manifest {
        chunk_data_list: ChunkDataList::new(chunks),
        file_manifest_list: FileManifestList::new(entries),
        ..Manifest::default()
    }
}

/// Three files over two chunks with metadata and custom fields
pub fn sample_manifest() -> Manifest {
    let x = ChunkGuid::from_parts([1, 1, 1, 1]);
    let y = ChunkGuid::from_parts([2, 2, 2, 2]);

    let mut custom_fields = CustomFields::default();
    custom_fields.insert("BuildLabel", "Live");

    let files = vec![
        FileManifest {
            filename: "bin/sugar.exe".to_string(),
            sha_hash: ShaHash::from_data(b"exe"),
            flags: FILE_EXECUTABLE,
            install_tags: vec!["core".to_string()],
            chunk_parts: vec![
                ChunkPart {
                    guid: x,
                    offset: 0,
                    size: 1024 * 1024,
                },
                ChunkPart {
                    guid: y,
                    offset: 0,
                    size: 512,
                },
            ],
            ..FileManifest::default()
        },
        FileManifest {
            filename: "data/readme.txt".to_string(),
            sha_hash: ShaHash::from_data(b"readme"),
            chunk_parts: vec![ChunkPart {
                guid: y,
                offset: 512,
                size: 100,
            }],
            ..FileManifest::default()
        },
        FileManifest {
            filename: "data/empty.cfg".to_string(),
            sha_hash: ShaHash::from_data(b""),
            ..FileManifest::default()
        },
    ];

    Manifest {
        meta: ManifestMeta {
            data_version: 1,
            app_id: 7,
            app_name: "Sugar".to_string(),
            build_version: "1.0.0".to_string(),
            launch_exe: "bin/sugar.exe".to_string(),
            prereq_ids: vec!["runtime".to_string()],
            build_id: Some("build-1".to_string()),
            ..ManifestMeta::default()
        },
        chunk_data_list: ChunkDataList::new(vec![chunk_info(x), chunk_info(y)]),
        file_manifest_list: FileManifestList::new(files),
        custom_fields,
        ..Manifest::default()
    }
}

pub fn set_part_size(manifest: &mut Manifest, file: usize, part: usize, size: u32) {
    let mut entry = manifest.file_manifest_list.elements()[file].clone();
    entry.chunk_parts[part].size = size;
    manifest.file_manifest_list.replace(file, entry);
}

/// Encode an integer as `width` digit triplets
pub fn num_to_blob(value: u64, width: usize) -> String {
    (0..width)
        .map(|i| format!("{:03}", (value >> (8 * i)) & 0xFF))
        .collect()
}

/// One file over one chunk, JSON form
pub fn sample_json() -> String {
    let file_hash: String = (1..=20u64).map(|b| format!("{b:03}")).collect();
    format!(
        r#"{{
  "ManifestFileVersion": "013000000000",
  "bIsFileData": false,
  "AppID": "007000000000",
  "AppNameString": "Sugar",
  "BuildVersionString": "1.0.0",
  "LaunchExeString": "bin/game.exe",
  "LaunchCommand": "",
  "PrereqIds": [],
  "PrereqName": "",
  "PrereqPath": "",
  "PrereqArgs": "",
  "FileManifestList": [
    {{
      "Filename": "bin/game.exe",
      "FileHash": "{file_hash}",
      "bIsUnixExecutable": true,
      "InstallTags": ["core"],
      "FileChunkParts": [
        {{ "Guid": "0102030400000000000000000000000A", "Offset": "000000000000", "Size": "044001000000" }}
      ]
    }}
  ],
  "ChunkHashList": {{ "0102030400000000000000000000000A": "034017000000000000000000" }},
  "ChunkShaList": {{ "0102030400000000000000000000000A": "{sha}" }},
  "DataGroupList": {{ "0102030400000000000000000000000A": "042" }},
  "ChunkFilesizeList": {{ "0102030400000000000000000000000A": "232003000000000000000000" }},
  "CustomFields": {{ "BaseUrl": "http://cdn.test" }}
}}"#,
        sha = ShaHash::from_data(b"chunk").to_hex()
    )
}
