//! Planned work items
//!
//! The analyser turns a manifest comparison into an ordered list of
//! [`Task`]s. File tasks are forwarded to the writer as-is; chunk tasks
//! append a slice of a downloaded chunk (or of an old file) to the file
//! currently open.

use tessera_crypto::ChunkGuid;

/// Suffix of the temporary file used when a file reuses its own old bytes
pub const TMP_SUFFIX: &str = ".tmp";

/// File-system operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileTask {
    /// Open (truncate) a file for writing
    Open {
        /// Path relative to the install root
        path: String,
    },
    /// Close the file currently open
    Close {
        /// Path that was opened
        path: String,
    },
    /// Create a zero-byte file
    CreateEmpty {
        /// Path relative to the install root
        path: String,
    },
    /// Remove a file
    Delete {
        /// Path relative to the install root
        path: String,
        /// Swallow errors
        silent: bool,
    },
    /// Move `source` over `target`
    Rename {
        /// Temporary file
        source: String,
        /// Final file name
        target: String,
        /// Remove `target` first
        delete_first: bool,
    },
    /// Set the executable bits
    MakeExecutable {
        /// Path relative to the install root
        path: String,
    },
}

/// Where a chunk task's bytes come from when not downloaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OldFileSource {
    /// Old file, relative to the install root
    pub path: String,
    /// Absolute byte offset inside the old file
    pub offset: u64,
}

/// Append a chunk slice to the open file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkTask {
    /// Chunk the bytes belong to
    pub guid: ChunkGuid,
    /// Offset inside the chunk window
    pub chunk_offset: u32,
    /// Number of bytes
    pub size: u32,
    /// Last consumer of a downloaded chunk: release its slot afterwards
    pub cleanup: bool,
    /// Copy from an old file instead of a downloaded chunk
    pub old_file: Option<OldFileSource>,
}

impl ChunkTask {
    /// Task that consumes a downloaded chunk
    pub const fn download(guid: ChunkGuid, chunk_offset: u32, size: u32) -> Self {
        Self {
            guid,
            chunk_offset,
            size,
            cleanup: false,
            old_file: None,
        }
    }

    /// Whether the bytes come from disk
    pub const fn is_reuse(&self) -> bool {
        self.old_file.is_some()
    }
}

/// One planned step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// File-system operation
    File(FileTask),
    /// Chunk slice append
    Chunk(ChunkTask),
}

impl From<FileTask> for Task {
    fn from(task: FileTask) -> Self {
        Self::File(task)
    }
}

impl From<ChunkTask> for Task {
    fn from(task: ChunkTask) -> Self {
        Self::Chunk(task)
    }
}

/// Strip the temporary suffix, if any
pub fn final_path(path: &str) -> &str {
    path.strip_suffix(TMP_SUFFIX).unwrap_or(path)
}
