//! File writer
//!
//! A single writer owns every file-system side effect of an install run.
//! It processes [`FileOp`]s strictly in the order they arrive, holds at most
//! one output file open, and answers each op with exactly one
//! [`WriterResult`].

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha1::{Digest, Sha1};
use tessera_crypto::{ChunkGuid, ShaHash};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::arena::{SharedArena, Slot};
use crate::error::{InstallError, Result};

/// One file-system operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOp {
    /// Create parent directories and open `path` truncated
    Open {
        /// Path relative to the install root
        path: String,
        /// Digest the finished file must have, checked on close when
        /// write verification is on
        expected_hash: Option<ShaHash>,
    },
    /// Flush and close the open file
    Close {
        /// Path that was opened
        path: String,
    },
    /// Remove a file; a missing file is not an error
    Delete {
        /// Path relative to the install root
        path: String,
        /// Swallow every error
        silent: bool,
    },
    /// Create a zero-byte file
    CreateEmpty {
        /// Path relative to the install root
        path: String,
    },
    /// Move `source` to `target`
    Rename {
        /// Existing file
        source: String,
        /// New name
        target: String,
        /// Remove `target` first
        delete_first: bool,
    },
    /// Add the executable bits
    MakeExecutable {
        /// Path relative to the install root
        path: String,
    },
    /// Append bytes held in an arena slot
    WriteFromSlot {
        /// Chunk stored in the slot
        guid: ChunkGuid,
        /// Source slot
        slot: Slot,
        /// Offset inside the chunk
        offset: u32,
        /// Number of bytes
        size: u32,
        /// Last consumer of the slot
        release: bool,
    },
    /// Append bytes copied from a file already on disk
    WriteFromOldFile {
        /// Path relative to the install root
        path: String,
        /// Absolute offset in that file
        offset: u64,
        /// Number of bytes
        size: u32,
    },
    /// Append bytes from the on-disk chunk cache
    WriteFromCache {
        /// Path relative to the cache directory
        path: String,
        /// Offset in the cached file
        offset: u64,
        /// Number of bytes
        size: u32,
    },
}

impl FileOp {
    /// Slot to hand back to the arena once this op has run
    pub const fn released_slot(&self) -> Option<Slot> {
        match self {
            Self::WriteFromSlot {
                slot,
                release: true,
                ..
            } => Some(*slot),
            _ => None,
        }
    }
}

/// Message on the writer queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterMessage {
    /// Operation to run
    Op(FileOp),
    /// Close any open file and stop
    Terminate,
}

/// Outcome of one [`FileOp`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterResult {
    /// The operation
    pub op: FileOp,
    /// Failure description
    pub error: Option<String>,
    /// Bytes appended to the output file
    pub bytes_written: u64,
    /// Bytes read from disk
    pub bytes_read: u64,
}

impl WriterResult {
    /// Whether the op succeeded
    pub const fn success(&self) -> bool {
        self.error.is_none()
    }
}

struct OutputFile {
    path: String,
    out: BufWriter<File>,
    hasher: Option<Sha1>,
    expected: Option<ShaHash>,
}

/// Serial file-system executor rooted at an install directory
pub struct Writer {
    root: PathBuf,
    cache_dir: Option<PathBuf>,
    arena: Arc<SharedArena>,
    verify_writes: bool,
    current: Option<OutputFile>,
    old_file: Option<(String, File)>,
}

impl Writer {
    /// Writer for `root`, reading downloaded chunks from `arena`
    pub fn new(root: impl Into<PathBuf>, arena: Arc<SharedArena>, verify_writes: bool) -> Self {
        Self {
            root: root.into(),
            cache_dir: None,
            arena,
            verify_writes,
            current: None,
            old_file: None,
        }
    }

    /// Directory consulted by [`FileOp::WriteFromCache`]
    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Run one operation, returning `(bytes_written, bytes_read)`
    pub fn process(&mut self, op: &FileOp) -> Result<(u64, u64)> {
        match op {
            FileOp::Open {
                path,
                expected_hash,
            } => {
                if let Some(current) = &self.current {
                    return Err(io::Error::other(format!(
                        "cannot open {path}: {} is still open",
                        current.path
                    ))
                    .into());
                }
                let full = self.full_path(path);
                create_parent(&full)?;
                let file = File::create(&full)?;
                self.current = Some(OutputFile {
                    path: path.clone(),
                    out: BufWriter::new(file),
                    hasher: (self.verify_writes && expected_hash.is_some()).then(Sha1::new),
                    expected: *expected_hash,
                });
                trace!("Opened {path}");
                Ok((0, 0))
            }
            FileOp::Close { path } => {
                self.old_file = None;
                let Some(mut current) = self.current.take() else {
                    debug!("Close of {path} without an open file");
                    return Ok((0, 0));
                };
                current.out.flush()?;
                drop(current.out);
                if let (Some(hasher), Some(expected)) = (current.hasher, current.expected) {
                    let actual = ShaHash::from_hasher(hasher);
                    if actual != expected {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!(
                                "{path}: hash mismatch, expected {expected}, got {actual}"
                            ),
                        )
                        .into());
                    }
                }
                trace!("Closed {path}");
                Ok((0, 0))
            }
            FileOp::Delete { path, silent } => {
                match fs::remove_file(self.full_path(path)) {
                    Ok(()) => debug!("Deleted {path}"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) if *silent => trace!("Ignoring failed delete of {path}: {e}"),
                    Err(e) => return Err(e.into()),
                }
                Ok((0, 0))
            }
            FileOp::CreateEmpty { path } => {
                let full = self.full_path(path);
                create_parent(&full)?;
                OpenOptions::new().create(true).append(true).open(&full)?;
                Ok((0, 0))
            }
            FileOp::Rename {
                source,
                target,
                delete_first,
            } => {
                self.old_file = None;
                let target_path = self.full_path(target);
                if *delete_first {
                    match fs::remove_file(&target_path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                create_parent(&target_path)?;
                fs::rename(self.full_path(source), &target_path)?;
                trace!("Renamed {source} to {target}");
                Ok((0, 0))
            }
            FileOp::MakeExecutable { path } => {
                make_executable(&self.full_path(path))?;
                Ok((0, 0))
            }
            FileOp::WriteFromSlot {
                guid,
                slot,
                offset,
                size,
                ..
            } => {
                let arena = Arc::clone(&self.arena);
                let current = self.current_file(&guid.to_hex())?;
                arena.with_slice(*slot, *offset as usize, *size as usize, |bytes| {
                    current.append(bytes)
                })??;
                Ok((u64::from(*size), 0))
            }
            FileOp::WriteFromOldFile { path, offset, size } => {
                let bytes = self.read_old(path, *offset, *size)?;
                self.current_file(path)?.append(&bytes)?;
                Ok((u64::from(*size), u64::from(*size)))
            }
            FileOp::WriteFromCache { path, offset, size } => {
                let dir = self.cache_dir.as_ref().ok_or_else(|| {
                    InstallError::Config(format!("no chunk cache directory for {path}"))
                })?;
                let mut file = File::open(dir.join(path))?;
                let bytes = read_at(&mut file, *offset, *size)?;
                self.current_file(path)?.append(&bytes)?;
                Ok((u64::from(*size), u64::from(*size)))
            }
        }
    }

    /// Flush and drop the open file, if any
    pub fn finish(&mut self) -> Result<()> {
        self.old_file = None;
        if let Some(mut current) = self.current.take() {
            warn!("Writer stopped with {} still open", current.path);
            current.out.flush()?;
        }
        Ok(())
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn current_file(&mut self, source: &str) -> Result<&mut OutputFile> {
        self.current.as_mut().ok_or_else(|| {
            InstallError::from(io::Error::other(format!(
                "no open file to append {source} to"
            )))
        })
    }

    fn read_old(&mut self, path: &str, offset: u64, size: u32) -> Result<Vec<u8>> {
        let reuse = matches!(&self.old_file, Some((open, _)) if open == path);
        if !reuse {
            let file = File::open(self.full_path(path))?;
            self.old_file = Some((path.to_string(), file));
        }
        match &mut self.old_file {
            Some((_, file)) => Ok(read_at(file, offset, size)?),
            None => Err(io::Error::other(format!("{path} is not open")).into()),
        }
    }
}

impl OutputFile {
    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        if let Some(hasher) = &mut self.hasher {
            hasher.update(bytes);
        }
        self.out.write_all(bytes)
    }
}

fn read_at(file: &mut File, offset: u64, size: u32) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; size as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

fn create_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_mode(permissions.mode() | 0o111);
    fs::set_permissions(path, permissions)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Writer loop for a blocking thread
///
/// Returns once a [`WriterMessage::Terminate`] arrives, the queue closes,
/// or the result receiver goes away.
pub fn run_writer(
    mut writer: Writer,
    mut ops: mpsc::Receiver<WriterMessage>,
    results: mpsc::Sender<WriterResult>,
) {
    debug!("Writer started in {}", writer.root.display());
    while let Some(WriterMessage::Op(op)) = ops.blocking_recv() {
        let result = match writer.process(&op) {
            Ok((bytes_written, bytes_read)) => WriterResult {
                op,
                error: None,
                bytes_written,
                bytes_read,
            },
            Err(err) => {
                error!("Writer failed on {op:?}: {err}");
                WriterResult {
                    op,
                    error: Some(err.to_string()),
                    bytes_written: 0,
                    bytes_read: 0,
                }
            }
        };
        if results.blocking_send(result).is_err() {
            break;
        }
    }
    if let Err(err) = writer.finish() {
        warn!("Writer shutdown: {err}");
    }
    debug!("Writer stopped");
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn arena() -> Arc<SharedArena> {
        Arc::new(SharedArena::new(64, 16).unwrap())
    }

    fn open(path: &str) -> FileOp {
        FileOp::Open {
            path: path.to_string(),
            expected_hash: None,
        }
    }

    fn close(path: &str) -> FileOp {
        FileOp::Close {
            path: path.to_string(),
        }
    }

    #[test]
    fn test_assemble_from_slot_and_old_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("old.bin"), b"0123456789").unwrap();
        let arena = arena();
        let slot = arena.acquire().unwrap();
        arena.write(slot, b"abcdefgh").unwrap();

        let mut writer = Writer::new(dir.path(), Arc::clone(&arena), false);
        writer.process(&open("sub/new.bin")).unwrap();
        let (written, read) = writer
            .process(&FileOp::WriteFromSlot {
                guid: ChunkGuid::from_parts([0, 0, 0, 1]),
                slot,
                offset: 2,
                size: 3,
                release: true,
            })
            .unwrap();
        assert_eq!((written, read), (3, 0));
        let (written, read) = writer
            .process(&FileOp::WriteFromOldFile {
                path: "old.bin".to_string(),
                offset: 7,
                size: 3,
            })
            .unwrap();
        assert_eq!((written, read), (3, 3));
        writer.process(&close("sub/new.bin")).unwrap();

        assert_eq!(fs::read(dir.path().join("sub/new.bin")).unwrap(), b"cde789");
    }

    #[test]
    fn test_second_open_rejected() {
        let dir = TempDir::new().unwrap();
        let mut writer = Writer::new(dir.path(), arena(), false);
        writer.process(&open("a")).unwrap();
        assert!(writer.process(&open("b")).is_err());
        writer.process(&close("a")).unwrap();
        writer.process(&open("b")).unwrap();
    }

    #[test]
    fn test_append_without_open_file_fails() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("old"), b"xyz").unwrap();
        let mut writer = Writer::new(dir.path(), arena(), false);
        assert!(
            writer
                .process(&FileOp::WriteFromOldFile {
                    path: "old".to_string(),
                    offset: 0,
                    size: 1,
                })
                .is_err()
        );
    }

    #[test]
    fn test_delete_rename_create_empty() {
        let dir = TempDir::new().unwrap();
        let mut writer = Writer::new(dir.path(), arena(), false);

        writer
            .process(&FileOp::Delete {
                path: "never-existed".to_string(),
                silent: false,
            })
            .unwrap();

        writer
            .process(&FileOp::CreateEmpty {
                path: "d/empty".to_string(),
            })
            .unwrap();
        assert_eq!(fs::metadata(dir.path().join("d/empty")).unwrap().len(), 0);

        fs::write(dir.path().join("a.tmp"), b"new").unwrap();
        fs::write(dir.path().join("a"), b"old").unwrap();
        writer
            .process(&FileOp::Rename {
                source: "a.tmp".to_string(),
                target: "a".to_string(),
                delete_first: true,
            })
            .unwrap();
        assert_eq!(fs::read(dir.path().join("a")).unwrap(), b"new");
        assert!(!dir.path().join("a.tmp").exists());

        writer
            .process(&FileOp::Delete {
                path: "a".to_string(),
                silent: false,
            })
            .unwrap();
        assert!(!dir.path().join("a").exists());
    }

    #[test]
    fn test_silent_delete_swallows_errors() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("is-a-dir/inner")).unwrap();
        let mut writer = Writer::new(dir.path(), arena(), false);
        assert!(
            writer
                .process(&FileOp::Delete {
                    path: "is-a-dir".to_string(),
                    silent: false,
                })
                .is_err()
        );
        writer
            .process(&FileOp::Delete {
                path: "is-a-dir".to_string(),
                silent: true,
            })
            .unwrap();
    }

    #[test]
    fn test_verify_writes_on_close() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("src"), b"payload").unwrap();
        let mut writer = Writer::new(dir.path(), arena(), true);

        let good = FileOp::Open {
            path: "good".to_string(),
            expected_hash: Some(ShaHash::from_data(b"payload")),
        };
        let bad = FileOp::Open {
            path: "bad".to_string(),
            expected_hash: Some(ShaHash::from_data(b"something else")),
        };
        let copy = FileOp::WriteFromOldFile {
            path: "src".to_string(),
            offset: 0,
            size: 7,
        };

        writer.process(&good).unwrap();
        writer.process(&copy).unwrap();
        writer.process(&close("good")).unwrap();

        writer.process(&bad).unwrap();
        writer.process(&copy).unwrap();
        let err = writer.process(&close("bad")).unwrap_err();
        assert!(err.to_string().contains("hash mismatch"));
    }

    #[test]
    fn test_cache_source_requires_directory() {
        let dir = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        fs::write(cache.path().join("c1"), b"cached bytes").unwrap();
        let op = FileOp::WriteFromCache {
            path: "c1".to_string(),
            offset: 7,
            size: 5,
        };

        let mut writer = Writer::new(dir.path(), arena(), false);
        writer.process(&open("out")).unwrap();
        assert!(matches!(
            writer.process(&op).unwrap_err(),
            InstallError::Config(_)
        ));

        let mut writer = Writer::new(dir.path(), arena(), false).with_cache_dir(cache.path());
        writer.process(&open("out")).unwrap();
        writer.process(&op).unwrap();
        writer.process(&close("out")).unwrap();
        assert_eq!(fs::read(dir.path().join("out")).unwrap(), b"bytes");
    }

    #[cfg(unix)]
    #[test]
    fn test_make_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.sh");
        fs::write(&path, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let mut writer = Writer::new(dir.path(), arena(), false);
        writer
            .process(&FileOp::MakeExecutable {
                path: "run.sh".to_string(),
            })
            .unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_released_slot() {
        let slot = Slot {
            index: 1,
            offset: 16,
            end: 32,
        };
        let op = |release| FileOp::WriteFromSlot {
            guid: ChunkGuid::from_parts([1, 2, 3, 4]),
            slot,
            offset: 0,
            size: 1,
            release,
        };
        assert_eq!(op(true).released_slot(), Some(slot));
        assert_eq!(op(false).released_slot(), None);
        assert_eq!(close("x").released_slot(), None);
    }

    #[tokio::test]
    async fn test_writer_loop_answers_in_order() {
        let dir = TempDir::new().unwrap();
        let writer = Writer::new(dir.path(), arena(), false);
        let (tx, rx) = mpsc::channel(8);
        let (result_tx, mut results) = mpsc::channel(8);
        let handle = tokio::task::spawn_blocking(move || run_writer(writer, rx, result_tx));

        let ops = [open("x"), open("y"), close("x")];
        for op in &ops {
            tx.send(WriterMessage::Op(op.clone())).await.unwrap();
        }
        tx.send(WriterMessage::Terminate).await.unwrap();

        let mut seen = Vec::new();
        while let Some(result) = results.recv().await {
            seen.push(result);
        }
        handle.await.unwrap();

        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].op, ops[0]);
        assert!(seen[0].success());
        assert!(!seen[1].success());
        assert!(seen[2].success());
    }
}
