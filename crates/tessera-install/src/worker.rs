//! Download workers
//!
//! Each worker pulls [`DownloadTask`]s from a shared queue, fetches the
//! chunk blob through its own [`ChunkSource`], decodes it and copies the
//! payload into the slot named by the task. Decoding, hash checks and the
//! slot copy run on the blocking pool. One [`DownloadResult`] is sent back per task;
//! failures are reported, never raised.

use std::sync::Arc;

use tessera_crypto::ChunkGuid;
use tessera_formats::{Chunk, ChunkError};
use tessera_protocol::ChunkSource;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinError;
use tracing::{debug, trace, warn};

use crate::arena::{SharedArena, Slot};
use crate::error::{InstallError, Result};

/// Fetch one chunk into one slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    /// CDN path relative to the base URL
    pub path: String,
    /// Chunk expected at that path
    pub guid: ChunkGuid,
    /// Destination slot
    pub slot: Slot,
}

/// Message on the download queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadMessage {
    /// Work item
    Task(DownloadTask),
    /// Stop after the current task
    Terminate,
}

/// Outcome of a [`DownloadTask`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResult {
    /// Chunk requested
    pub guid: ChunkGuid,
    /// Slot that was assigned
    pub slot: Slot,
    /// Whether the slot now holds the chunk payload
    pub success: bool,
    /// Bytes received from the network
    pub size_downloaded: u64,
    /// Decoded payload size
    pub size_decompressed: u64,
    /// Failure description
    pub error: Option<String>,
}

/// Queue receiver shared by all workers
pub type SharedReceiver = Arc<Mutex<mpsc::Receiver<DownloadMessage>>>;

/// Settings shared by every worker of a run
#[derive(Clone)]
pub struct WorkerContext {
    /// Destination arena
    pub arena: Arc<SharedArena>,
    /// Check the chunk hashes after decoding
    pub verify_chunks: bool,
}

/// Worker loop; returns when it sees [`DownloadMessage::Terminate`], the
/// queue closes or nobody listens for results any more
pub async fn run_download_worker(
    id: usize,
    source: Arc<dyn ChunkSource>,
    ctx: WorkerContext,
    queue: SharedReceiver,
    results: mpsc::Sender<DownloadResult>,
) {
    debug!("Download worker {id} started");
    loop {
        let message = { queue.lock().await.recv().await };
        let task = match message {
            Some(DownloadMessage::Task(task)) => task,
            Some(DownloadMessage::Terminate) | None => break,
        };

        let result = match download_into_slot(source.as_ref(), &ctx, &task).await {
            Ok((downloaded, decompressed)) => DownloadResult {
                guid: task.guid,
                slot: task.slot,
                success: true,
                size_downloaded: downloaded,
                size_decompressed: decompressed,
                error: None,
            },
            Err(err) => {
                warn!("Worker {id}: chunk {} failed: {err}", task.guid);
                DownloadResult {
                    guid: task.guid,
                    slot: task.slot,
                    success: false,
                    size_downloaded: 0,
                    size_decompressed: 0,
                    error: Some(err.to_string()),
                }
            }
        };

        if results.send(result).await.is_err() {
            break;
        }
    }
    debug!("Download worker {id} stopped");
}

async fn download_into_slot(
    source: &dyn ChunkSource,
    ctx: &WorkerContext,
    task: &DownloadTask,
) -> Result<(u64, u64)> {
    let blob = source.fetch(&task.path).await?;
    trace!("Fetched {} ({} bytes)", task.path, blob.len());

    let ctx = ctx.clone();
    let (guid, slot) = (task.guid, task.slot);
    tokio::task::spawn_blocking(move || store_chunk(&ctx, guid, slot, &blob))
        .await
        .unwrap_or_else(|e| Err(decode_failure(guid, &e)))
}

fn decode_failure(guid: ChunkGuid, err: &JoinError) -> InstallError {
    std::io::Error::other(format!("decoding chunk {guid} failed: {err}")).into()
}

/// Decode, optionally verify and copy one chunk blob into its slot
fn store_chunk(
    ctx: &WorkerContext,
    guid: ChunkGuid,
    slot: Slot,
    blob: &[u8],
) -> Result<(u64, u64)> {
    let chunk = Chunk::parse(blob)?;
    if ctx.verify_chunks {
        chunk.verify()?;
        if chunk.guid() != guid {
            return Err(ChunkError::HashMismatch {
                kind: "chunk id",
                expected: guid.to_hex(),
                actual: chunk.guid().to_hex(),
            }
            .into());
        }
    }

    let payload = chunk.data();
    ctx.arena.write(slot, payload)?;
    Ok((blob.len() as u64, payload.len() as u64))
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::test_utils::{chunk_blob, chunk_payload, guid};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashMap;
    use tessera_formats::CHUNK_WINDOW_SIZE;
    use tessera_protocol::ProtocolError;

    struct MemorySource(HashMap<String, Vec<u8>>);

    #[async_trait]
    impl ChunkSource for MemorySource {
        async fn fetch(&self, path: &str) -> tessera_protocol::Result<Bytes> {
            self.0
                .get(path)
                .map(|blob| Bytes::from(blob.clone()))
                .ok_or_else(|| {
                    ProtocolError::Network(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("404 {path}"),
                    ))
                })
        }
    }

    struct Harness {
        arena: Arc<SharedArena>,
        tx: mpsc::Sender<DownloadMessage>,
        results: mpsc::Receiver<DownloadResult>,
        handle: tokio::task::JoinHandle<()>,
    }

    fn start(blobs: HashMap<String, Vec<u8>>, verify_chunks: bool) -> Harness {
        let arena =
            Arc::new(SharedArena::new(4 * CHUNK_WINDOW_SIZE as u64, CHUNK_WINDOW_SIZE).unwrap());
        let (tx, rx) = mpsc::channel(8);
        let (result_tx, results) = mpsc::channel(8);
        let ctx = WorkerContext {
            arena: Arc::clone(&arena),
            verify_chunks,
        };
        let handle = tokio::spawn(run_download_worker(
            0,
            Arc::new(MemorySource(blobs)),
            ctx,
            Arc::new(Mutex::new(rx)),
            result_tx,
        ));
        Harness {
            arena,
            tx,
            results,
            handle,
        }
    }

    #[tokio::test]
    async fn test_downloads_into_slot() {
        let blob = chunk_blob(1, true);
        let blob_len = blob.len() as u64;
        let mut h = start(HashMap::from([("c/1".to_string(), blob)]), true);

        let slot = h.arena.acquire().unwrap();
        h.tx.send(DownloadMessage::Task(DownloadTask {
            path: "c/1".to_string(),
            guid: guid(1),
            slot,
        }))
        .await
        .unwrap();

        let result = h.results.recv().await.unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.size_downloaded, blob_len);
        assert_eq!(result.size_decompressed, CHUNK_WINDOW_SIZE as u64);

        let stored = h
            .arena
            .with_slice(slot, 0, CHUNK_WINDOW_SIZE, <[u8]>::to_vec)
            .unwrap();
        assert_eq!(stored, chunk_payload(1));

        h.tx.send(DownloadMessage::Terminate).await.unwrap();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_chunk_reports_failure() {
        let mut h = start(HashMap::new(), true);
        let slot = h.arena.acquire().unwrap();
        h.tx.send(DownloadMessage::Task(DownloadTask {
            path: "c/404".to_string(),
            guid: guid(4),
            slot,
        }))
        .await
        .unwrap();

        let result = h.results.recv().await.unwrap();
        assert!(!result.success);
        assert_eq!(result.slot, slot);
        assert!(result.error.unwrap().contains("404"));
    }

    #[tokio::test]
    async fn test_wrong_chunk_rejected_when_verifying() {
        let blobs = HashMap::from([("c/2".to_string(), chunk_blob(3, false))]);
        let mut h = start(blobs, true);
        let slot = h.arena.acquire().unwrap();
        h.tx.send(DownloadMessage::Task(DownloadTask {
            path: "c/2".to_string(),
            guid: guid(2),
            slot,
        }))
        .await
        .unwrap();

        let result = h.results.recv().await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("chunk id"));
    }

    #[tokio::test]
    async fn test_corrupt_blob_rejected() {
        let mut blob = chunk_blob(5, false);
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;
        let mut h = start(HashMap::from([("c/5".to_string(), blob)]), true);
        let slot = h.arena.acquire().unwrap();
        h.tx.send(DownloadMessage::Task(DownloadTask {
            path: "c/5".to_string(),
            guid: guid(5),
            slot,
        }))
        .await
        .unwrap();

        assert!(!h.results.recv().await.unwrap().success);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_decodes_on_single_threaded_runtime() {
        let blob = chunk_blob(6, true);
        let mut h = start(HashMap::from([("c/6".to_string(), blob)]), true);
        let slot = h.arena.acquire().unwrap();
        h.tx.send(DownloadMessage::Task(DownloadTask {
            path: "c/6".to_string(),
            guid: guid(6),
            slot,
        }))
        .await
        .unwrap();

        let result = h.results.recv().await.unwrap();
        assert!(result.success, "{:?}", result.error);
        let stored = h
            .arena
            .with_slice(slot, 0, CHUNK_WINDOW_SIZE, <[u8]>::to_vec)
            .unwrap();
        assert_eq!(stored, chunk_payload(6));
    }

    #[test]
    fn test_store_chunk_checks_guid() {
        let arena =
            Arc::new(SharedArena::new(2 * CHUNK_WINDOW_SIZE as u64, CHUNK_WINDOW_SIZE).unwrap());
        let ctx = WorkerContext {
            arena: Arc::clone(&arena),
            verify_chunks: true,
        };
        let slot = arena.acquire().unwrap();
        let blob = chunk_blob(7, false);

        assert!(store_chunk(&ctx, guid(8), slot, &blob).is_err());
        let (downloaded, decoded) = store_chunk(&ctx, guid(7), slot, &blob).unwrap();
        assert_eq!(downloaded, blob.len() as u64);
        assert_eq!(decoded, CHUNK_WINDOW_SIZE as u64);
    }

    #[tokio::test]
    async fn test_dead_decode_task_becomes_failure() {
        let err = tokio::task::spawn_blocking::<_, u8>(|| panic!("inflate"))
            .await
            .unwrap_err();
        let failure = decode_failure(guid(9), &err);
        assert!(matches!(failure, InstallError::Io(_)));
        assert!(failure.to_string().contains(&guid(9).to_string()));
    }

    #[tokio::test]
    async fn test_worker_stops_when_queue_closes() {
        let h = start(HashMap::new(), false);
        drop(h.tx);
        h.handle.await.unwrap();
    }
}
