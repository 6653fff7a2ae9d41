//! Download orchestration
//!
//! [`DownloadManager::run`] executes an [`InstallPlan`] with:
//!
//! - a pool of download workers sharing one task queue
//! - a submitter that hands out arena slots in first-use order
//! - a dispatcher that walks the task list, waits for each chunk it needs
//!   and forwards writer operations strictly in plan order
//! - a single blocking writer thread
//! - a collector that releases slots, appends the resume log and counts
//!   finished tasks
//!
//! The calling task ticks progress every update interval until the
//! collector has seen one result per planned task, then shuts everything
//! down with bounded joins.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tessera_crypto::{ChunkGuid, ShaHash};
use tessera_formats::{CHUNK_WINDOW_SIZE, Manifest};
use tessera_protocol::{CdnClient, ChunkSource, HttpConfig};
use tokio::sync::{Notify, mpsc};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::analysis::InstallPlan;
use crate::arena::{SharedArena, Slot};
use crate::config::InstallerConfig;
use crate::error::{InstallError, Result};
use crate::progress::{ProgressCounters, ProgressSnapshot, RateTracker, format_duration};
use crate::resume::ResumeLog;
use crate::tasks::{FileTask, TMP_SUFFIX, Task, final_path};
use crate::worker::{
    DownloadMessage, DownloadResult, DownloadTask, WorkerContext, run_download_worker,
};
use crate::writer::{FileOp, Writer, WriterMessage, WriterResult, run_writer};

const POLL: Duration = Duration::from_secs(1);
const WRITER_QUEUE: usize = 1024;

/// Receives a [`ProgressSnapshot`] every update interval
pub type StatusSender = mpsc::UnboundedSender<ProgressSnapshot>;

/// Cloneable handle that stops a running install
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Handle that is not cancelled yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every loop to stop; the resume log is kept
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether [`cancel`](Self::cancel) was called
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Totals of a finished run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Writer tasks completed
    pub processed_tasks: u64,
    /// Chunks downloaded and decoded
    pub processed_chunks: u64,
    /// Bytes received from the network
    pub bytes_downloaded: u64,
    /// Bytes written to disk
    pub bytes_written: u64,
    /// Bytes copied from old files
    pub bytes_read: u64,
    /// Wall time of the run
    pub runtime: Duration,
}

/// Executes install plans
pub struct DownloadManager {
    config: InstallerConfig,
    install_path: PathBuf,
    resume_file: Option<PathBuf>,
    cancel: CancelHandle,
    status: Option<StatusSender>,
    source: Option<Arc<dyn ChunkSource>>,
}

struct RunState {
    arena: Arc<SharedArena>,
    counters: ProgressCounters,
    cancel: CancelHandle,
    stop: AtomicBool,
    slot_free: Notify,
    task_done: Notify,
    chunks_to_dl: Mutex<VecDeque<ChunkGuid>>,
    in_flight: AtomicUsize,
    forwarded: AtomicU64,
    dispatch_done: AtomicBool,
    failures: Mutex<Vec<String>>,
}

impl RunState {
    fn running(&self) -> bool {
        !self.stop.load(Ordering::Acquire) && !self.cancel.is_cancelled()
    }

    fn halt(&self) {
        self.stop.store(true, Ordering::Release);
        self.slot_free.notify_one();
        self.task_done.notify_one();
    }

    fn record_failure(&self, message: String) {
        self.failures.lock().push(message);
    }
}

impl DownloadManager {
    /// Manager writing into `install_path`
    pub fn new(config: InstallerConfig, install_path: impl Into<PathBuf>) -> Self {
        Self {
            config,
            install_path: install_path.into(),
            resume_file: None,
            cancel: CancelHandle::new(),
            status: None,
            source: None,
        }
    }

    /// Append completed files to this log and delete it on success
    #[must_use]
    pub fn with_resume_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.resume_file = Some(path.into());
        self
    }

    /// Forward progress snapshots to `sink`
    #[must_use]
    pub fn with_status_sink(mut self, sink: StatusSender) -> Self {
        self.status = Some(sink);
        self
    }

    /// Fetch chunks from `source` instead of one HTTP client per worker
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn ChunkSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Use an externally owned cancellation handle
    #[must_use]
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle that cancels this run
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    fn sources(&self, base_url: &str, workers: usize) -> Result<Vec<Arc<dyn ChunkSource>>> {
        if let Some(source) = &self.source {
            return Ok(vec![Arc::clone(source); workers]);
        }
        let http = HttpConfig::for_workers(workers, self.config.dl_timeout);
        (0..workers)
            .map(|_| {
                let client = CdnClient::new(base_url, &http, self.config.retry.clone())?;
                Ok(Arc::new(client) as Arc<dyn ChunkSource>)
            })
            .collect()
    }

    /// Execute `plan`, built from `manifest`, fetching chunks from `base_url`
    pub async fn run(
        &self,
        manifest: &Manifest,
        plan: InstallPlan,
        base_url: &str,
    ) -> Result<RunSummary> {
        let started = Instant::now();
        let total_tasks = plan.tasks.len() as u64;
        let total_chunk_tasks = plan.chunk_task_count() as u64;
        let workers = self.config.max_workers.max(1);

        let slot_size = match usize::try_from(plan.result.biggest_chunk) {
            Ok(0) | Err(_) => CHUNK_WINDOW_SIZE,
            Ok(size) => size,
        };
        let arena = Arc::new(SharedArena::new(self.config.max_shared_memory, slot_size)?);
        debug!(
            "Arena of {} slots of {} bytes for {} planned tasks",
            arena.slot_count(),
            slot_size,
            total_tasks
        );

        let chunk_paths: HashMap<ChunkGuid, String> = plan
            .chunks_to_dl
            .iter()
            .filter_map(|guid| manifest.chunk(guid).map(|c| (*guid, manifest.chunk_path(c))))
            .collect();
        let file_hashes: Arc<HashMap<String, ShaHash>> = Arc::new(
            manifest
                .file_manifest_list
                .elements()
                .iter()
                .map(|f| (f.filename.clone(), f.sha_hash))
                .collect(),
        );

        let resume = match &self.resume_file {
            Some(path) => Some(ResumeLog::open(path)?),
            None => None,
        };

        let state = Arc::new(RunState {
            arena: Arc::clone(&arena),
            counters: ProgressCounters::default(),
            cancel: self.cancel.clone(),
            stop: AtomicBool::new(false),
            slot_free: Notify::new(),
            task_done: Notify::new(),
            chunks_to_dl: Mutex::new(plan.chunks_to_dl),
            in_flight: AtomicUsize::new(0),
            forwarded: AtomicU64::new(0),
            dispatch_done: AtomicBool::new(false),
            failures: Mutex::new(Vec::new()),
        });

        let (dl_tx, dl_rx) = mpsc::channel::<DownloadMessage>(workers * 2);
        let (dl_result_tx, dl_result_rx) = mpsc::channel::<DownloadResult>(workers * 4);
        let (writer_tx, writer_rx) = mpsc::channel::<WriterMessage>(WRITER_QUEUE);
        let (writer_result_tx, writer_result_rx) = mpsc::channel::<WriterResult>(WRITER_QUEUE);

        let shared_rx = Arc::new(tokio::sync::Mutex::new(dl_rx));
        let ctx = WorkerContext {
            arena: Arc::clone(&arena),
            verify_chunks: self.config.verify_chunks,
        };
        let mut worker_handles: Vec<JoinHandle<()>> = self
            .sources(base_url, workers)?
            .into_iter()
            .enumerate()
            .map(|(id, source)| {
                tokio::spawn(run_download_worker(
                    id,
                    source,
                    ctx.clone(),
                    Arc::clone(&shared_rx),
                    dl_result_tx.clone(),
                ))
            })
            .collect();
        drop(dl_result_tx);

        let writer = Writer::new(
            &self.install_path,
            Arc::clone(&arena),
            self.config.verify_writes,
        );
        let mut writer_handle =
            tokio::task::spawn_blocking(move || run_writer(writer, writer_rx, writer_result_tx));

        let mut submitter = tokio::spawn(submit_loop(
            Arc::clone(&state),
            chunk_paths,
            dl_tx.clone(),
            workers * 2,
        ));
        let mut dispatcher = tokio::spawn(dispatch_loop(
            Arc::clone(&state),
            plan.tasks,
            dl_result_rx,
            writer_tx.clone(),
            Arc::clone(&file_hashes),
            self.config.max_requeues,
        ));
        let mut collector = tokio::spawn(collect_loop(
            Arc::clone(&state),
            writer_result_rx,
            total_tasks,
            file_hashes,
            resume,
        ));

        let mut tracker = RateTracker::new(total_chunk_tasks);
        let mut ticker =
            tokio::time::interval(self.config.update_interval.max(Duration::from_millis(10)));
        let mut dispatch_outcome: Option<Result<()>> = None;
        let collect_outcome = loop {
            tokio::select! {
                outcome = &mut collector => break flatten(outcome),
                outcome = &mut dispatcher, if dispatch_outcome.is_none() => {
                    let outcome = flatten(outcome);
                    if outcome.is_err() {
                        state.halt();
                    }
                    dispatch_outcome = Some(outcome);
                }
                _ = ticker.tick() => self.report(&state, &mut tracker),
            }
        };

        state.halt();
        self.report(&state, &mut tracker);

        if dispatch_outcome.is_none() {
            dispatch_outcome =
                join_bounded("dispatcher", &mut dispatcher, self.config.join_timeout).await;
        }
        join_bounded("submitter", &mut submitter, self.config.join_timeout).await;

        for _ in 0..worker_handles.len() {
            if timeout(self.config.join_timeout, dl_tx.send(DownloadMessage::Terminate))
                .await
                .is_err()
            {
                break;
            }
        }
        drop(dl_tx);
        for (id, handle) in worker_handles.iter_mut().enumerate() {
            join_bounded(&format!("download worker {id}"), handle, self.config.join_timeout).await;
        }

        let _ = timeout(self.config.join_timeout, writer_tx.send(WriterMessage::Terminate)).await;
        drop(writer_tx);
        if timeout(self.config.join_timeout, &mut writer_handle).await.is_err() {
            warn!("Writer did not stop within {:?}, detaching it", self.config.join_timeout);
        }

        let values = state.counters.values();
        let summary = RunSummary {
            processed_tasks: values.processed_tasks,
            processed_chunks: values.processed_chunks,
            bytes_downloaded: values.bytes_downloaded,
            bytes_written: values.bytes_written,
            bytes_read: values.bytes_read,
            runtime: started.elapsed(),
        };

        if self.cancel.is_cancelled() {
            warn!("Install cancelled after {} of {total_tasks} tasks", summary.processed_tasks);
            return Err(InstallError::Cancelled);
        }

        let failures = std::mem::take(&mut *state.failures.lock());
        if let Some(first) = failures.first() {
            error!("{} task(s) failed, first: {first}", failures.len());
            return Err(InstallError::Incomplete {
                failed: failures.len(),
                first_error: first.clone(),
            });
        }
        collect_outcome?;
        if let Some(outcome) = dispatch_outcome {
            outcome?;
        }
        if summary.processed_tasks < total_tasks {
            return Err(InstallError::Incomplete {
                failed: (total_tasks - summary.processed_tasks) as usize,
                first_error: "run stopped before all tasks finished".to_string(),
            });
        }

        if let Some(path) = &self.resume_file {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not remove resume log {}: {e}", path.display()),
            }
        }

        info!(
            "Finished {} tasks in {}, downloaded {:.02} MiB",
            summary.processed_tasks,
            format_duration(summary.runtime),
            mib(summary.bytes_downloaded)
        );
        Ok(summary)
    }

    fn report(&self, state: &RunState, tracker: &mut RateTracker) {
        let snapshot = tracker.tick(
            Instant::now(),
            state.counters.values(),
            state.arena.used_bytes(),
            state.arena.capacity(),
        );
        info!(
            "= Progress: {:.02}% ({}/{}), running for {}, ETA: {}",
            snapshot.progress,
            snapshot.processed_chunks,
            snapshot.total_chunks,
            format_duration(snapshot.runtime),
            snapshot.eta.map_or_else(|| "--:--:--".to_string(), format_duration)
        );
        info!(
            " + Download: {:.02} MiB/s (raw) / {:.02} MiB/s (decompressed)",
            mib_f(snapshot.dl_speed),
            mib_f(snapshot.decompress_speed)
        );
        info!(
            " + Disk: {:.02} MiB/s (write) / {:.02} MiB/s (read)",
            mib_f(snapshot.write_speed),
            mib_f(snapshot.read_speed)
        );
        info!(
            " - Arena: {:.02} MiB / {:.02} MiB",
            mib(snapshot.memory_usage),
            mib(snapshot.memory_total)
        );
        if let Some(sink) = &self.status {
            let _ = sink.send(snapshot);
        }
    }
}

async fn pause(notify: &Notify) {
    let _ = timeout(POLL, notify.notified()).await;
}

async fn submit_loop(
    state: Arc<RunState>,
    paths: HashMap<ChunkGuid, String>,
    queue: mpsc::Sender<DownloadMessage>,
    max_in_flight: usize,
) {
    while state.running() {
        if state.chunks_to_dl.lock().is_empty()
            || state.in_flight.load(Ordering::Acquire) >= max_in_flight
        {
            pause(&state.task_done).await;
            continue;
        }
        let Some(slot) = state.arena.acquire() else {
            pause(&state.slot_free).await;
            continue;
        };
        let next = state.chunks_to_dl.lock().pop_front();
        let Some(guid) = next else {
            state.arena.release(slot);
            continue;
        };
        let Some(path) = paths.get(&guid) else {
            state.arena.release(slot);
            state.record_failure(format!("chunk {guid} is not listed in the manifest"));
            state.halt();
            break;
        };

        state.in_flight.fetch_add(1, Ordering::AcqRel);
        let task = DownloadTask {
            path: path.clone(),
            guid,
            slot,
        };
        if queue.send(DownloadMessage::Task(task)).await.is_err() {
            break;
        }
    }
    debug!("Submitter stopped");
}

async fn dispatch_loop(
    state: Arc<RunState>,
    tasks: VecDeque<Task>,
    results: mpsc::Receiver<DownloadResult>,
    writer: mpsc::Sender<WriterMessage>,
    file_hashes: Arc<HashMap<String, ShaHash>>,
    max_requeues: u32,
) -> Result<()> {
    let outcome = dispatch_tasks(&state, tasks, results, writer, &file_hashes, max_requeues).await;
    state.dispatch_done.store(true, Ordering::Release);
    outcome
}

async fn dispatch_tasks(
    state: &RunState,
    mut tasks: VecDeque<Task>,
    mut results: mpsc::Receiver<DownloadResult>,
    writer: mpsc::Sender<WriterMessage>,
    file_hashes: &HashMap<String, ShaHash>,
    max_requeues: u32,
) -> Result<()> {
    let mut in_buffer: HashMap<ChunkGuid, Slot> = HashMap::new();
    let mut requeues: HashMap<ChunkGuid, u32> = HashMap::new();

    while let Some(task) = tasks.pop_front() {
        let op = match task {
            Task::File(file) => file_op(file, file_hashes),
            Task::Chunk(chunk) => match chunk.old_file {
                Some(old) => FileOp::WriteFromOldFile {
                    path: old.path,
                    offset: old.offset,
                    size: chunk.size,
                },
                None => {
                    let slot = loop {
                        if let Some(slot) = in_buffer.get(&chunk.guid) {
                            break *slot;
                        }
                        if !state.running() {
                            return Ok(());
                        }
                        match timeout(POLL, results.recv()).await {
                            Err(_) => {}
                            Ok(None) => {
                                return Err(io::Error::other("download workers exited").into());
                            }
                            Ok(Some(result)) => {
                                handle_download(
                                    state,
                                    result,
                                    &mut in_buffer,
                                    &mut requeues,
                                    max_requeues,
                                );
                            }
                        }
                    };
                    if chunk.cleanup {
                        in_buffer.remove(&chunk.guid);
                    }
                    FileOp::WriteFromSlot {
                        guid: chunk.guid,
                        slot,
                        offset: chunk.chunk_offset,
                        size: chunk.size,
                        release: chunk.cleanup,
                    }
                }
            },
        };

        if writer.send(WriterMessage::Op(op)).await.is_err() {
            return Err(io::Error::other("writer exited").into());
        }
        state.forwarded.fetch_add(1, Ordering::AcqRel);
    }
    debug!("All tasks handed to the writer");
    Ok(())
}

fn handle_download(
    state: &RunState,
    result: DownloadResult,
    in_buffer: &mut HashMap<ChunkGuid, Slot>,
    requeues: &mut HashMap<ChunkGuid, u32>,
    max_requeues: u32,
) {
    state.in_flight.fetch_sub(1, Ordering::AcqRel);
    state.task_done.notify_one();

    if result.success {
        state
            .counters
            .add_download(result.size_downloaded, result.size_decompressed);
        in_buffer.insert(result.guid, result.slot);
        return;
    }

    state.arena.release(result.slot);
    state.slot_free.notify_one();

    let count = requeues.entry(result.guid).or_default();
    *count += 1;
    let reason = result.error.unwrap_or_default();
    if *count > max_requeues {
        error!("Chunk {} failed {count} times, giving up: {reason}", result.guid);
        state.record_failure(format!("chunk {}: {reason}", result.guid));
        state.halt();
        return;
    }
    warn!("Re-queueing chunk {} ({count}/{max_requeues}): {reason}", result.guid);
    state.chunks_to_dl.lock().push_front(result.guid);
    state.task_done.notify_one();
}

fn file_op(task: FileTask, file_hashes: &HashMap<String, ShaHash>) -> FileOp {
    match task {
        FileTask::Open { path } => {
            let expected_hash = file_hashes.get(final_path(&path)).copied();
            FileOp::Open {
                path,
                expected_hash,
            }
        }
        FileTask::Close { path } => FileOp::Close { path },
        FileTask::CreateEmpty { path } => FileOp::CreateEmpty { path },
        FileTask::Delete { path, silent } => FileOp::Delete { path, silent },
        FileTask::Rename {
            source,
            target,
            delete_first,
        } => FileOp::Rename {
            source,
            target,
            delete_first,
        },
        FileTask::MakeExecutable { path } => FileOp::MakeExecutable { path },
    }
}

async fn collect_loop(
    state: Arc<RunState>,
    mut results: mpsc::Receiver<WriterResult>,
    total_tasks: u64,
    file_hashes: Arc<HashMap<String, ShaHash>>,
    mut resume: Option<ResumeLog>,
) -> Result<()> {
    let mut file_failed = false;
    while state.counters.processed_tasks() < total_tasks {
        // Once stopped, drain what the dispatcher already handed over
        let stopping = !state.running();
        if stopping
            && state.dispatch_done.load(Ordering::Acquire)
            && state.counters.processed_tasks() >= state.forwarded.load(Ordering::Acquire)
        {
            break;
        }
        let result = match timeout(POLL, results.recv()).await {
            Err(_) if stopping => break,
            Err(_) => continue,
            Ok(None) => return Err(io::Error::other("writer exited").into()),
            Ok(Some(result)) => result,
        };

        state.counters.add_write(result.bytes_written, result.bytes_read);
        if let Some(slot) = result.op.released_slot() {
            state.arena.release(slot);
            state.slot_free.notify_one();
        }

        let completed = match (&result.op, &result.error) {
            (op, Some(err)) => {
                file_failed = true;
                state.record_failure(format!("{}: {err}", describe(op)));
                None
            }
            (FileOp::Open { .. }, None) => {
                file_failed = false;
                None
            }
            (
                FileOp::WriteFromSlot { .. }
                | FileOp::WriteFromOldFile { .. }
                | FileOp::WriteFromCache { .. },
                None,
            ) => {
                state.counters.chunk_processed();
                None
            }
            (FileOp::Close { path }, None) if !file_failed && !path.ends_with(TMP_SUFFIX) => {
                Some(path.as_str())
            }
            (FileOp::Rename { target, .. }, None) if !file_failed => Some(target.as_str()),
            (FileOp::CreateEmpty { path }, None) => Some(path.as_str()),
            _ => None,
        };

        if let (Some(path), Some(log)) = (completed, resume.as_mut())
            && let Some(sha) = file_hashes.get(path)
            && let Err(e) = log.append(sha, path)
        {
            warn!("Could not update resume log {}: {e}", log.path().display());
        }

        state.counters.task_processed();
    }
    Ok(())
}

fn describe(op: &FileOp) -> String {
    match op {
        FileOp::Open { path, .. }
        | FileOp::Close { path }
        | FileOp::Delete { path, .. }
        | FileOp::CreateEmpty { path }
        | FileOp::MakeExecutable { path }
        | FileOp::WriteFromOldFile { path, .. }
        | FileOp::WriteFromCache { path, .. } => path.clone(),
        FileOp::Rename { source, target, .. } => format!("{source} -> {target}"),
        FileOp::WriteFromSlot { guid, .. } => format!("chunk {guid}"),
    }
}

fn flatten(outcome: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    outcome.map_err(|e| InstallError::Io(io::Error::other(e)))?
}

async fn join_bounded<T>(name: &str, handle: &mut JoinHandle<T>, limit: Duration) -> Option<T> {
    match timeout(limit, &mut *handle).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!("{name} ended abnormally: {e}");
            None
        }
        Err(_) => {
            warn!("{name} did not stop within {limit:?}, aborting it");
            handle.abort();
            None
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn mib(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0
}

fn mib_f(bytes_per_sec: f64) -> f64 {
    bytes_per_sec / 1024.0 / 1024.0
}
