//! Install progress accounting
//!
//! Coordinator loops bump [`ProgressCounters`]; the ticker turns two
//! consecutive reads into a [`ProgressSnapshot`] with instantaneous rates.

#![allow(clippy::cast_precision_loss)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Running totals shared by the coordinator loops
#[derive(Debug, Default)]
pub struct ProgressCounters {
    processed_chunks: AtomicU64,
    processed_tasks: AtomicU64,
    bytes_downloaded: AtomicU64,
    bytes_decompressed: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
}

/// Point-in-time copy of [`ProgressCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterValues {
    /// Chunks downloaded and decoded
    pub processed_chunks: u64,
    /// Writer tasks completed
    pub processed_tasks: u64,
    /// Compressed bytes received
    pub bytes_downloaded: u64,
    /// Bytes after decoding
    pub bytes_decompressed: u64,
    /// Bytes written to disk
    pub bytes_written: u64,
    /// Bytes read back from old files
    pub bytes_read: u64,
}

impl ProgressCounters {
    /// Count one decoded chunk's sizes
    pub fn add_download(&self, downloaded: u64, decompressed: u64) {
        self.bytes_downloaded.fetch_add(downloaded, Ordering::Relaxed);
        self.bytes_decompressed
            .fetch_add(decompressed, Ordering::Relaxed);
    }

    /// Count bytes written, and bytes read from old files
    pub fn add_write(&self, written: u64, read: u64) {
        self.bytes_written.fetch_add(written, Ordering::Relaxed);
        self.bytes_read.fetch_add(read, Ordering::Relaxed);
    }

    /// Count one finished chunk
    pub fn chunk_processed(&self) {
        self.processed_chunks.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a finished writer task, returning the new total
    pub fn task_processed(&self) -> u64 {
        self.processed_tasks.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Writer tasks finished so far
    pub fn processed_tasks(&self) -> u64 {
        self.processed_tasks.load(Ordering::Acquire)
    }

    /// Snapshot of every counter
    pub fn values(&self) -> CounterValues {
        CounterValues {
            processed_chunks: self.processed_chunks.load(Ordering::Relaxed),
            processed_tasks: self.processed_tasks.load(Ordering::Acquire),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            bytes_decompressed: self.bytes_decompressed.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
        }
    }
}

/// Status report forwarded to the status sink every update interval
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    /// Percentage of chunk tasks written
    pub progress: f64,
    /// Chunk tasks written so far
    pub processed_chunks: u64,
    /// Chunk tasks planned
    pub total_chunks: u64,
    /// Time since the run started
    pub runtime: Duration,
    /// Estimated time left, once a rate is known
    pub eta: Option<Duration>,
    /// Network bytes per second
    pub dl_speed: f64,
    /// Decoded bytes per second
    pub decompress_speed: f64,
    /// Bytes written per second
    pub write_speed: f64,
    /// Bytes read from old files per second
    pub read_speed: f64,
    /// Arena bytes in use
    pub memory_usage: u64,
    /// Arena capacity
    pub memory_total: u64,
    /// Total bytes downloaded
    pub bytes_downloaded: u64,
}

/// Turns successive counter reads into snapshots
#[derive(Debug)]
pub struct RateTracker {
    started: Instant,
    last_tick: Instant,
    last: CounterValues,
    total_chunks: u64,
}

impl RateTracker {
    /// Tracker for a run of `total_chunks` downloads
    pub fn new(total_chunks: u64) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_tick: now,
            last: CounterValues::default(),
            total_chunks,
        }
    }

    /// Compute a snapshot at `now` and remember it for the next tick
    pub fn tick(
        &mut self,
        now: Instant,
        values: CounterValues,
        memory_usage: u64,
        memory_total: u64,
    ) -> ProgressSnapshot {
        let elapsed = now.saturating_duration_since(self.last_tick).as_secs_f64();
        let runtime = now.saturating_duration_since(self.started);
        let rate = |current: u64, previous: u64| {
            if elapsed > 0.0 {
                current.saturating_sub(previous) as f64 / elapsed
            } else {
                0.0
            }
        };

        let processed = values.processed_chunks;
        let progress = if self.total_chunks == 0 {
            100.0
        } else {
            processed as f64 * 100.0 / self.total_chunks as f64
        };

        let avg_chunks_per_sec = processed as f64 / runtime.as_secs_f64().max(f64::EPSILON);
        let eta = (processed > 0 && avg_chunks_per_sec > 0.0).then(|| {
            let remaining = self.total_chunks.saturating_sub(processed);
            Duration::from_secs_f64(remaining as f64 / avg_chunks_per_sec)
        });

        let snapshot = ProgressSnapshot {
            progress,
            processed_chunks: processed,
            total_chunks: self.total_chunks,
            runtime,
            eta,
            dl_speed: rate(values.bytes_downloaded, self.last.bytes_downloaded),
            decompress_speed: rate(values.bytes_decompressed, self.last.bytes_decompressed),
            write_speed: rate(values.bytes_written, self.last.bytes_written),
            read_speed: rate(values.bytes_read, self.last.bytes_read),
            memory_usage,
            memory_total,
            bytes_downloaded: values.bytes_downloaded,
        };

        self.last_tick = now;
        self.last = values;
        snapshot
    }
}

/// `H:MM:SS`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_use_deltas() {
        let counters = ProgressCounters::default();
        let start = Instant::now();
        let mut tracker = RateTracker::new(10);
        tracker.started = start;
        tracker.last_tick = start;

        counters.add_download(2048, 4096);
        counters.add_write(1000, 500);
        for _ in 0..5 {
            counters.chunk_processed();
        }
        let first = tracker.tick(start + Duration::from_secs(2), counters.values(), 10, 100);
        assert!((first.dl_speed - 1024.0).abs() < f64::EPSILON);
        assert!((first.decompress_speed - 2048.0).abs() < f64::EPSILON);
        assert!((first.write_speed - 500.0).abs() < f64::EPSILON);
        assert!((first.read_speed - 250.0).abs() < f64::EPSILON);
        assert!((first.progress - 50.0).abs() < f64::EPSILON);
        assert_eq!(first.eta, Some(Duration::from_secs(2)));
        assert_eq!(first.memory_usage, 10);

        let second = tracker.tick(start + Duration::from_secs(3), counters.values(), 0, 100);
        assert!(second.dl_speed.abs() < f64::EPSILON);
        assert_eq!(second.runtime, Duration::from_secs(3));
    }

    #[test]
    fn test_empty_plan_is_complete() {
        let mut tracker = RateTracker::new(0);
        let snapshot = tracker.tick(Instant::now(), CounterValues::default(), 0, 0);
        assert!((snapshot.progress - 100.0).abs() < f64::EPSILON);
        assert_eq!(snapshot.eta, None);
    }

    #[test]
    fn test_task_counter() {
        let counters = ProgressCounters::default();
        assert_eq!(counters.task_processed(), 1);
        assert_eq!(counters.task_processed(), 2);
        assert_eq!(counters.processed_tasks(), 2);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(3725)), "1:02:05");
    }
}
