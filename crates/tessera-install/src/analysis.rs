//! Install planning
//!
//! Turns a target manifest (and optionally the manifest of what is already
//! on disk) into an [`InstallPlan`]: the chunks to download, in first-use
//! order, and the ordered list of file and chunk tasks that assemble the
//! build.
//!
//! ## Steps
//!
//! 1. Compare the manifests file by file
//! 2. Drop files a resume log (or repair file) records as complete, or, with
//!    no log, add files that are missing on disk
//! 3. Apply install-tag and path prefix filters
//! 4. Find chunk parts of changed files that can be copied from the old file
//! 5. Optionally reorder files so those sharing many chunks are adjacent
//! 6. Simulate the chunk cache to decide when each chunk's slot is released
//!    and how much memory the plan needs
//!
//! Planning has no side effects; a failure here leaves the disk untouched.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;

use serde::Serialize;
use tessera_crypto::ChunkGuid;
use tessera_formats::{FileManifest, Manifest, ManifestComparison};
use tracing::{debug, info, warn};

use crate::config::DEFAULT_SHARED_MEMORY;
use crate::error::{InstallError, Result};
use crate::resume;
use crate::tasks::{ChunkTask, FileTask, OldFileSource, TMP_SUFFIX, Task};

/// Extra arena bytes on top of the simulated peak
pub const MIN_MEMORY_PADDING: u64 = 32 * 1024 * 1024;

/// Above this many files the reorder pass is skipped
pub const REORDER_MAX_FILES: usize = 8000;

/// Files using fewer distinct chunks are never paired by the reorder pass
pub const REORDER_CHUNK_THRESHOLD: usize = 5;

/// Default number of shared chunks a pair must exceed
pub const DEFAULT_MIN_OVERLAP: usize = 4;

/// Planner inputs besides the manifests
#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    /// Install root
    pub install_path: PathBuf,
    /// Resume log (or repair file) to consult
    pub resume_file: Option<PathBuf>,
    /// Copy unchanged chunk parts out of old files
    pub patch: bool,
    /// Skip files already completed or present
    pub resume: bool,
    /// Only install files starting with one of these (case-insensitive)
    pub include_prefixes: Vec<String>,
    /// Never install files starting with one of these (case-insensitive)
    pub exclude_prefixes: Vec<String>,
    /// Install-tag allow-list; `None` installs everything
    pub install_tags: Option<Vec<String>>,
    /// Group files that share chunks
    pub processing_optimization: bool,
    /// Shared-chunk count a pair must exceed to be grouped
    pub min_overlap: usize,
    /// Arena size available to the plan
    pub max_shared_memory: u64,
}

impl AnalysisOptions {
    /// Defaults for an install into `install_path`
    pub fn new(install_path: impl Into<PathBuf>) -> Self {
        Self {
            install_path: install_path.into(),
            resume_file: None,
            patch: true,
            resume: true,
            include_prefixes: Vec::new(),
            exclude_prefixes: Vec::new(),
            install_tags: None,
            processing_optimization: false,
            min_overlap: DEFAULT_MIN_OVERLAP,
            max_shared_memory: DEFAULT_SHARED_MEMORY,
        }
    }
}

/// Aggregate figures of a plan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AnalysisResult {
    /// Bytes of all files that will be written
    pub install_size: u64,
    /// Compressed bytes to download
    pub dl_size: u64,
    /// Uncompressed bytes to download
    pub uncompressed_dl_size: u64,
    /// Bytes copied from old files
    pub reuse_size: u64,
    /// Largest chunk window
    pub biggest_chunk: u64,
    /// Largest file of the target build
    pub biggest_file_size: u64,
    /// Arena bytes the plan needs
    pub min_memory: u64,
    /// Chunks to download
    pub num_chunks: usize,
    /// Chunks that stay cached across several consumers
    pub num_chunks_cache: usize,
    /// Chunk parts copied from old files
    pub num_chunks_reused: usize,
    /// Files to write
    pub num_files: usize,
    /// Files new in this build
    pub added: usize,
    /// Files to delete
    pub removed: usize,
    /// Files whose content changed
    pub changed: usize,
    /// Files left alone
    pub unchanged: usize,
}

/// Everything the orchestrator needs to run an install
#[derive(Debug, Clone)]
pub struct InstallPlan {
    /// Aggregate figures
    pub result: AnalysisResult,
    /// File sets after filtering and resume
    pub comparison: ManifestComparison,
    /// Chunks to download, deduplicated, in first-use order
    pub chunks_to_dl: VecDeque<ChunkGuid>,
    /// Ordered work list
    pub tasks: VecDeque<Task>,
}

impl InstallPlan {
    /// Number of chunk tasks
    pub fn chunk_task_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| matches!(t, Task::Chunk(_)))
            .count()
    }
}

/// Whether a file with `file_tags` is selected by the allow-list
///
/// Untagged files always match.
pub fn tag_allowed(file_tags: &[String], allow: &[String]) -> bool {
    file_tags.is_empty() || file_tags.iter().any(|tag| allow.iter().any(|a| a == tag))
}

/// Plan an install of `manifest` over an optional `old` build
pub fn analyse(
    manifest: &Manifest,
    old: Option<&Manifest>,
    options: &AnalysisOptions,
) -> Result<InstallPlan> {
    manifest.validate()?;

    let mut mc = ManifestComparison::create(manifest, old);
    let files = manifest.file_manifest_list.elements();

    let mut result = AnalysisResult {
        biggest_chunk: manifest.biggest_chunk(),
        biggest_file_size: files.iter().map(FileManifest::file_size).max().unwrap_or(0),
        ..AnalysisResult::default()
    };

    apply_resume(manifest, &mut mc, options)?;

    // Filters
    let mut tag_skipped: Vec<&str> = Vec::new();
    let mut files_to_skip: HashSet<String> = HashSet::new();
    if let Some(tags) = &options.install_tags {
        for file in files {
            if !tag_allowed(&file.install_tags, tags) {
                tag_skipped.push(&file.filename);
                files_to_skip.insert(file.filename.clone());
            }
        }
        info!("Found {} files to skip based on install tags", tag_skipped.len());
    }
    if !options.exclude_prefixes.is_empty() {
        let prefixes = lowercase_all(&options.exclude_prefixes);
        for file in files {
            let name = file.filename.to_lowercase();
            if prefixes.iter().any(|p| name.starts_with(p)) {
                files_to_skip.insert(file.filename.clone());
            }
        }
    }
    if !options.include_prefixes.is_empty() {
        let prefixes = lowercase_all(&options.include_prefixes);
        for file in files {
            let name = file.filename.to_lowercase();
            if !prefixes.iter().any(|p| name.starts_with(p)) {
                files_to_skip.insert(file.filename.clone());
            }
        }
    }
    if !files_to_skip.is_empty() {
        debug!("Skipping {} files due to filters", files_to_skip.len());
        mc.added.retain(|f| !files_to_skip.contains(f));
        mc.changed.retain(|f| !files_to_skip.contains(f));
        mc.unchanged.extend(files_to_skip.iter().cloned());
    }

    let to_process =
        |name: &str| -> bool { mc.added.contains(name) || mc.changed.contains(name) };

    result.install_size = files
        .iter()
        .filter(|f| to_process(&f.filename))
        .map(FileManifest::file_size)
        .sum();

    // Reference counts over every part that still has to be written
    let mut references: HashMap<ChunkGuid, u64> = HashMap::new();
    for file in files.iter().filter(|f| to_process(&f.filename)) {
        for part in &file.chunk_parts {
            *references.entry(part.guid).or_default() += 1;
        }
    }

    // Parts of changed files that can be copied out of the old file
    let mut reusable: HashMap<&str, HashMap<(ChunkGuid, u32, u32), u64>> = HashMap::new();
    if options.patch
        && let Some(old) = old
    {
        for name in &mc.changed {
            let (Some(old_file), Some(new_file)) = (old.file(name), manifest.file(name)) else {
                continue;
            };

            let mut existing: HashMap<(ChunkGuid, u32, u32), u64> = HashMap::new();
            let mut offset = 0u64;
            for part in &old_file.chunk_parts {
                existing
                    .entry((part.guid, part.offset, part.size))
                    .or_insert(offset);
                offset += u64::from(part.size);
            }

            let mut found = HashMap::new();
            for part in &new_file.chunk_parts {
                let key = (part.guid, part.offset, part.size);
                if let Some(&file_offset) = existing.get(&key) {
                    if let Some(count) = references.get_mut(&part.guid) {
                        *count = count.saturating_sub(1);
                    }
                    found.insert(key, file_offset);
                    result.reuse_size += u64::from(part.size);
                }
            }
            if !found.is_empty() {
                reusable.insert(new_file.filename.as_str(), found);
            }
        }
    }

    let mut order: Vec<&FileManifest> = files.iter().filter(|f| to_process(&f.filename)).collect();
    if options.processing_optimization {
        if files.len() <= REORDER_MAX_FILES {
            order = reorder_by_overlap(order, options.min_overlap);
        } else {
            warn!(
                "Processing order optimisation disabled: {} files exceed the limit of {REORDER_MAX_FILES}",
                files.len()
            );
        }
    }

    // Cache simulation and task emission
    let biggest = result.biggest_chunk;
    let mut tasks: VecDeque<Task> = VecDeque::new();
    let mut chunks_to_dl: VecDeque<ChunkGuid> = VecDeque::new();
    let mut in_dl_list: HashSet<ChunkGuid> = HashSet::new();
    let mut cached: HashSet<ChunkGuid> = HashSet::new();
    let mut ever_cached: HashSet<ChunkGuid> = HashSet::new();
    let mut peak_cached = 0usize;

    for file in order {
        if file.chunk_parts.is_empty() {
            tasks.push_back(
                FileTask::CreateEmpty {
                    path: file.filename.clone(),
                }
                .into(),
            );
            continue;
        }

        let existing = reusable.get(file.filename.as_str());
        let mut chunk_tasks = Vec::with_capacity(file.chunk_parts.len());

        for part in &file.chunk_parts {
            let mut task = ChunkTask::download(part.guid, part.offset, part.size);
            let key = (part.guid, part.offset, part.size);

            if let Some(&offset) = existing.and_then(|e| e.get(&key)) {
                task.old_file = Some(OldFileSource {
                    path: file.filename.clone(),
                    offset,
                });
                result.num_chunks_reused += 1;
            } else {
                if in_dl_list.insert(part.guid) {
                    chunks_to_dl.push_back(part.guid);
                }

                let remaining = references.entry(part.guid).or_default();
                if *remaining > 1 || cached.contains(&part.guid) {
                    *remaining = remaining.saturating_sub(1);
                    if *remaining == 0 {
                        cached.remove(&part.guid);
                        task.cleanup = true;
                    } else if cached.insert(part.guid) {
                        ever_cached.insert(part.guid);
                    }
                } else {
                    task.cleanup = true;
                }
                peak_cached = peak_cached.max(cached.len());
            }

            chunk_tasks.push(Task::Chunk(task));
        }

        if existing.is_some() {
            debug!("Reusing chunks from old {}", file.filename);
            let tmp = format!("{}{TMP_SUFFIX}", file.filename);
            tasks.push_back(FileTask::Open { path: tmp.clone() }.into());
            tasks.extend(chunk_tasks);
            tasks.push_back(FileTask::Close { path: tmp.clone() }.into());
            tasks.push_back(
                FileTask::Rename {
                    source: tmp,
                    target: file.filename.clone(),
                    delete_first: true,
                }
                .into(),
            );
        } else {
            tasks.push_back(
                FileTask::Open {
                    path: file.filename.clone(),
                }
                .into(),
            );
            tasks.extend(chunk_tasks);
            tasks.push_back(
                FileTask::Close {
                    path: file.filename.clone(),
                }
                .into(),
            );
        }

        if file.is_executable() {
            tasks.push_back(
                FileTask::MakeExecutable {
                    path: file.filename.clone(),
                }
                .into(),
            );
        }
    }

    result.min_memory = peak_cached as u64 * biggest + MIN_MEMORY_PADDING;
    debug!(
        "Peak of {peak_cached} cached chunks, minimum memory {} MiB",
        result.min_memory / 1024 / 1024
    );
    if result.min_memory > options.max_shared_memory {
        return Err(InstallError::InsufficientArena {
            required: result.min_memory,
            available: options.max_shared_memory,
        });
    }

    for guid in &chunks_to_dl {
        if let Some(chunk) = manifest.chunk(guid) {
            result.dl_size += chunk.file_size;
            result.uncompressed_dl_size += u64::from(chunk.window_size);
        }
    }

    let mut removed: Vec<&String> = mc.removed.iter().collect();
    removed.sort();
    for path in removed {
        tasks.push_back(
            FileTask::Delete {
                path: path.clone(),
                silent: false,
            }
            .into(),
        );
    }

    tag_skipped.sort_unstable();
    for path in tag_skipped {
        tasks.push_back(
            FileTask::Delete {
                path: path.to_string(),
                silent: true,
            }
            .into(),
        );
        tasks.push_back(
            FileTask::Delete {
                path: format!("{path}{TMP_SUFFIX}"),
                silent: true,
            }
            .into(),
        );
    }

    result.num_chunks = chunks_to_dl.len();
    result.num_chunks_cache = ever_cached.len();
    result.added = mc.added.len();
    result.removed = mc.removed.len();
    result.changed = mc.changed.len();
    result.unchanged = mc.unchanged.len();
    result.num_files = result.added + result.changed;

    info!(
        "Install size: {:.02} MiB, download size: {:.02} MiB ({:.02} MiB uncompressed), reusable: {:.02} MiB",
        mib(result.install_size),
        mib(result.dl_size),
        mib(result.uncompressed_dl_size),
        mib(result.reuse_size)
    );
    info!(
        "{} files to write ({} added, {} changed), {} unchanged, {} removed, {} chunks to download",
        result.num_files,
        result.added,
        result.changed,
        result.unchanged,
        result.removed,
        result.num_chunks
    );

    Ok(InstallPlan {
        result,
        comparison: mc,
        chunks_to_dl,
        tasks,
    })
}

fn apply_resume(
    manifest: &Manifest,
    mc: &mut ManifestComparison,
    options: &AnalysisOptions,
) -> Result<()> {
    if !options.resume {
        return Ok(());
    }

    if let Some(resume_file) = options.resume_file.as_ref().filter(|p| p.exists()) {
        info!("Found previously interrupted download, resuming from {}", resume_file.display());
        let mut completed = HashSet::new();
        for entry in resume::read_entries(resume_file)? {
            let Some(file) = manifest.file(&entry.path) else {
                continue;
            };
            if !entry.matches(&file.sha_hash) {
                debug!("File {} changed since it was recorded, downloading again", entry.path);
                continue;
            }
            if !options.install_path.join(&entry.path).exists() {
                debug!("File {} recorded but missing, downloading again", entry.path);
                continue;
            }
            completed.insert(entry.path);
        }
        mc.added.retain(|f| !completed.contains(f));
        mc.changed.retain(|f| !completed.contains(f));
        mc.unchanged.extend(completed);
        return Ok(());
    }

    let mut missing = 0usize;
    for file in manifest.file_manifest_list.elements() {
        if mc.added.contains(&file.filename) {
            continue;
        }
        if !options.install_path.join(&file.filename).exists() {
            missing += 1;
            mc.changed.remove(&file.filename);
            mc.unchanged.remove(&file.filename);
            mc.added.insert(file.filename.clone());
        }
    }
    if missing > 0 {
        warn!("{missing} previously installed files are missing, downloading them again");
    }
    Ok(())
}

fn reorder_by_overlap(order: Vec<&FileManifest>, min_overlap: usize) -> Vec<&FileManifest> {
    let chunk_sets: Vec<HashSet<ChunkGuid>> = order
        .iter()
        .map(|f| f.chunk_parts.iter().map(|p| p.guid).collect())
        .collect();
    let mut placed = vec![false; order.len()];
    let mut result = Vec::with_capacity(order.len());

    for i in 0..order.len() {
        if placed[i] {
            continue;
        }
        placed[i] = true;
        result.push(order[i]);

        if chunk_sets[i].len() < REORDER_CHUNK_THRESHOLD {
            continue;
        }

        let mut best: Option<(usize, usize)> = None;
        for j in (i + 1)..order.len() {
            if placed[j] || chunk_sets[j].len() < REORDER_CHUNK_THRESHOLD {
                continue;
            }
            let overlap = chunk_sets[i].intersection(&chunk_sets[j]).count();
            if overlap > min_overlap && best.is_none_or(|(_, b)| overlap > b) {
                best = Some((j, overlap));
            }
        }

        if let Some((j, _)) = best {
            placed[j] = true;
            result.push(order[j]);
        }
    }

    result
}

fn lowercase_all(values: &[String]) -> Vec<String> {
    values.iter().map(|v| v.to_lowercase()).collect()
}

#[allow(clippy::cast_precision_loss)]
fn mib(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0
}
