//! Subcommand handlers

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use anyhow::{Context as _, Result, bail};
use clap::Args;
use serde::Serialize;
use tessera_formats::{Manifest, ManifestComparison};
use tessera_install::{
    InstallError, InstallRequest, InstalledGame, Installer, InstallerConfig, PackOptions,
    StateDir, pack_directory,
};
use tessera_protocol::{CdnClient, HttpConfig, RetryPolicy};
use tracing::{info, warn};

use crate::output::{OutputFormat, emit, format_bytes, print_fields};

const MIB: u64 = 1024 * 1024;

/// Shared state of one invocation
pub struct Context {
    state: StateDir,
    format: OutputFormat,
}

impl Context {
    pub fn new(state_dir: Option<PathBuf>, format: OutputFormat) -> Result<Self> {
        let state = match state_dir {
            Some(dir) => StateDir::new(dir),
            None => StateDir::default_location()?,
        };
        Ok(Self { state, format })
    }

    fn installer(&self, config: InstallerConfig) -> Installer {
        Installer::new(self.state.clone(), config)
    }
}

#[derive(Args)]
pub struct InfoArgs {
    /// Manifest file or URL
    manifest: String,
}

#[derive(Args)]
pub struct DiffArgs {
    /// Manifest of the installed build
    old: String,
    /// Manifest of the target build
    new: String,
}

#[derive(Args)]
pub struct InstallArgs {
    /// Manifest file or URL
    manifest: String,

    /// Delta manifest overlaid onto the manifest before installing
    #[arg(long)]
    delta: Option<String>,

    /// Install directory
    #[arg(long)]
    path: PathBuf,

    /// Install tags to select, comma separated; untagged files are always installed
    #[arg(long, value_delimiter = ',')]
    tags: Option<Vec<String>>,

    /// Only install files starting with this prefix
    #[arg(long)]
    include: Vec<String>,

    /// Skip files starting with this prefix
    #[arg(long)]
    exclude: Vec<String>,

    /// Reorder processing to reduce memory use
    #[arg(long)]
    reorder: bool,

    /// Number of download workers
    #[arg(long)]
    workers: Option<usize>,

    /// Shared memory limit in MiB
    #[arg(long)]
    max_memory: Option<u64>,

    /// Fetch chunks from this base URL instead of the manifest's
    #[arg(long)]
    base_url: Option<String>,

    /// Prefer base URLs on this host
    #[arg(long)]
    preferred_cdn: Option<String>,

    /// Skip the SHA-1 check when files are closed
    #[arg(long)]
    no_verify: bool,

    /// Record that launching needs an ownership token
    #[arg(long)]
    requires_ot: bool,

    /// Record that the game runs without a network connection
    #[arg(long)]
    can_run_offline: bool,

    /// Store-front catalog item GUID to record
    #[arg(long)]
    catalog_item: Option<String>,
}

#[derive(Args)]
pub struct AppArgs {
    /// Installed application name
    app_name: String,
}

#[derive(Args)]
pub struct RepairArgs {
    /// Installed application name
    app_name: String,

    /// Number of download workers
    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Args)]
pub struct UninstallArgs {
    /// Installed application name
    app_name: String,

    /// Forget the install but leave its files on disk
    #[arg(long)]
    keep_files: bool,
}

#[derive(Args)]
pub struct PackArgs {
    /// Directory to pack
    source: PathBuf,

    /// Application name
    #[arg(long)]
    app: String,

    /// Account id appended to the application name
    #[arg(long)]
    account: String,

    /// Save folder path as configured for the game
    #[arg(long)]
    save_folder: String,

    /// macOS save folder path
    #[arg(long)]
    save_folder_mac: Option<String>,

    /// Build version; the current local time when omitted
    #[arg(long)]
    build_version: Option<String>,

    /// Output directory for the manifest and chunks
    #[arg(long)]
    out: PathBuf,
}

async fn read_source(source: &str) -> Result<Vec<u8>> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let client = CdnClient::new(source, &HttpConfig::default(), RetryPolicy::default())?;
        let data = client
            .fetch_url(source)
            .await
            .with_context(|| format!("fetching {source}"))?;
        Ok(data.to_vec())
    } else {
        std::fs::read(source).with_context(|| format!("reading {source}"))
    }
}

async fn read_manifest(source: &str) -> Result<Manifest> {
    let data = read_source(source).await?;
    Manifest::parse_any(&data).with_context(|| format!("parsing {source}"))
}

#[derive(Serialize)]
struct ManifestInfo {
    app_name: String,
    build_version: String,
    build_id: String,
    feature_level: u32,
    launch_exe: String,
    launch_command: String,
    prerequisites: Option<String>,
    files: usize,
    chunks: usize,
    install_size: u64,
    download_size: u64,
    install_tags: Vec<String>,
    base_urls: Vec<String>,
    custom_fields: BTreeMap<String, String>,
}

pub async fn info(ctx: &Context, args: &InfoArgs) -> Result<()> {
    let manifest = read_manifest(&args.manifest).await?;
    let files = manifest.file_manifest_list.elements();
    let meta = &manifest.meta;
    let summary = ManifestInfo {
        app_name: meta.app_name.clone(),
        build_version: meta.build_version.clone(),
        build_id: meta.build_id(),
        feature_level: meta.feature_level,
        launch_exe: meta.launch_exe.clone(),
        launch_command: meta.launch_command.clone(),
        prerequisites: (!meta.prereq_name.is_empty()).then(|| meta.prereq_name.clone()),
        files: files.len(),
        chunks: manifest.chunk_data_list.len(),
        install_size: manifest.file_manifest_list.total_size(),
        download_size: manifest
            .chunk_data_list
            .elements()
            .iter()
            .map(|c| c.file_size)
            .sum(),
        install_tags: files
            .iter()
            .flat_map(|f| f.install_tags.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect(),
        base_urls: manifest.base_urls(),
        custom_fields: manifest.custom_fields.fields.clone(),
    };

    emit(ctx.format, &summary, |s| {
        print_fields(&[
            ("App name", s.app_name.clone()),
            ("Build version", s.build_version.clone()),
            ("Build id", s.build_id.clone()),
            ("Feature level", s.feature_level.to_string()),
            ("Launch", format!("{} {}", s.launch_exe, s.launch_command).trim().to_string()),
            ("Prerequisites", s.prerequisites.clone().unwrap_or_else(|| "none".into())),
            ("Files", s.files.to_string()),
            ("Chunks", s.chunks.to_string()),
            ("Install size", format_bytes(s.install_size)),
            ("Download size", format_bytes(s.download_size)),
            ("Install tags", s.install_tags.join(", ")),
            ("Base URLs", s.base_urls.join(", ")),
        ]);
        for (key, value) in &s.custom_fields {
            println!("  {key} = {value}");
        }
    })
}

#[derive(Serialize)]
struct DiffReport {
    added: Vec<String>,
    removed: Vec<String>,
    changed: Vec<String>,
    unchanged: usize,
}

fn sorted(set: &std::collections::HashSet<String>) -> Vec<String> {
    let mut paths: Vec<String> = set.iter().cloned().collect();
    paths.sort_unstable();
    paths
}

pub async fn diff(ctx: &Context, args: &DiffArgs) -> Result<()> {
    let old = read_manifest(&args.old).await?;
    let new = read_manifest(&args.new).await?;
    let comparison = ManifestComparison::create(&new, Some(&old));
    let report = DiffReport {
        added: sorted(&comparison.added),
        removed: sorted(&comparison.removed),
        changed: sorted(&comparison.changed),
        unchanged: comparison.unchanged.len(),
    };

    emit(ctx.format, &report, |r| {
        for path in &r.added {
            println!("+ {path}");
        }
        for path in &r.removed {
            println!("- {path}");
        }
        for path in &r.changed {
            println!("~ {path}");
        }
        println!(
            "{} added, {} removed, {} changed, {} unchanged",
            r.added.len(),
            r.removed.len(),
            r.changed.len(),
            r.unchanged
        );
    })
}

#[derive(Serialize)]
struct RunReport {
    game: InstalledGame,
    files_written: usize,
    bytes_downloaded: u64,
    bytes_written: u64,
    bytes_reused: u64,
    seconds: f64,
}

fn print_run(report: &RunReport) {
    print_fields(&[
        ("App name", report.game.app_name.clone()),
        ("Version", report.game.version.clone()),
        ("Path", report.game.install_path.display().to_string()),
        ("Files written", report.files_written.to_string()),
        ("Downloaded", format_bytes(report.bytes_downloaded)),
        ("Written", format_bytes(report.bytes_written)),
        ("Reused", format_bytes(report.bytes_reused)),
        ("Time", format!("{:.1} s", report.seconds)),
    ]);
}

/// Cancel the installer's running job on Ctrl-C
fn cancel_on_interrupt(installer: &Installer) {
    let cancel = installer.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping; run the same command again to resume");
            cancel.cancel();
        }
    });
}

pub async fn install(ctx: &Context, args: &InstallArgs) -> Result<()> {
    let data = match &args.delta {
        Some(delta) => {
            let mut manifest = read_manifest(&args.manifest).await?;
            manifest.apply_delta(&read_manifest(delta).await?);
            info!("Applied delta manifest {delta}");
            manifest.build()?
        }
        None => read_source(&args.manifest).await?,
    };

    let mut config = InstallerConfig::from_env().with_verify_writes(!args.no_verify);
    if let Some(workers) = args.workers {
        config = config.with_workers(workers);
    }
    if let Some(max_memory) = args.max_memory {
        config = config.with_shared_memory(max_memory.saturating_mul(MIB));
    }
    if let Some(url) = &args.base_url {
        config = config.with_base_url(url);
    }
    if let Some(host) = &args.preferred_cdn {
        config = config.with_preferred_cdn(host);
    }

    let request = InstallRequest {
        install_path: args.path.clone(),
        install_tags: args.tags.clone(),
        include_prefixes: args.include.clone(),
        exclude_prefixes: args.exclude.clone(),
        reorder: args.reorder,
        requires_ot: args.requires_ot,
        can_run_offline: args.can_run_offline,
        catalog_item_id: args.catalog_item.clone(),
    };
    let installer = ctx.installer(config);
    cancel_on_interrupt(&installer);
    let report = installer.install(&data, &request).await?;

    let run = RunReport {
        game: report.game,
        files_written: report.analysis.num_files,
        bytes_downloaded: report.summary.bytes_downloaded,
        bytes_written: report.summary.bytes_written,
        bytes_reused: report.summary.bytes_read,
        seconds: report.summary.runtime.as_secs_f64(),
    };
    emit(ctx.format, &run, print_run)
}

pub fn verify(ctx: &Context, args: &AppArgs) -> Result<()> {
    let installer = ctx.installer(InstallerConfig::from_env());
    match installer.verify(&args.app_name) {
        Ok(report) => emit(ctx.format, &report.checked, |checked| {
            println!("All {checked} files of {} match", args.app_name);
        }),
        Err(err @ InstallError::VerificationFailed { .. }) => {
            eprintln!("Run `tessera repair {}` to fix the install", args.app_name);
            Err(err.into())
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn repair(ctx: &Context, args: &RepairArgs) -> Result<()> {
    let mut config = InstallerConfig::from_env();
    if let Some(workers) = args.workers {
        config = config.with_workers(workers);
    }
    let installer = ctx.installer(config);
    cancel_on_interrupt(&installer);

    let Some(report) = installer.repair(&args.app_name).await? else {
        println!("Nothing to repair, all files of {} match", args.app_name);
        return Ok(());
    };
    let run = RunReport {
        game: report.game,
        files_written: report.analysis.num_files,
        bytes_downloaded: report.summary.bytes_downloaded,
        bytes_written: report.summary.bytes_written,
        bytes_reused: report.summary.bytes_read,
        seconds: report.summary.runtime.as_secs_f64(),
    };
    emit(ctx.format, &run, print_run)
}

#[derive(Serialize)]
struct PackReport {
    app_name: String,
    build_version: String,
    files: usize,
    chunks: usize,
    manifest: PathBuf,
}

pub fn pack(ctx: &Context, args: &PackArgs) -> Result<()> {
    if !args.source.is_dir() {
        bail!("{} is not a directory", args.source.display());
    }
    let options = PackOptions {
        app_name: args.app.clone(),
        account_id: args.account.clone(),
        save_folder: args.save_folder.clone(),
        save_folder_mac: args.save_folder_mac.clone(),
        build_version: args.build_version.clone(),
    };
    let output = pack_directory(&args.source, &options)?;

    for (relative, data) in &output.files {
        let target = args.out.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, data).with_context(|| format!("writing {}", target.display()))?;
    }

    let meta = &output.manifest.meta;
    let report = PackReport {
        app_name: meta.app_name.clone(),
        build_version: meta.build_version.clone(),
        files: output.manifest.file_manifest_list.len(),
        chunks: output.manifest.chunk_data_list.len(),
        manifest: args
            .out
            .join("manifests")
            .join(format!("{}.manifest", meta.build_version)),
    };
    emit(ctx.format, &report, |r| {
        println!(
            "Packed {} file(s) into {} chunk(s), manifest at {}",
            r.files,
            r.chunks,
            r.manifest.display()
        );
    })
}

pub fn uninstall(ctx: &Context, args: &UninstallArgs) -> Result<()> {
    let installer = ctx.installer(InstallerConfig::default());
    let record = installer.uninstall(&args.app_name, !args.keep_files)?;
    emit(ctx.format, &record, |r| {
        println!("Uninstalled {} {}", r.app_name, r.version);
    })
}

pub fn list_installed(ctx: &Context) -> Result<()> {
    let installed = ctx
        .installer(InstallerConfig::default())
        .list_installed()?;
    emit(ctx.format, &installed, |games| {
        if games.is_empty() {
            println!("No installed applications");
            return;
        }
        for game in games {
            println!(
                "{}  {}  {}  {}",
                game.app_name,
                game.version,
                format_bytes(game.install_size),
                game.install_path.display()
            );
        }
    })
}
