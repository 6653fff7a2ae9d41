//! Install, verify, repair and uninstall over persistent state
//!
//! [`Installer`] is the entry point front ends use. It owns a [`StateDir`]
//! and an [`InstallerConfig`] and strings the planner, the orchestrator and
//! the verifier together:
//!
//! ```text
//! install:  lock -> plan -> disk check -> run -> cache manifest -> record
//! verify:   hash files -> repair file -> VerificationFailed
//! repair:   lock -> [verify] -> plan from repair file -> run -> record
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tessera_formats::{Manifest, ManifestMeta};
use tessera_protocol::{ChunkSource, select_base_url};
use tracing::{debug, info, warn};

use crate::analysis::{AnalysisOptions, AnalysisResult, analyse, tag_allowed};
use crate::config::InstallerConfig;
use crate::error::{InstallError, Result};
use crate::manager::{CancelHandle, DownloadManager, RunSummary, StatusSender};
use crate::resume::write_repair_file;
use crate::pack::SAVE_FOLDER_FIELD;
use crate::state::{InstalledGame, InstalledStore, PrereqInfo, StateDir};
use crate::verify::{HashAlgorithm, Verifier, VerifyResult};

/// What to install and where
#[derive(Debug, Clone)]
pub struct InstallRequest {
    /// Install root
    pub install_path: PathBuf,
    /// Tags to install; `None` keeps the tags of an existing install
    pub install_tags: Option<Vec<String>>,
    /// Only install files starting with one of these (case-insensitive)
    pub include_prefixes: Vec<String>,
    /// Skip files starting with one of these (case-insensitive)
    pub exclude_prefixes: Vec<String>,
    /// Reorder processing to shrink the arena
    pub reorder: bool,
    /// Launching requires an ownership token
    pub requires_ot: bool,
    /// Launching works without a network connection
    pub can_run_offline: bool,
    /// Catalog item GUID; `None` keeps the one of an existing install
    pub catalog_item_id: Option<String>,
}

impl InstallRequest {
    /// Install everything below `install_path`
    pub fn new(install_path: impl Into<PathBuf>) -> Self {
        Self {
            install_path: install_path.into(),
            install_tags: None,
            include_prefixes: Vec::new(),
            exclude_prefixes: Vec::new(),
            reorder: false,
            requires_ot: false,
            can_run_offline: false,
            catalog_item_id: None,
        }
    }

    /// Install only untagged files and files carrying one of `tags`
    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.install_tags = Some(tags);
        self
    }

    /// Record the store-front catalog entry the build belongs to
    #[must_use]
    pub fn with_catalog_item(mut self, id: impl Into<String>) -> Self {
        self.catalog_item_id = Some(id.into());
        self
    }
}

/// Outcome of an install or repair
#[derive(Debug, Clone)]
pub struct InstallReport {
    /// Record written to the installed-games store
    pub game: InstalledGame,
    /// Sizes and counts of the plan
    pub analysis: AnalysisResult,
    /// Totals of the run
    pub summary: RunSummary,
}

/// Outcome of a clean verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyReport {
    /// Files hashed
    pub checked: usize,
    /// Files with a different digest or unreadable
    pub failed: usize,
    /// Files not on disk
    pub missing: usize,
}

impl VerifyReport {
    /// No failed or missing files
    pub const fn is_clean(&self) -> bool {
        self.failed == 0 && self.missing == 0
    }
}

/// Install façade
pub struct Installer {
    state: StateDir,
    config: InstallerConfig,
    cancel: CancelHandle,
    status: Option<StatusSender>,
    source: Option<Arc<dyn ChunkSource>>,
}

impl Installer {
    /// Installer over `state` with `config`
    pub fn new(state: StateDir, config: InstallerConfig) -> Self {
        Self {
            state,
            config,
            cancel: CancelHandle::new(),
            status: None,
            source: None,
        }
    }

    /// Forward progress snapshots of every run to `sink`
    #[must_use]
    pub fn with_status_sink(mut self, sink: StatusSender) -> Self {
        self.status = Some(sink);
        self
    }

    /// Fetch chunks from `source` instead of the manifest's CDN
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn ChunkSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Handle that cancels the current and later runs
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// State directory in use
    pub const fn state(&self) -> &StateDir {
        &self.state
    }

    /// Install or update from raw manifest bytes (binary or JSON)
    pub async fn install(
        &self,
        manifest_data: &[u8],
        request: &InstallRequest,
    ) -> Result<InstallReport> {
        let lock = self.state.lock()?;
        let manifest = Manifest::parse_any(manifest_data)?;
        let app_name = manifest.meta.app_name.clone();
        let version = manifest.meta.build_version.clone();

        let mut store = self.state.load_installed()?;
        let previous = store.get(&app_name).cloned();
        let old = match &previous {
            Some(record) => self.state.load_manifest(&app_name, &record.version)?,
            None => None,
        };
        if let Some(record) = &previous {
            info!("Updating {app_name} from {} to {version}", record.version);
        }

        let install_tags = request
            .install_tags
            .clone()
            .or_else(|| previous.as_ref().map(|r| r.install_tags.clone()))
            .filter(|tags| !tags.is_empty());
        let resume_path = self.state.resume_path(&app_name, &version);
        let options = AnalysisOptions {
            resume_file: Some(resume_path.clone()),
            include_prefixes: request.include_prefixes.clone(),
            exclude_prefixes: request.exclude_prefixes.clone(),
            install_tags: install_tags.clone(),
            processing_optimization: request.reorder,
            max_shared_memory: self.config.max_shared_memory,
            ..AnalysisOptions::new(&request.install_path)
        };
        let plan = analyse(&manifest, old.as_ref(), &options)?;
        let analysis = plan.result.clone();

        check_disk_space(&request.install_path, &analysis)?;

        let fallback = previous.as_ref().map(|r| r.base_urls.clone()).unwrap_or_default();
        let base_urls = non_empty_or(manifest.base_urls(), fallback);
        let base_url = self.base_url(&base_urls)?;

        let summary = self
            .manager(&request.install_path, &resume_path)
            .run(&manifest, plan, &base_url)
            .await?;

        self.state
            .save_manifest(&app_name, &version, manifest_data, &lock)?;
        let game = InstalledGame {
            app_name: app_name.clone(),
            version,
            install_path: request.install_path.clone(),
            install_size: analysis.install_size,
            install_tags: install_tags.unwrap_or_default(),
            base_urls,
            executable: manifest.meta.launch_exe.clone(),
            launch_parameters: manifest.meta.launch_command.clone(),
            installed_at: Utc::now(),
            needs_verification: !self.config.verify_writes,
            requires_ot: request.requires_ot,
            can_run_offline: request.can_run_offline,
            prereq_info: prereq_info(&manifest.meta),
            save_path: manifest
                .custom_fields
                .get(SAVE_FOLDER_FIELD)
                .map(ToString::to_string),
            catalog_item_id: request
                .catalog_item_id
                .clone()
                .or_else(|| previous.as_ref().and_then(|r| r.catalog_item_id.clone())),
        };
        store.insert(game.clone());
        self.state.save_installed(&store, &lock)?;
        info!("Finished installing {app_name}");

        Ok(InstallReport {
            game,
            analysis,
            summary,
        })
    }

    /// Hash every installed file and write the repair file
    ///
    /// Fails with [`InstallError::VerificationFailed`] when any file is
    /// missing or differs. A clean result removes a stale repair file.
    pub fn verify(&self, app_name: &str) -> Result<VerifyReport> {
        let (record, manifest) = self.installed(&self.state.load_installed()?, app_name)?;
        let report = self.verify_files(&record, &manifest)?;
        if report.is_clean() {
            Ok(report)
        } else {
            Err(InstallError::VerificationFailed {
                failed: report.failed,
                missing: report.missing,
            })
        }
    }

    fn verify_files(&self, record: &InstalledGame, manifest: &Manifest) -> Result<VerifyReport> {
        let files: Vec<(String, String)> = manifest
            .file_manifest_list
            .elements()
            .iter()
            .filter(|f| {
                record.install_tags.is_empty() || tag_allowed(&f.install_tags, &record.install_tags)
            })
            .map(|f| (f.filename.clone(), f.sha_hash.to_hex()))
            .collect();

        let mut report = VerifyReport {
            checked: files.len(),
            failed: 0,
            missing: 0,
        };
        let mut repair = Vec::with_capacity(files.len());
        for entry in Verifier::new(&record.install_path, files, HashAlgorithm::Sha1) {
            match entry.result {
                VerifyResult::Match => {}
                VerifyResult::Mismatch => {
                    warn!("File does not match: {}", entry.path);
                    report.failed += 1;
                }
                VerifyResult::Missing => {
                    warn!("File is missing: {}", entry.path);
                    report.missing += 1;
                }
                VerifyResult::OtherError => {
                    warn!("File could not be verified: {}", entry.path);
                    report.failed += 1;
                }
            }
            if !entry.actual.is_empty() {
                repair.push((entry.actual, entry.path));
            }
        }

        let repair_path = self.state.repair_path(&record.app_name);
        if report.is_clean() {
            if repair_path.exists() {
                std::fs::remove_file(&repair_path)?;
            }
            info!("Verification of {} finished, all {} files OK", record.app_name, report.checked);
        } else {
            write_repair_file(&repair_path, repair)?;
            info!(
                "Verification of {} finished, {} corrupted, {} missing; repair file at {}",
                record.app_name,
                report.failed,
                report.missing,
                repair_path.display()
            );
        }
        Ok(report)
    }

    /// Redownload what the repair file marks as bad
    ///
    /// Runs verification first when no repair file exists. Returns `None`
    /// when everything already matches.
    pub async fn repair(&self, app_name: &str) -> Result<Option<InstallReport>> {
        let lock = self.state.lock()?;
        let mut store = self.state.load_installed()?;
        let (mut record, manifest) = self.installed(&store, app_name)?;

        let repair_path = self.state.repair_path(app_name);
        if !repair_path.exists() {
            debug!("No repair file for {app_name}, verifying first");
            if self.verify_files(&record, &manifest)?.is_clean() {
                return Ok(None);
            }
        }

        let options = AnalysisOptions {
            resume_file: Some(repair_path.clone()),
            patch: false,
            install_tags: Some(record.install_tags.clone()).filter(|tags| !tags.is_empty()),
            max_shared_memory: self.config.max_shared_memory,
            ..AnalysisOptions::new(&record.install_path)
        };
        let plan = analyse(&manifest, None, &options)?;
        let analysis = plan.result.clone();

        let base_urls = non_empty_or(manifest.base_urls(), record.base_urls.clone());
        let base_url = self.base_url(&base_urls)?;
        let summary = self
            .manager(&record.install_path, &repair_path)
            .run(&manifest, plan, &base_url)
            .await?;

        record.needs_verification = false;
        store.insert(record.clone());
        self.state.save_installed(&store, &lock)?;
        info!("Finished repairing {app_name}");

        Ok(Some(InstallReport {
            game: record,
            analysis,
            summary,
        }))
    }

    /// Forget an install, optionally deleting its files
    pub fn uninstall(&self, app_name: &str, delete_files: bool) -> Result<InstalledGame> {
        let lock = self.state.lock()?;
        let mut store = self.state.load_installed()?;
        let record = store
            .get(app_name)
            .cloned()
            .ok_or_else(|| InstallError::NotInstalled(app_name.to_string()))?;

        if delete_files {
            match self.state.load_manifest(app_name, &record.version)? {
                Some(manifest) => delete_installed_files(&record.install_path, &manifest),
                None => warn!("No cached manifest for {app_name}, leaving files in place"),
            }
        }

        let removed = self.state.remove_manifests(app_name, &lock)?;
        debug!("Removed {removed} cached manifest(s) of {app_name}");
        for path in [
            self.state.repair_path(app_name),
            self.state.resume_path(app_name, &record.version),
        ] {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }

        store.remove(app_name);
        self.state.save_installed(&store, &lock)?;
        info!("Uninstalled {app_name}");
        Ok(record)
    }

    /// Every installed application, ordered by name
    pub fn list_installed(&self) -> Result<Vec<InstalledGame>> {
        Ok(self.state.load_installed()?.iter().cloned().collect())
    }

    fn installed(
        &self,
        store: &InstalledStore,
        app_name: &str,
    ) -> Result<(InstalledGame, Manifest)> {
        let record = store
            .get(app_name)
            .cloned()
            .ok_or_else(|| InstallError::NotInstalled(app_name.to_string()))?;
        let manifest = self
            .state
            .load_manifest(app_name, &record.version)?
            .ok_or_else(|| {
                InstallError::Config(format!(
                    "no cached manifest for {app_name} {}; reinstall to fetch it",
                    record.version
                ))
            })?;
        Ok((record, manifest))
    }

    fn base_url(&self, urls: &[String]) -> Result<String> {
        match select_base_url(
            urls,
            self.config.base_url_override.as_deref(),
            self.config.preferred_cdn.as_deref(),
        ) {
            Ok(url) => Ok(url),
            Err(_) if self.source.is_some() => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn manager(&self, install_path: &Path, resume_path: &Path) -> DownloadManager {
        let mut manager = DownloadManager::new(self.config.clone(), install_path)
            .with_resume_file(resume_path)
            .with_cancel_handle(self.cancel.clone());
        if let Some(status) = &self.status {
            manager = manager.with_status_sink(status.clone());
        }
        if let Some(source) = &self.source {
            manager = manager.with_source(Arc::clone(source));
        }
        manager
    }
}

/// Prerequisite named by the manifest meta, if any
fn prereq_info(meta: &ManifestMeta) -> Option<PrereqInfo> {
    if meta.prereq_ids.is_empty() && meta.prereq_path.is_empty() {
        return None;
    }
    Some(PrereqInfo {
        ids: meta.prereq_ids.clone(),
        name: meta.prereq_name.clone(),
        path: meta.prereq_path.clone(),
        args: meta.prereq_args.clone(),
    })
}

fn non_empty_or(urls: Vec<String>, fallback: Vec<String>) -> Vec<String> {
    if urls.is_empty() { fallback } else { urls }
}

fn check_disk_space(install_path: &Path, analysis: &AnalysisResult) -> Result<()> {
    std::fs::create_dir_all(install_path)?;
    let available = fs4::available_space(install_path)?;
    let required = analysis.install_size + analysis.biggest_file_size;
    if required > available {
        return Err(InstallError::InsufficientSpace {
            required,
            available,
        });
    }
    debug!("Disk space OK: {required} bytes required, {available} available");
    Ok(())
}

/// Remove manifest files, then directories left empty, deepest first
fn delete_installed_files(root: &Path, manifest: &Manifest) {
    let mut dirs = std::collections::BTreeSet::new();
    for file in manifest.file_manifest_list.elements() {
        let path = root.join(&file.filename);
        if let Err(e) = std::fs::remove_file(&path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("Could not remove {}: {e}", path.display());
        }
        let mut parent = path.parent();
        while let Some(dir) = parent
            && dir.starts_with(root)
        {
            dirs.insert(dir.to_path_buf());
            parent = dir.parent();
        }
    }
    for dir in dirs.iter().rev() {
        let _ = std::fs::remove_dir(dir);
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_utils::{ManifestBuilder, MemorySource, file_content};
    use std::time::Duration;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        installer: Installer,
        source: Arc<MemorySource>,
        manifest: Manifest,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let manifest = ManifestBuilder::new()
            .file("a.bin", &[(1, 0, 2048)])
            .tagged_file("voice/de.pak", &[(2, 0, 512)], &["de"])
            .file("data/b.bin", &[(1, 2048, 100), (3, 0, 64)])
            .build();
        let source = Arc::new(MemorySource::for_manifest(&manifest));
        let config = InstallerConfig::default()
            .with_workers(2)
            .with_shared_memory(64 * MIB)
            .with_update_interval(Duration::from_millis(50));
        let installer = Installer::new(StateDir::new(dir.path().join("state")), config)
            .with_source(source.clone() as Arc<dyn ChunkSource>);
        Fixture {
            root: dir.path().join("game"),
            _dir: dir,
            installer,
            source,
            manifest,
        }
    }

    #[tokio::test]
    async fn test_install_records_game() {
        let f = fixture();
        let data = f.manifest.build().unwrap();
        let report = f
            .installer
            .install(&data, &InstallRequest::new(&f.root))
            .await
            .unwrap();

        assert_eq!(report.game.app_name, "Sugar");
        assert_eq!(report.analysis.added, 3);
        assert_eq!(f.source.requests(), 3);
        assert_eq!(
            std::fs::read(f.root.join("data/b.bin")).unwrap(),
            file_content(&[(1, 2048, 100), (3, 0, 64)])
        );

        let installed = f.installer.list_installed().unwrap();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].install_path, f.root);
        assert!(f.installer.state().manifest_path("Sugar", "1.0").exists());
        assert!(!f.installer.state().resume_path("Sugar", "1.0").exists());
        assert_eq!(installed[0].prereq_info, None);
        assert_eq!(installed[0].save_path, None);
    }

    #[tokio::test]
    async fn test_install_records_launch_metadata() {
        let f = fixture();
        let mut manifest = f.manifest.clone();
        manifest.meta.prereq_ids = vec!["vcredist".to_string()];
        manifest.meta.prereq_name = "Runtime".to_string();
        manifest.meta.prereq_path = "Redist/setup.exe".to_string();
        manifest.meta.prereq_args = "/quiet".to_string();
        manifest
            .custom_fields
            .insert(SAVE_FOLDER_FIELD, "{AppData}/Sugar/Saves");

        let mut request = InstallRequest::new(&f.root).with_catalog_item("4fe75bbc");
        request.requires_ot = true;
        request.can_run_offline = true;
        let game = f
            .installer
            .install(&manifest.build().unwrap(), &request)
            .await
            .unwrap()
            .game;

        assert!(game.requires_ot);
        assert!(game.can_run_offline);
        assert_eq!(
            game.prereq_info,
            Some(PrereqInfo {
                ids: vec!["vcredist".to_string()],
                name: "Runtime".to_string(),
                path: "Redist/setup.exe".to_string(),
                args: "/quiet".to_string(),
            })
        );
        assert_eq!(game.save_path.as_deref(), Some("{AppData}/Sugar/Saves"));
        assert_eq!(f.installer.list_installed().unwrap(), vec![game]);

        let again = f
            .installer
            .install(&manifest.build().unwrap(), &InstallRequest::new(&f.root))
            .await
            .unwrap()
            .game;
        assert_eq!(again.catalog_item_id.as_deref(), Some("4fe75bbc"));
    }

    #[tokio::test]
    async fn test_install_tags_are_remembered() {
        let f = fixture();
        let data = f.manifest.build().unwrap();
        let request = InstallRequest::new(&f.root).with_tags(vec!["en".to_string()]);
        let report = f.installer.install(&data, &request).await.unwrap();

        assert_eq!(report.game.install_tags, vec!["en".to_string()]);
        assert!(!f.root.join("voice/de.pak").exists());
        assert_eq!(f.installer.verify("Sugar").unwrap().checked, 2);
    }

    #[tokio::test]
    async fn test_verify_then_repair() {
        let f = fixture();
        let data = f.manifest.build().unwrap();
        f.installer
            .install(&data, &InstallRequest::new(&f.root))
            .await
            .unwrap();
        assert!(f.installer.verify("Sugar").unwrap().is_clean());

        let mut corrupted = std::fs::read(f.root.join("a.bin")).unwrap();
        corrupted[7] ^= 0xff;
        std::fs::write(f.root.join("a.bin"), &corrupted).unwrap();
        std::fs::remove_file(f.root.join("voice/de.pak")).unwrap();

        let err = f.installer.verify("Sugar").unwrap_err();
        assert!(matches!(
            err,
            InstallError::VerificationFailed {
                failed: 1,
                missing: 1
            }
        ));
        let repair_path = f.installer.state().repair_path("Sugar");
        let entries = crate::resume::read_entries(&repair_path).unwrap();
        assert_eq!(entries.len(), 2);

        let before = f.source.requests();
        let report = f.installer.repair("Sugar").await.unwrap().unwrap();
        assert_eq!(report.analysis.unchanged, 1);
        assert_eq!(f.source.requests() - before, 2);
        assert!(!repair_path.exists());
        assert!(f.installer.verify("Sugar").unwrap().is_clean());
        assert!(f.installer.repair("Sugar").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_uninstall_deletes_files() {
        let f = fixture();
        let data = f.manifest.build().unwrap();
        f.installer
            .install(&data, &InstallRequest::new(&f.root))
            .await
            .unwrap();
        std::fs::write(f.root.join("user.cfg"), b"keep").unwrap();

        let record = f.installer.uninstall("Sugar", true).unwrap();
        assert_eq!(record.version, "1.0");
        assert!(!f.root.join("a.bin").exists());
        assert!(!f.root.join("data").exists());
        assert!(f.root.join("user.cfg").exists());
        assert!(f.installer.list_installed().unwrap().is_empty());
        assert!(!f.installer.state().manifest_path("Sugar", "1.0").exists());

        assert!(matches!(
            f.installer.uninstall("Sugar", true).unwrap_err(),
            InstallError::NotInstalled(_)
        ));
    }

    #[tokio::test]
    async fn test_install_fails_while_locked() {
        let f = fixture();
        let _held = f.installer.state().lock().unwrap();
        let data = f.manifest.build().unwrap();
        let err = f
            .installer
            .install(&data, &InstallRequest::new(&f.root))
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::InstallLocked(_)));
    }

    #[test]
    fn test_verify_unknown_app() {
        let f = fixture();
        assert!(matches!(
            f.installer.verify("Salt").unwrap_err(),
            InstallError::NotInstalled(_)
        ));
    }
}
