//! Persistent installer state
//!
//! Everything the installer remembers between runs lives below one
//! configuration root:
//!
//! ```text
//! <root>/
//!   installed.json                   installed-games store
//!   installed.lock                   install lock
//!   manifests/{app}_{build}.manifest manifest cache
//!   tmp/{app}_{build}.resume         resume logs
//!   tmp/{app}.repair                 repair files
//! ```
//!
//! Writes take an [`InstallLock`] reference so they can only happen while
//! the lock is held.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tessera_formats::Manifest;
use tracing::{debug, warn};

use crate::error::{InstallError, Result};
use crate::lock::InstallLock;

/// Prerequisite installer a build asks to run before first launch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrereqInfo {
    /// Identifiers the prerequisite satisfies
    pub ids: Vec<String>,
    /// Display name
    pub name: String,
    /// Installer path relative to the install root
    pub path: String,
    /// Installer arguments
    pub args: String,
}

/// Record of one installed application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledGame {
    /// Key in the store, taken from the manifest meta
    pub app_name: String,
    /// Build version currently on disk
    pub version: String,
    /// Install root
    pub install_path: PathBuf,
    /// Bytes of all installed files
    pub install_size: u64,
    /// Tags in effect; empty means everything
    #[serde(default)]
    pub install_tags: Vec<String>,
    /// CDN base URLs chunks were fetched from
    #[serde(default)]
    pub base_urls: Vec<String>,
    /// Launch executable relative to the install root
    #[serde(default)]
    pub executable: String,
    /// Launch arguments
    #[serde(default)]
    pub launch_parameters: String,
    /// When the last install or repair finished
    pub installed_at: DateTime<Utc>,
    /// Set when an install finished without write verification
    #[serde(default)]
    pub needs_verification: bool,
    /// Launching requires an ownership token
    #[serde(default)]
    pub requires_ot: bool,
    /// Launching works without a network connection
    #[serde(default)]
    pub can_run_offline: bool,
    /// Prerequisite installer named by the manifest
    #[serde(default)]
    pub prereq_info: Option<PrereqInfo>,
    /// Cloud save folder template, e.g. `{AppData}/Sugar/Saves`
    #[serde(default)]
    pub save_path: Option<String>,
    /// Catalog item GUID in an external store front
    #[serde(default)]
    pub catalog_item_id: Option<String>,
}

/// All installed applications keyed by app name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstalledStore {
    games: BTreeMap<String, InstalledGame>,
}

impl InstalledStore {
    /// Record of `app_name`
    pub fn get(&self, app_name: &str) -> Option<&InstalledGame> {
        self.games.get(app_name)
    }

    /// Add or replace a record, returning the replaced one
    pub fn insert(&mut self, game: InstalledGame) -> Option<InstalledGame> {
        self.games.insert(game.app_name.clone(), game)
    }

    /// Drop the record of `app_name`
    pub fn remove(&mut self, app_name: &str) -> Option<InstalledGame> {
        self.games.remove(app_name)
    }

    /// Records ordered by app name
    pub fn iter(&self) -> impl Iterator<Item = &InstalledGame> {
        self.games.values()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.games.len()
    }

    /// Whether no app is installed
    pub fn is_empty(&self) -> bool {
        self.games.is_empty()
    }
}

/// Configuration root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    /// State below `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Per-user default, e.g. `~/.config/tessera` on Linux
    pub fn default_location() -> Result<Self> {
        dirs::config_dir()
            .map(|dir| Self::new(dir.join("tessera")))
            .ok_or_else(|| InstallError::Config("no configuration directory for this user".into()))
    }

    /// Configuration root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `installed.json`
    pub fn installed_path(&self) -> PathBuf {
        self.root.join("installed.json")
    }

    /// `installed.lock`
    pub fn lock_path(&self) -> PathBuf {
        self.root.join("installed.lock")
    }

    /// Manifest cache directory
    pub fn manifests_dir(&self) -> PathBuf {
        self.root.join("manifests")
    }

    /// Cached manifest of one build
    pub fn manifest_path(&self, app_name: &str, build_version: &str) -> PathBuf {
        self.manifests_dir()
            .join(format!("{}.manifest", file_stem(app_name, build_version)))
    }

    /// Resume log of one build
    pub fn resume_path(&self, app_name: &str, build_version: &str) -> PathBuf {
        self.root
            .join("tmp")
            .join(format!("{}.resume", file_stem(app_name, build_version)))
    }

    /// Repair file of an app
    pub fn repair_path(&self, app_name: &str) -> PathBuf {
        self.root
            .join("tmp")
            .join(format!("{}.repair", sanitize(app_name)))
    }

    /// Take the install lock
    pub fn lock(&self) -> Result<InstallLock> {
        InstallLock::acquire(self.lock_path())
    }

    /// Read the installed-games store; a missing file is an empty store
    pub fn load_installed(&self) -> Result<InstalledStore> {
        match fs::read(self.installed_path()) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(InstalledStore::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the installed-games store
    pub fn save_installed(&self, store: &InstalledStore, _lock: &InstallLock) -> Result<()> {
        let json = serde_json::to_vec_pretty(store)?;
        write_atomic(&self.installed_path(), &json)?;
        debug!("Saved {} installed app(s)", store.len());
        Ok(())
    }

    /// Load a cached manifest, if present
    pub fn load_manifest(&self, app_name: &str, build_version: &str) -> Result<Option<Manifest>> {
        match fs::read(self.manifest_path(app_name, build_version)) {
            Ok(data) => Ok(Some(Manifest::parse_any(&data)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Store the raw bytes of a manifest
    pub fn save_manifest(
        &self,
        app_name: &str,
        build_version: &str,
        data: &[u8],
        _lock: &InstallLock,
    ) -> Result<PathBuf> {
        let path = self.manifest_path(app_name, build_version);
        write_atomic(&path, data)?;
        Ok(path)
    }

    /// Remove every cached manifest of `app_name`, returning how many
    ///
    /// Only `{app}_{build}.manifest` files whose build parses back as a
    /// manifest of `app_name` are removed, so `Sugar` never takes the
    /// cache of `Sugar_Free` with it.
    pub fn remove_manifests(&self, app_name: &str, _lock: &InstallLock) -> Result<usize> {
        let prefix = format!("{}_", sanitize(app_name));
        let entries = match fs::read_dir(self.manifests_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(&prefix) || !name.ends_with(".manifest") {
                continue;
            }
            if !self.cached_for(&entry.path(), app_name) {
                debug!("Keeping {name}, it belongs to another app");
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Could not remove {}: {e}", entry.path().display()),
            }
        }
        Ok(removed)
    }

    /// Whether the cached manifest at `path` was stored for `app_name`
    fn cached_for(&self, path: &Path, app_name: &str) -> bool {
        let manifest = match fs::read(path).map(|data| Manifest::parse_any(&data)) {
            Ok(Ok(manifest)) => manifest,
            Ok(Err(e)) => {
                warn!("Unreadable cached manifest {}: {e}", path.display());
                return false;
            }
            Err(e) => {
                warn!("Could not read {}: {e}", path.display());
                return false;
            }
        };
        manifest.meta.app_name == app_name
            && self.manifest_path(app_name, &manifest.meta.build_version) == path
    }
}

fn file_stem(app_name: &str, build_version: &str) -> String {
    format!("{}_{}", sanitize(app_name), sanitize(build_version))
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("partial");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)
}
