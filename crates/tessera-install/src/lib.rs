//! Install, patch, verify and repair engine for chunked game builds
//!
//! Given a target [`Manifest`](tessera_formats::Manifest) and optionally the
//! manifest of the build already on disk, this crate materialises the
//! target file tree with as little network transfer as possible:
//!
//! 1. [`analysis::analyse`] compares both builds, applies resume and filter
//!    rules, and emits an ordered list of file and chunk tasks together with
//!    the set of chunks that must be downloaded
//! 2. [`manager::DownloadManager`] runs that plan with a pool of download
//!    workers, a shared slot [`arena`] and one [`writer`] thread
//! 3. completed files are appended to a [`resume`] log so an interrupted run
//!    continues where it stopped
//!
//! [`installer::Installer`] wraps all of this together with the persistent
//! [`state`] (installed-games store, manifest cache, install lock) and the
//! [`verify`] pass used for repairs. [`pack`] builds manifests and chunks
//! from a local directory for savegame uploads.
//!
//! # Example
//!
//! ```rust,no_run
//! use tessera_install::{InstallRequest, Installer, InstallerConfig, StateDir};
//!
//! # async fn demo(manifest: Vec<u8>) -> tessera_install::Result<()> {
//! let installer = Installer::new(StateDir::default_location()?, InstallerConfig::from_env());
//! let report = installer
//!     .install(&manifest, &InstallRequest::new("/games/Sugar"))
//!     .await?;
//! println!("installed {} bytes", report.analysis.install_size);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::cast_possible_truncation)] // Chunk offsets and sizes are u32 on the wire
#![allow(clippy::cast_precision_loss)] // Progress rates are approximate
#![allow(clippy::module_name_repetitions)] // Clear naming is preferred

pub mod analysis;
pub mod arena;
pub mod config;
pub mod error;
pub mod installer;
pub mod lock;
pub mod manager;
pub mod pack;
pub mod progress;
pub mod resume;
pub mod state;
pub mod tasks;
pub mod verify;
pub mod worker;
pub mod writer;

// Test utilities module
#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
pub(crate) mod test_utils;

pub use analysis::{AnalysisOptions, AnalysisResult, InstallPlan, analyse};
pub use config::InstallerConfig;
pub use error::{InstallError, Result};
pub use installer::{InstallReport, InstallRequest, Installer, VerifyReport};
pub use lock::InstallLock;
pub use manager::{CancelHandle, DownloadManager, RunSummary, StatusSender};
pub use pack::{PackOptions, PackOutput, pack_directory};
pub use progress::ProgressSnapshot;
pub use state::{InstalledGame, InstalledStore, PrereqInfo, StateDir};
pub use verify::{HashAlgorithm, Verifier, VerifyEntry, VerifyResult};
