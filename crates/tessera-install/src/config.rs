//! Configuration for the install engine

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tessera_protocol::RetryPolicy;

/// Upper bound for the default worker count
pub const MAX_DEFAULT_WORKERS: usize = 16;

/// Default arena size (1 GiB)
pub const DEFAULT_SHARED_MEMORY: u64 = 1024 * 1024 * 1024;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallerConfig {
    /// Number of parallel download workers
    pub max_workers: usize,

    /// Arena size in bytes
    pub max_shared_memory: u64,

    /// Interval between progress reports
    pub update_interval: Duration,

    /// Per-request HTTP timeout
    pub dl_timeout: Duration,

    /// Backoff schedule for a single chunk request
    pub retry: RetryPolicy,

    /// How often a chunk may be re-queued after exhausting its retries
    pub max_requeues: u32,

    /// Join timeout for workers at shutdown
    pub join_timeout: Duration,

    /// Check decoded chunk hashes in the download worker
    pub verify_chunks: bool,

    /// Check each file's SHA-1 when the writer closes it
    pub verify_writes: bool,

    /// CDN host to prefer when it appears among the base URLs
    pub preferred_cdn: Option<String>,

    /// Base URL to use instead of the manifest's list
    pub base_url_override: Option<String>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_workers(),
            max_shared_memory: DEFAULT_SHARED_MEMORY,
            update_interval: Duration::from_secs(1),
            dl_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            max_requeues: 3,
            join_timeout: Duration::from_secs(5),
            verify_chunks: true,
            verify_writes: false,
            preferred_cdn: None,
            base_url_override: None,
        }
    }
}

impl InstallerConfig {
    /// Defaults overridden by `TESSERA_*` environment variables
    ///
    /// Recognised: `TESSERA_MAX_WORKERS`, `TESSERA_MAX_MEMORY_MIB`,
    /// `TESSERA_DL_TIMEOUT_SECS`, `TESSERA_MAX_RETRIES`,
    /// `TESSERA_PREFERRED_CDN`, `TESSERA_BASE_URL`, plus the retry
    /// variables read by [`RetryPolicy::from_env`].
    pub fn from_env() -> Self {
        let mut config = Self {
            retry: RetryPolicy::from_env(),
            ..Self::default()
        };

        if let Some(workers) = env_parse::<usize>("TESSERA_MAX_WORKERS") {
            config.max_workers = workers.max(1);
        }
        if let Some(mib) = env_parse::<u64>("TESSERA_MAX_MEMORY_MIB") {
            config.max_shared_memory = mib.saturating_mul(1024 * 1024);
        }
        if let Some(secs) = env_parse::<u64>("TESSERA_DL_TIMEOUT_SECS") {
            config.dl_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(retries) = env_parse::<u32>("TESSERA_MAX_RETRIES") {
            config.retry.max_attempts = retries.max(1);
        }
        config.preferred_cdn = env_string("TESSERA_PREFERRED_CDN");
        config.base_url_override = env_string("TESSERA_BASE_URL");

        config
    }

    /// Set the number of download workers
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers.max(1);
        self
    }

    /// Set the arena size in bytes
    #[must_use]
    pub const fn with_shared_memory(mut self, bytes: u64) -> Self {
        self.max_shared_memory = bytes;
        self
    }

    /// Set the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the progress interval
    #[must_use]
    pub const fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    /// Set the per-request HTTP timeout
    #[must_use]
    pub const fn with_dl_timeout(mut self, timeout: Duration) -> Self {
        self.dl_timeout = timeout;
        self
    }

    /// Set the chunk re-queue budget
    #[must_use]
    pub const fn with_max_requeues(mut self, requeues: u32) -> Self {
        self.max_requeues = requeues;
        self
    }

    /// Enable or disable SHA-1 checks at file close
    #[must_use]
    pub const fn with_verify_writes(mut self, enable: bool) -> Self {
        self.verify_writes = enable;
        self
    }

    /// Use a fixed base URL
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url_override = Some(url.into());
        self
    }

    /// Prefer a CDN host
    #[must_use]
    pub fn with_preferred_cdn(mut self, host: impl Into<String>) -> Self {
        self.preferred_cdn = Some(host.into());
        self
    }
}

/// `min(2 * cores, 16)`
pub fn default_workers() -> usize {
    let cores = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    (cores * 2).min(MAX_DEFAULT_WORKERS)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
#[allow(unsafe_code, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = InstallerConfig::default();
        assert!(config.max_workers >= 1 && config.max_workers <= MAX_DEFAULT_WORKERS);
        assert_eq!(config.max_shared_memory, DEFAULT_SHARED_MEMORY);
        assert_eq!(config.dl_timeout, Duration::from_secs(10));
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.join_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_builders_clamp_workers() {
        let config = InstallerConfig::default().with_workers(0).with_shared_memory(64);
        assert_eq!(config.max_workers, 1);
        assert_eq!(config.max_shared_memory, 64);
    }

    #[test]
    fn test_from_env() {
        unsafe {
            std::env::set_var("TESSERA_MAX_WORKERS", "3");
            std::env::set_var("TESSERA_MAX_MEMORY_MIB", "256");
            std::env::set_var("TESSERA_MAX_RETRIES", "2");
            std::env::set_var("TESSERA_BASE_URL", "http://mirror.test");
            std::env::set_var("TESSERA_PREFERRED_CDN", "  ");
        }

        let config = InstallerConfig::from_env();
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.max_shared_memory, 256 * 1024 * 1024);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.base_url_override.as_deref(), Some("http://mirror.test"));
        assert_eq!(config.preferred_cdn, None);

        unsafe {
            std::env::set_var("TESSERA_MAX_MEMORY_MIB", u64::MAX.to_string());
        }
        assert_eq!(InstallerConfig::from_env().max_shared_memory, u64::MAX);

        for var in [
            "TESSERA_MAX_WORKERS",
            "TESSERA_MAX_MEMORY_MIB",
            "TESSERA_MAX_RETRIES",
            "TESSERA_BASE_URL",
            "TESSERA_PREFERRED_CDN",
        ] {
            unsafe {
                std::env::remove_var(var);
            }
        }
    }
}
