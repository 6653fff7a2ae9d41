//! HTTP transport for chunk downloads
//!
//! Each download worker owns its own [`HttpClient`] so workers never contend
//! on a shared connection pool. The pool is sized from the worker count.

use crate::error::Result;
use reqwest::{Client, ClientBuilder};
use std::time::Duration;

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Connection pool idle timeout
    pub pool_idle_timeout: Duration,
    /// Maximum idle connections per host
    pub pool_max_idle_per_host: usize,
    /// Whole-request timeout
    pub timeout: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Disable Nagle's algorithm
    pub tcp_nodelay: bool,
    /// TCP keepalive interval
    pub tcp_keepalive: Duration,
    /// Accept gzip/brotli/deflate transfer encodings
    pub enable_compression: bool,
    /// User agent header
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 1,
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            tcp_nodelay: true,
            tcp_keepalive: Duration::from_secs(60),
            enable_compression: true,
            user_agent: concat!("tessera/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HttpConfig {
    /// Configuration for one of `workers` parallel download workers
    pub fn for_workers(workers: usize, timeout: Duration) -> Self {
        Self {
            pool_max_idle_per_host: workers.max(1),
            timeout,
            connect_timeout: timeout,
            ..Self::default()
        }
    }
}

/// HTTP transport client
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Build a client from a configuration
    pub fn with_config(config: &HttpConfig) -> Result<Self> {
        // Fails only when a provider is already installed
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut builder = ClientBuilder::new()
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .tcp_nodelay(config.tcp_nodelay)
            .tcp_keepalive(config.tcp_keepalive)
            .redirect(reqwest::redirect::Policy::limited(3))
            .user_agent(config.user_agent.clone());

        if config.enable_compression {
            builder = builder.gzip(true).brotli(true).deflate(true);
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    /// Get the underlying reqwest client
    pub fn inner(&self) -> &Client {
        &self.client
    }
}
