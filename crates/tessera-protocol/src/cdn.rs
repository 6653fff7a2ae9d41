//! CDN chunk delivery
//!
//! A [`CdnClient`] is bound to one base URL for the lifetime of an install
//! run and fetches chunk blobs relative to it, retrying each request
//! according to its [`RetryPolicy`].

use async_trait::async_trait;
use bytes::Bytes;
use rand::RngExt;
use rand::rng;
use url::Url;

use crate::error::{ProtocolError, Result};
use crate::retry::RetryPolicy;
use crate::transport::{HttpClient, HttpConfig};

/// Anything that can produce chunk blobs by CDN path
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Fetch the blob at `path`, relative to the source's base URL
    async fn fetch(&self, path: &str) -> Result<Bytes>;
}

/// HTTP chunk source for a single base URL
#[derive(Debug, Clone)]
pub struct CdnClient {
    http: HttpClient,
    base_url: String,
    retry: RetryPolicy,
}

impl CdnClient {
    /// Create a client with its own connection pool
    pub fn new(base_url: &str, http: &HttpConfig, retry: RetryPolicy) -> Result<Self> {
        Url::parse(base_url)?;
        Ok(Self {
            http: HttpClient::with_config(http)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
        })
    }

    /// Base URL without a trailing slash
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Full URL for a CDN path
    pub fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Fetch a full URL with retry
    pub async fn fetch_url(&self, url: &str) -> Result<Bytes> {
        let client = self.http.inner();
        self.retry
            .execute(|| async move {
                let response = client.get(url).send().await?;
                let status = response.status();
                if status.is_success() {
                    Ok(response.bytes().await?)
                } else {
                    Err(ProtocolError::from_status(status))
                }
            })
            .await
    }
}

#[async_trait]
impl ChunkSource for CdnClient {
    async fn fetch(&self, path: &str) -> Result<Bytes> {
        let url = self.url_for(path);
        self.fetch_url(&url).await
    }
}

/// Pick the base URL for an install run
///
/// An explicit override always wins. Otherwise a URL whose host equals
/// `preferred_host` is used when present, and a random one from `urls`
/// when not.
pub fn select_base_url(
    urls: &[String],
    override_url: Option<&str>,
    preferred_host: Option<&str>,
) -> Result<String> {
    if let Some(url) = override_url {
        Url::parse(url)?;
        return Ok(url.trim_end_matches('/').to_string());
    }

    if urls.is_empty() {
        return Err(ProtocolError::NoBaseUrls);
    }

    if let Some(host) = preferred_host {
        let preferred = urls.iter().find(|candidate| {
            Url::parse(candidate)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.eq_ignore_ascii_case(host)))
                .unwrap_or(false)
        });
        if let Some(url) = preferred {
            return Ok(url.trim_end_matches('/').to_string());
        }
    }

    let index = rng().random_range(0..urls.len());
    let chosen = &urls[index];
    Url::parse(chosen)?;
    Ok(chosen.trim_end_matches('/').to_string())
}
