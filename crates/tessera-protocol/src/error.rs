//! Error types for chunk delivery

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server error: {0}")]
    ServerError(StatusCode),

    #[error("HTTP status: {0}")]
    HttpStatus(StatusCode),

    #[error("Authentication rejected: {0}")]
    Auth(StatusCode),

    #[error("Timeout")]
    Timeout,

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("No base URL available")]
    NoBaseUrls,
}

impl ProtocolError {
    /// Classify a non-success status code
    pub fn from_status(status: StatusCode) -> Self {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Self::Auth(status)
        } else if status.is_server_error() {
            Self::ServerError(status)
        } else {
            Self::HttpStatus(status)
        }
    }

    /// Timeouts, connection failures, 5xx and 429
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::ServerError(_) | Self::Timeout => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            Self::HttpStatus(status) => *status == StatusCode::TOO_MANY_REQUESTS,
            Self::Auth(_) | Self::InvalidUrl(_) | Self::NoBaseUrls => false,
        }
    }

    /// 401 and 403 responses
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Whether another attempt at the same URL may succeed
    ///
    /// Chunk URLs are retried on every transport or status failure; the
    /// transient/permanent split only decides how loudly a failure is logged.
    pub const fn should_retry(&self) -> bool {
        !matches!(self, Self::InvalidUrl(_) | Self::NoBaseUrls)
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
