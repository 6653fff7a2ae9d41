//! # tessera-protocol
//!
//! Network layer of the tessera installer: fetching chunk blobs from a CDN.
//!
//! ## Components
//!
//! - [`CdnClient`]: one base URL, one connection pool, retrying GETs
//! - [`RetryPolicy`]: exponential backoff (1 s, 2 s, 4 s, ... up to 7 attempts by default)
//! - [`select_base_url`]: override, preferred host, or a random pick
//! - [`ChunkSource`]: the seam download workers fetch through
//!
//! ## Errors
//!
//! [`ProtocolError`] classifies failures as transient (timeouts, connection
//! failures, 5xx, 429), authentication (401/403) or permanent. Chunk requests
//! are retried on all of them; the classification decides the log level.
//!
//! ## Example
//!
//! ```rust,no_run
//! use tessera_protocol::{CdnClient, ChunkSource, HttpConfig, RetryPolicy};
//!
//! # async fn demo() -> Result<(), tessera_protocol::ProtocolError> {
//! let client = CdnClient::new(
//!     "https://cdn.example.com/builds/Sugar/CloudDir",
//!     &HttpConfig::default(),
//!     RetryPolicy::default(),
//! )?;
//! let blob = client.fetch("ChunksV4/42/0011223344556677_0102.chunk").await?;
//! println!("{} bytes", blob.len());
//! # Ok(())
//! # }
//! ```

pub mod cdn;
pub mod error;
pub mod retry;
pub mod transport;

pub use cdn::{CdnClient, ChunkSource, select_base_url};
pub use error::{ProtocolError, Result};
pub use retry::RetryPolicy;
pub use transport::{HttpClient, HttpConfig};
