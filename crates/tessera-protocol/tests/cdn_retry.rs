//! CDN client behaviour against a mock HTTP server

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tessera_protocol::{CdnClient, ChunkSource, HttpConfig, ProtocolError, RetryPolicy};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CHUNK_PATH: &str = "ChunksV4/07/00000000DEADBEEF_0000000100000002000000030000000A.chunk";

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(max_attempts)
        .with_initial_backoff(Duration::from_millis(5))
}

fn client(server: &MockServer, retry: RetryPolicy, timeout: Duration) -> CdnClient {
    CdnClient::new(
        &format!("{}/builds", server.uri()),
        &HttpConfig::for_workers(2, timeout),
        retry,
    )
    .expect("client")
}

#[tokio::test]
async fn test_fetch_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/builds/{CHUNK_PATH}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"chunk-bytes".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server, fast_retry(3), Duration::from_secs(5));
    let body = client.fetch(CHUNK_PATH).await.unwrap();
    assert_eq!(body.as_ref(), b"chunk-bytes");
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let server = MockServer::start().await;
    let counter = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&counter);

    Mock::given(method("GET"))
        .and(path(format!("/builds/{CHUNK_PATH}")))
        .respond_with(move |_req: &wiremock::Request| {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                ResponseTemplate::new(503)
            } else {
                ResponseTemplate::new(200).set_body_bytes(b"third time".to_vec())
            }
        })
        .mount(&server)
        .await;

    let client = client(&server, fast_retry(7), Duration::from_secs(5));
    let body = client.fetch(CHUNK_PATH).await.unwrap();
    assert_eq!(body.as_ref(), b"third time");
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_permanent_errors_exhaust_budget() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .expect(3)
        .mount(&server)
        .await;

    let client = client(&server, fast_retry(3), Duration::from_secs(5));
    let err = client.fetch(CHUNK_PATH).await.unwrap_err();
    assert!(matches!(err, ProtocolError::HttpStatus(s) if s.as_u16() == 404));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_auth_failures_classified() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let client = client(&server, fast_retry(1), Duration::from_secs(5));
    let err = client.fetch(CHUNK_PATH).await.unwrap_err();
    assert!(err.is_auth());
}

#[tokio::test]
async fn test_slow_response_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let client = client(&server, fast_retry(2), Duration::from_millis(100));
    let err = client.fetch(CHUNK_PATH).await.unwrap_err();
    assert!(err.is_transient(), "timeout should be transient: {err}");
}
