//! HTTP Adapter Integration Tests
//!
//! `HttpDownloader` and `HttpTaskQueue` against a local axum server.

mod common;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use tempfile::TempDir;

use common::{candidate, test_limits, Harness};
use podscribe::adapters::{Downloader, HttpDownloader, HttpTaskQueue, QueueError, SubmitReceipt, TaskQueue};
use podscribe::core::{DedupStore, DispatchPolicy, RetryPolicy};
use podscribe::domain::{DispatchStatus, ProcessingTask};
use podscribe::error::ProcessError;
use podscribe::worker::ScratchSpace;

/// Idempotency keys seen by the fake queue
type Seen = Arc<Mutex<Vec<String>>>;

async fn spawn(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn media_server() -> SocketAddr {
    let app = Router::new()
        .route("/ok.mp3", get(|| async { b"ID3 audio payload".to_vec() }))
        .route("/missing.mp3", get(|| async { StatusCode::NOT_FOUND }))
        .route("/busy.mp3", get(|| async { StatusCode::SERVICE_UNAVAILABLE }))
        .route("/big.mp3", get(|| async { vec![0u8; 4096] }))
        .route("/empty.mp3", get(|| async { Vec::<u8>::new() }));
    spawn(app).await
}

async fn accept(State(seen): State<Seen>, headers: HeaderMap) -> StatusCode {
    if let Some(key) = headers.get("idempotency-key").and_then(|v| v.to_str().ok()) {
        seen.lock().unwrap().push(key.to_string());
    }
    StatusCode::ACCEPTED
}

async fn queue_server(seen: Seen) -> SocketAddr {
    let app = Router::new()
        .route("/accept", post(accept))
        .route("/duplicate", post(|| async { StatusCode::CONFLICT }))
        .route("/reject", post(|| async { (StatusCode::BAD_REQUEST, "bad task") }))
        .route("/throttle", post(|| async { StatusCode::TOO_MANY_REQUESTS }))
        .route("/down", post(|| async { StatusCode::SERVICE_UNAVAILABLE }))
        .with_state(seen);
    spawn(app).await
}

async fn fetch(downloader: &HttpDownloader, scratch: &ScratchSpace, url: &str) -> Result<Vec<u8>, ProcessError> {
    let mut task_scratch = scratch.allocate().unwrap();
    let path = downloader.download(url, &mut task_scratch).await?;
    assert!(path.starts_with(task_scratch.path()));
    Ok(std::fs::read(path).unwrap())
}

// ============================================================================
// Downloader
// ============================================================================

#[tokio::test]
async fn test_download_writes_media_into_scratch() {
    let addr = media_server().await;
    let temp = TempDir::new().unwrap();
    let scratch = ScratchSpace::new(temp.path(), 1024 * 1024).unwrap();
    let downloader = HttpDownloader::new(1024, Duration::from_secs(5)).unwrap();

    let bytes = fetch(&downloader, &scratch, &format!("http://{}/ok.mp3", addr))
        .await
        .unwrap();
    assert_eq!(bytes, b"ID3 audio payload");
    assert_eq!(scratch.used(), 0, "reservation released with the task scratch");
}

#[tokio::test]
async fn test_download_status_classification() {
    let addr = media_server().await;
    let temp = TempDir::new().unwrap();
    let scratch = ScratchSpace::new(temp.path(), 1024 * 1024).unwrap();
    let downloader = HttpDownloader::new(1024, Duration::from_secs(5)).unwrap();

    let missing = fetch(&downloader, &scratch, &format!("http://{}/missing.mp3", addr))
        .await
        .unwrap_err();
    assert!(!missing.is_retryable());
    assert!(missing.to_string().contains("404"));

    let busy = fetch(&downloader, &scratch, &format!("http://{}/busy.mp3", addr))
        .await
        .unwrap_err();
    assert!(busy.is_retryable());

    let empty = fetch(&downloader, &scratch, &format!("http://{}/empty.mp3", addr))
        .await
        .unwrap_err();
    assert!(!empty.is_retryable());
}

#[tokio::test]
async fn test_oversized_media_is_permanent() {
    let addr = media_server().await;
    let temp = TempDir::new().unwrap();
    let scratch = ScratchSpace::new(temp.path(), 1024 * 1024).unwrap();
    let downloader = HttpDownloader::new(1024, Duration::from_secs(5)).unwrap();

    let err = fetch(&downloader, &scratch, &format!("http://{}/big.mp3", addr))
        .await
        .unwrap_err();
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("limit"));
}

#[tokio::test]
async fn test_scratch_exhaustion_is_transient() {
    let addr = media_server().await;
    let temp = TempDir::new().unwrap();
    // Media cap allows the file but the scratch budget does not
    let scratch = ScratchSpace::new(temp.path(), 1024).unwrap();
    let downloader = HttpDownloader::new(1024 * 1024, Duration::from_secs(5)).unwrap();

    let err = fetch(&downloader, &scratch, &format!("http://{}/big.mp3", addr))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(scratch.used(), 0);
}

#[tokio::test]
async fn test_unreachable_host_is_transient() {
    // Bind and drop to get a port nobody listens on
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let temp = TempDir::new().unwrap();
    let scratch = ScratchSpace::new(temp.path(), 1024).unwrap();
    let downloader = HttpDownloader::new(1024, Duration::from_secs(2)).unwrap();

    let err = fetch(&downloader, &scratch, &format!("http://{}/ok.mp3", addr))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}

// ============================================================================
// Task queue
// ============================================================================

fn task() -> ProcessingTask {
    serde_json::from_value(serde_json::json!({
        "guid": "ep-1",
        "media_url": "https://cdn.example.com/ep-1.mp3"
    }))
    .unwrap()
}

#[tokio::test]
async fn test_http_queue_status_mapping() {
    let seen: Seen = Arc::default();
    let addr = queue_server(seen.clone()).await;
    let queue = |path: &str| HttpTaskQueue::new(format!("http://{}{}", addr, path), Duration::from_secs(5)).unwrap();
    let task = task();

    assert_eq!(queue("/accept").submit(&task).await.unwrap(), SubmitReceipt::Accepted);
    assert_eq!(*seen.lock().unwrap(), vec!["ep-1".to_string()]);

    assert_eq!(queue("/duplicate").submit(&task).await.unwrap(), SubmitReceipt::Duplicate);

    match queue("/reject").submit(&task).await {
        Err(QueueError::Rejected { guid, reason }) => {
            assert_eq!(guid, "ep-1");
            assert!(reason.contains("bad task"));
        }
        other => panic!("expected rejection, got {:?}", other),
    }

    let throttled = queue("/throttle").submit(&task).await.unwrap_err();
    assert!(throttled.is_retryable());

    let down = queue("/down").submit(&task).await.unwrap_err();
    assert!(down.is_retryable());
}

#[tokio::test]
async fn test_dispatch_through_http_queue_to_worker_endpoint() {
    let harness = Harness::new().await;
    let media = media_server().await;

    // The queue endpoint is the worker itself, as with a push queue
    let worker = harness.worker(
        Arc::new(HttpDownloader::new(1024, Duration::from_secs(5)).unwrap()),
        test_limits(),
    );
    let worker_addr = spawn(podscribe::worker::router(worker)).await;

    let queue = Arc::new(HttpTaskQueue::new(format!("http://{}/", worker_addr), Duration::from_secs(10)).unwrap());
    let policy = DispatchPolicy {
        enqueue_retry: RetryPolicy::immediate(1),
        ..Default::default()
    };
    let dispatcher = harness.dispatcher(queue, policy);

    let mut episode = candidate("ep-1");
    episode.media_url = format!("http://{}/ok.mp3", media);
    let summary = dispatcher.dispatch(&[episode], None).await.unwrap();
    assert_eq!(summary.enqueued, 1);

    let record = harness.store.get("ep-1").unwrap().unwrap();
    assert_eq!(record.status, DispatchStatus::Done);
    assert_eq!(harness.results.len().await.unwrap(), 1);
}
