//! Worker Endpoint Integration Tests
//!
//! Request validation and outcome-to-status mapping on the worker router.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use common::{candidate, fast_policy, test_limits, Fetch, Harness, RecordingQueue, ScriptedDownloader};
use podscribe::adapters::Downloader;
use podscribe::core::{DedupStore, WorkerLimits};
use podscribe::domain::{DispatchStatus, FailureKind, ProcessingTask};
use podscribe::worker::router;

async fn setup(downloader: Arc<dyn Downloader>, limits: WorkerLimits) -> (Harness, Router, ProcessingTask) {
    let harness = Harness::new().await;
    let queue = RecordingQueue::new();
    harness
        .dispatcher(queue.clone(), fast_policy())
        .dispatch(&[candidate("ep-1")], None)
        .await
        .unwrap();
    let task = queue.submitted().pop().unwrap();
    let app = router(harness.worker(downloader, limits));
    (harness, app, task)
}

fn post(body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/")
        .header("content-type", "application/json")
        .body(body.into())
        .unwrap()
}

fn post_task(task: &ProcessingTask, delivery: Option<u32>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/")
        .header("content-type", "application/json");
    if let Some(attempt) = delivery {
        builder = builder.header("x-delivery-attempt", attempt.to_string());
    }
    builder.body(Body::from(serde_json::to_vec(task).unwrap())).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let (_harness, app, _task) = setup(ScriptedDownloader::ok(), test_limits()).await;

    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"OK");
}

#[tokio::test]
async fn test_empty_and_malformed_bodies_are_rejected() {
    let (harness, app, _task) = setup(ScriptedDownloader::ok(), test_limits()).await;

    let response = app.clone().oneshot(post("  \n")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app.clone().oneshot(post("{\"guid\": 42")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Nothing was claimed
    assert_eq!(
        harness.store.get("ep-1").unwrap().unwrap().status,
        DispatchStatus::Dispatched
    );
}

#[tokio::test]
async fn test_completed_task_is_acknowledged() {
    let (harness, app, task) = setup(ScriptedDownloader::ok(), test_limits()).await;

    let response = app.oneshot(post_task(&task, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["outcome"], "completed");

    assert_eq!(harness.store.get("ep-1").unwrap().unwrap().status, DispatchStatus::Done);
}

#[tokio::test]
async fn test_transient_failure_requests_redelivery_until_last_attempt() {
    let limits = WorkerLimits {
        max_delivery_attempts: 3,
        ..test_limits()
    };
    let (harness, app, task) = setup(ScriptedDownloader::new(vec![], Fetch::Transient), limits).await;

    let response = app.clone().oneshot(post_task(&task, Some(1))).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["outcome"], "retry");

    // The header says this is the last delivery, whatever the body claims
    let response = app.oneshot(post_task(&task, Some(3))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["outcome"], "failed");

    let record = harness.store.get("ep-1").unwrap().unwrap();
    assert_eq!(record.status, DispatchStatus::Failed);
    assert_eq!(record.failure, Some(FailureKind::TransientExhausted));
}

#[tokio::test]
async fn test_unknown_guid_is_acknowledged_as_duplicate() {
    let (_harness, app, task) = setup(ScriptedDownloader::ok(), test_limits()).await;

    let mut stranger = task.clone();
    stranger.guid = "never-dispatched".to_string();

    let response = app.oneshot(post_task(&stranger, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["outcome"], "duplicate");
}

#[tokio::test]
async fn test_missing_media_url_is_rejected() {
    let (_harness, app, task) = setup(ScriptedDownloader::ok(), test_limits()).await;

    let mut incomplete = task.clone();
    incomplete.media_url = String::new();

    let response = app.oneshot(post_task(&incomplete, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
