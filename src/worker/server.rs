//! Worker HTTP endpoint.
//!
//! The task queue pushes each delivery as `POST /` with a JSON task body.
//! The response status tells the queue what to do next:
//!
//! | Outcome                          | Status | Queue action |
//! |----------------------------------|--------|--------------|
//! | Completed / Duplicate / Failed   | 200    | acknowledge  |
//! | Retry                            | 503    | redeliver    |
//! | Busy                             | 429    | redeliver    |
//! | empty or malformed body          | 400    | dead-letter  |

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::domain::{ProcessingTask, TaskOutcome};

use super::Worker;

/// Header carrying the queue's delivery counter
pub const DELIVERY_ATTEMPT_HEADER: &str = "x-delivery-attempt";

/// Build the worker router
pub fn router(worker: Arc<Worker>) -> Router {
    Router::new()
        .route("/", get(health).post(handle_task))
        .layer(TraceLayer::new_for_http())
        .with_state(worker)
}

/// HTTP status for a task outcome
pub fn status_for(outcome: &TaskOutcome) -> StatusCode {
    match outcome {
        TaskOutcome::Completed | TaskOutcome::Duplicate | TaskOutcome::Failed { .. } => StatusCode::OK,
        TaskOutcome::Retry { .. } => StatusCode::SERVICE_UNAVAILABLE,
        TaskOutcome::Busy => StatusCode::TOO_MANY_REQUESTS,
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn handle_task(State(worker): State<Arc<Worker>>, headers: HeaderMap, body: Bytes) -> Response {
    if body.iter().all(u8::is_ascii_whitespace) {
        return (StatusCode::BAD_REQUEST, "No episode data provided").into_response();
    }

    let mut task: ProcessingTask = match serde_json::from_slice(&body) {
        Ok(task) => task,
        Err(e) => {
            warn!(error = %e, "Rejecting malformed task body");
            return (StatusCode::BAD_REQUEST, format!("Invalid episode data: {}", e)).into_response();
        }
    };

    if task.guid.trim().is_empty() || task.media_url.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "guid and media_url are required").into_response();
    }

    // The queue's counter wins over whatever the body says
    if let Some(attempt) = headers
        .get(DELIVERY_ATTEMPT_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u32>().ok())
        .filter(|attempt| *attempt > 0)
    {
        task.delivery_attempt = attempt;
    }

    let outcome = worker.process(task).await;
    (status_for(&outcome), Json(outcome)).into_response()
}

/// Serve the worker endpoint until Ctrl-C
pub async fn serve(worker: Arc<Worker>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let local = listener.local_addr().context("Failed to read bound address")?;
    info!(addr = %local, "Worker listening");

    axum::serve(listener, router(worker))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Worker server failed")?;

    info!("Worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&TaskOutcome::Completed), StatusCode::OK);
        assert_eq!(status_for(&TaskOutcome::Duplicate), StatusCode::OK);
        assert_eq!(status_for(&TaskOutcome::Failed { error: "404".into() }), StatusCode::OK);
        assert_eq!(
            status_for(&TaskOutcome::Retry { error: "503".into() }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_for(&TaskOutcome::Busy), StatusCode::TOO_MANY_REQUESTS);
    }
}
