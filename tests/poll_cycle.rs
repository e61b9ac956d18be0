//! Poll Cycle Integration Tests
//!
//! Feed fetch, reconcile and dispatch as one cycle.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{header, StatusCode};
use axum::routing::get;
use axum::Router;

use common::{candidate, fast_policy, Harness, RecordingQueue};
use podscribe::core::{DedupStore, DispatchPolicy};
use podscribe::domain::DispatchStatus;
use podscribe::ingest::{FeedError, FeedFetcher, FeedSource, ParsedFeed, Poller};

/// Serves canned feeds; unknown URLs fail to fetch
#[derive(Default)]
struct StaticFeeds {
    feeds: HashMap<String, Vec<&'static str>>,
}

impl StaticFeeds {
    fn with(mut self, url: &str, guids: Vec<&'static str>) -> Self {
        self.feeds.insert(url.to_string(), guids);
        self
    }
}

#[async_trait]
impl FeedSource for StaticFeeds {
    async fn fetch(&self, url: &str) -> Result<ParsedFeed, FeedError> {
        let guids = self.feeds.get(url).ok_or_else(|| FeedError::Fetch {
            url: url.to_string(),
            message: "connection refused".to_string(),
        })?;

        Ok(ParsedFeed {
            title: Some(format!("Feed at {}", url)),
            candidates: guids.iter().map(|guid| candidate(guid)).collect(),
            skipped_without_media: 0,
        })
    }
}

#[tokio::test]
async fn test_cycle_survives_a_failing_feed() {
    let harness = Harness::new().await;
    let queue = RecordingQueue::new();
    let dispatcher = Arc::new(harness.dispatcher(queue.clone(), fast_policy()));

    let source = StaticFeeds::default()
        .with("https://a.example/feed", vec!["ep-1", "ep-2"])
        .with("https://b.example/feed", vec!["ep-1", "ep-3"]);
    let poller = Poller::new(
        vec![
            "https://a.example/feed".to_string(),
            "https://down.example/feed".to_string(),
            "https://b.example/feed".to_string(),
        ],
        Arc::new(source),
        dispatcher,
    );

    let report = poller.run_cycle().await.unwrap();
    assert_eq!(report.feeds_ok, 2);
    assert_eq!(report.feeds_failed, 1);
    assert_eq!(report.candidates, 4);
    assert_eq!(report.dispatch.enqueued, 3);
    assert_eq!(report.dispatch.skipped, 1);

    // Every task carries the cycle's trace id
    let submitted = queue.submitted();
    assert_eq!(submitted.len(), 3);
    assert!(submitted
        .iter()
        .all(|task| task.trace_id.as_deref() == Some(report.trace_id.as_str())));

    // A second cycle finds nothing new
    let again = poller.run_cycle().await.unwrap();
    assert_eq!(again.dispatch.enqueued, 0);
    assert_ne!(again.trace_id, report.trace_id);
    assert_eq!(queue.submitted().len(), 3);
}

#[tokio::test]
async fn test_cycle_reconciles_before_dispatching() {
    let harness = Harness::new().await;
    let queue = RecordingQueue::new();
    let policy = DispatchPolicy {
        stale_dispatched_after_secs: 0,
        ..fast_policy()
    };
    let dispatcher = Arc::new(harness.dispatcher(queue.clone(), policy));

    let source = StaticFeeds::default().with("https://a.example/feed", vec!["ep-1"]);
    let poller = Poller::new(vec!["https://a.example/feed".to_string()], Arc::new(source), dispatcher);

    poller.run_cycle().await.unwrap();
    let report = poller.run_cycle().await.unwrap();

    // The lost submit from cycle one is re-offered, not dispatched as new
    assert_eq!(report.reconcile.reoffered, 1);
    assert_eq!(report.dispatch.enqueued, 0);

    let record = harness.store.get("ep-1").unwrap().unwrap();
    assert_eq!(record.status, DispatchStatus::Dispatched);
    assert_eq!(record.attempt_count, 2);
}

const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Nyheter</title>
    <item>
      <title>Avsnitt 1</title>
      <guid>urn:ep:1</guid>
      <enclosure url="https://cdn.example.com/1.mp3" type="audio/mpeg" length="1024"/>
    </item>
    <item>
      <title>Avsnitt 2</title>
      <guid>urn:ep:2</guid>
      <enclosure url="https://cdn.example.com/2.mp3" type="audio/mpeg" length="1024"/>
    </item>
    <item>
      <title>Bara text</title>
      <guid>urn:ep:text</guid>
    </item>
  </channel>
</rss>"#;

#[tokio::test]
async fn test_cycle_over_http_feeds() {
    let app = Router::new()
        .route("/feed.xml", get(|| async { ([(header::CONTENT_TYPE, "application/rss+xml")], RSS) }))
        .route("/broken.xml", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let harness = Harness::new().await;
    let queue = RecordingQueue::new();
    let dispatcher = Arc::new(harness.dispatcher(queue.clone(), fast_policy()));
    let fetcher = FeedFetcher::new(Duration::from_secs(5)).unwrap();

    let poller = Poller::new(
        vec![
            format!("http://{}/feed.xml", addr),
            format!("http://{}/broken.xml", addr),
        ],
        Arc::new(fetcher),
        dispatcher,
    );

    let report = poller.run_cycle().await.unwrap();
    assert_eq!(report.feeds_ok, 1);
    assert_eq!(report.feeds_failed, 1);
    assert_eq!(report.dispatch.enqueued, 2);

    let mut guids: Vec<_> = queue.submitted().into_iter().map(|task| task.guid).collect();
    guids.sort();
    assert_eq!(guids, vec!["urn:ep:1".to_string(), "urn:ep:2".to_string()]);
    assert!(harness.store.get("urn:ep:text").unwrap().is_none());
}
