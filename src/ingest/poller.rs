//! One poll cycle: sweep, fetch every feed, dispatch.
//!
//! The poller keeps no state between cycles. Everything it needs to know
//! about earlier cycles is in the dedup store.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::core::dispatcher::{DispatchSummary, Dispatcher, ReconcileSummary};
use crate::error::StoreError;

use super::feed::FeedSource;

/// What one cycle did
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    /// Correlation id carried into every task of this cycle
    pub trace_id: String,

    pub feeds_ok: usize,
    pub feeds_failed: usize,

    /// Candidates across all feeds, duplicates included
    pub candidates: usize,

    pub reconcile: ReconcileSummary,
    pub dispatch: DispatchSummary,
}

/// Polls a fixed set of feeds
pub struct Poller {
    feeds: Vec<String>,
    source: Arc<dyn FeedSource>,
    dispatcher: Arc<Dispatcher>,
}

impl Poller {
    pub fn new(feeds: Vec<String>, source: Arc<dyn FeedSource>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            feeds,
            source,
            dispatcher,
        }
    }

    pub fn feeds(&self) -> &[String] {
        &self.feeds
    }

    /// Run one cycle.
    ///
    /// Feed failures are logged and skipped; only dedup store failures
    /// abort the cycle.
    #[instrument(skip(self), fields(feeds = self.feeds.len()))]
    pub async fn run_cycle(&self) -> Result<CycleReport, StoreError> {
        let trace_id = Uuid::new_v4().simple().to_string();
        let mut report = CycleReport {
            trace_id: trace_id.clone(),
            ..Default::default()
        };

        // Stale records first so they compete fairly with new episodes
        report.reconcile = self.dispatcher.reconcile(Some(&trace_id)).await?;

        let mut candidates = Vec::new();
        for url in &self.feeds {
            match self.source.fetch(url).await {
                Ok(feed) => {
                    info!(
                        feed = %url,
                        title = feed.title.as_deref().unwrap_or("Unknown Feed"),
                        episodes = feed.candidates.len(),
                        "Fetched feed"
                    );
                    report.feeds_ok += 1;
                    candidates.extend(feed.candidates);
                }
                Err(e) => {
                    warn!(feed = %url, error = %e, "Skipping feed");
                    report.feeds_failed += 1;
                }
            }
        }

        report.candidates = candidates.len();
        report.dispatch = self.dispatcher.dispatch(&candidates, Some(&trace_id)).await?;

        info!(
            %trace_id,
            candidates = report.candidates,
            enqueued = report.dispatch.enqueued,
            feeds_failed = report.feeds_failed,
            "Poll cycle complete"
        );

        Ok(report)
    }
}
