//! Episode discovery.
//!
//! ```text
//! feeds → FeedFetcher → EpisodeCandidate* → Poller → Dispatcher
//! ```
//!
//! A poll cycle is triggered externally (cron, scheduler, `podscribe poll`)
//! and carries no state of its own.

pub mod feed;
pub mod poller;

// Re-export key types
pub use feed::{parse_feed, FeedError, FeedFetcher, FeedSource, ParsedFeed};
pub use poller::{CycleReport, Poller};
