//! Feed fetching and parsing.
//!
//! Feeds are untrusted input. Anything that goes wrong with one feed is a
//! [`FeedError`] for that feed only; callers log it and move on.

use std::time::Duration;

use async_trait::async_trait;
use feed_rs::model::{Entry, Link, Text};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::domain::EpisodeCandidate;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("failed to fetch feed {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("feed {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("failed to parse feed {url}: {message}")]
    Parse { url: String, message: String },
}

/// A parsed feed document
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFeed {
    /// Feed title, if the document has one
    pub title: Option<String>,

    /// Entries with a usable media URL, in document order
    pub candidates: Vec<EpisodeCandidate>,

    /// Entries dropped because they carry no audio
    pub skipped_without_media: usize,
}

/// Anything that can produce candidates for a feed URL
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<ParsedFeed, FeedError>;
}

/// Fetches feeds over HTTP
pub struct FeedFetcher {
    client: reqwest::Client,
}

impl FeedFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("podscribe/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FeedError::Fetch {
                url: String::new(),
                message: e.to_string(),
            })?;

        Ok(Self { client })
    }
}

#[async_trait]
impl FeedSource for FeedFetcher {
    #[instrument(skip(self))]
    async fn fetch(&self, url: &str) -> Result<ParsedFeed, FeedError> {
        let fetch_error = |e: reqwest::Error| FeedError::Fetch {
            url: url.to_string(),
            message: e.to_string(),
        };

        let response = self.client.get(url).send().await.map_err(fetch_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(fetch_error)?;
        parse_feed(&body, url)
    }
}

/// Parse an RSS or Atom document into candidates
pub fn parse_feed(body: &[u8], url: &str) -> Result<ParsedFeed, FeedError> {
    let parser = feed_rs::parser::Builder::new().id_generator(fallback_id).build();
    let feed = parser.parse(body).map_err(|e| FeedError::Parse {
        url: url.to_string(),
        message: e.to_string(),
    })?;

    let feed_title = feed.title.map(|t| t.content.trim().to_string()).filter(|t| !t.is_empty());

    let mut candidates = Vec::new();
    let mut skipped_without_media = 0;

    for entry in feed.entries {
        match candidate_from_entry(entry, feed_title.as_deref()) {
            Some(candidate) => candidates.push(candidate),
            None => skipped_without_media += 1,
        }
    }

    debug!(
        entries = candidates.len() + skipped_without_media,
        candidates = candidates.len(),
        "Parsed feed"
    );

    Ok(ParsedFeed {
        title: feed_title,
        candidates,
        skipped_without_media,
    })
}

/// Id for entries without one: link, then title, else empty.
///
/// feed-rs would otherwise hash these into an id that changes whenever
/// the title is edited.
fn fallback_id(links: &[Link], title: &Option<Text>, _uri: Option<&str>) -> String {
    links
        .first()
        .map(|l| l.href.trim())
        .filter(|href| !href.is_empty())
        .or_else(|| title.as_ref().map(|t| t.content.trim()))
        .unwrap_or_default()
        .to_string()
}

fn candidate_from_entry(entry: Entry, feed_title: Option<&str>) -> Option<EpisodeCandidate> {
    let media_url = media_url(&entry)?;

    let title = entry.title.as_ref().map(|t| t.content.trim().to_string());
    let link = entry.links.first().map(|l| l.href.clone());

    // id, then link, then title
    let guid = Some(entry.id.trim().to_string())
        .filter(|id| !id.is_empty())
        .or_else(|| link.filter(|l| !l.is_empty()))
        .or_else(|| title.clone().filter(|t| !t.is_empty()))?;

    Some(EpisodeCandidate {
        guid,
        title: title.unwrap_or_else(|| "Unknown Episode".to_string()),
        description: entry.summary.map(|s| s.content),
        publish_date: entry.published.or(entry.updated),
        media_url,
        feed_title: feed_title.map(str::to_string),
    })
}

/// Audio enclosures first, then links
fn media_url(entry: &Entry) -> Option<String> {
    let from_enclosures = entry
        .media
        .iter()
        .flat_map(|m| m.content.iter())
        .find_map(|content| {
            let url = content.url.as_ref()?.to_string();
            let is_audio = content
                .content_type
                .as_ref()
                .is_some_and(|mime| mime.ty() == "audio");
            (is_audio || looks_like_mp3(&url)).then_some(url)
        });

    from_enclosures.or_else(|| {
        entry.links.iter().find_map(|link| {
            let is_audio = link.media_type.as_deref().is_some_and(|t| t.starts_with("audio/"));
            (is_audio || looks_like_mp3(&link.href)).then(|| link.href.clone())
        })
    })
}

fn looks_like_mp3(url: &str) -> bool {
    url.split(['?', '#'])
        .next()
        .is_some_and(|path| path.to_ascii_lowercase().ends_with(".mp3"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Dick Harrison svarar</title>
    <link>https://example.com/show</link>
    <description>Historiefrågor</description>
    <item>
      <title>Avsnitt 1</title>
      <guid>ep-1</guid>
      <description>Första avsnittet</description>
      <pubDate>Mon, 06 Jan 2025 10:00:00 GMT</pubDate>
      <enclosure url="https://cdn.example.com/ep1.mp3" length="1234" type="audio/mpeg"/>
    </item>
    <item>
      <title>Avsnitt 2</title>
      <guid>ep-2</guid>
      <enclosure url="https://cdn.example.com/ep2.mp3?token=x" length="1234" type="application/octet-stream"/>
    </item>
    <item>
      <title>Textinlägg</title>
      <guid>post-1</guid>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn test_parse_rss_enclosures() {
        let feed = parse_feed(RSS.as_bytes(), "https://example.com/rss").unwrap();

        assert_eq!(feed.title.as_deref(), Some("Dick Harrison svarar"));
        assert_eq!(feed.candidates.len(), 2);
        assert_eq!(feed.skipped_without_media, 1);

        let first = &feed.candidates[0];
        assert_eq!(first.guid, "ep-1");
        assert_eq!(first.title, "Avsnitt 1");
        assert_eq!(first.media_url, "https://cdn.example.com/ep1.mp3");
        assert_eq!(first.description.as_deref(), Some("Första avsnittet"));
        assert!(first.publish_date.is_some());
        assert_eq!(first.feed_title.as_deref(), Some("Dick Harrison svarar"));

        // Not typed as audio, but the path ends in .mp3
        assert_eq!(feed.candidates[1].media_url, "https://cdn.example.com/ep2.mp3?token=x");
    }

    #[test]
    fn test_duplicate_guids_are_preserved_for_the_dispatcher() {
        let rss = RSS.replace("<guid>ep-2</guid>", "<guid>ep-1</guid>");
        let feed = parse_feed(rss.as_bytes(), "https://example.com/rss").unwrap();

        assert_eq!(feed.candidates.len(), 2);
        assert!(feed.candidates.iter().all(|c| c.guid == "ep-1"));
    }

    #[test]
    fn test_entry_without_guid_falls_back_to_link_then_title() {
        let rss = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Show</title>
    <item>
      <title>Avsnitt 9</title>
      <link>https://example.com/ep9</link>
      <enclosure url="https://cdn.example.com/ep9.mp3" type="audio/mpeg"/>
    </item>
    <item>
      <title>Avsnitt 10</title>
      <enclosure url="https://cdn.example.com/ep10.mp3" type="audio/mpeg"/>
    </item>
  </channel>
</rss>"#;
        let feed = parse_feed(rss.as_bytes(), "https://example.com/rss").unwrap();

        assert_eq!(feed.candidates.len(), 2);
        assert_eq!(feed.candidates[0].guid, "https://example.com/ep9");
        assert_eq!(feed.candidates[1].guid, "Avsnitt 10");
    }

    #[test]
    fn test_malformed_feed_is_parse_error() {
        let err = parse_feed(b"this is not a feed", "https://example.com/rss").unwrap_err();
        assert!(matches!(err, FeedError::Parse { .. }));
    }

    #[test]
    fn test_mp3_detection_ignores_query() {
        assert!(looks_like_mp3("https://x/a.MP3?x=1"));
        assert!(!looks_like_mp3("https://x/a.mp3.html"));
        assert!(!looks_like_mp3("https://x/?file=a.mp3"));
    }
}
