//! Command-line interface for podscribe.
//!
//! Provides commands for running poll cycles, serving the worker endpoint,
//! inspecting dispatch state and replaying failed episodes.

use std::fs::{File, OpenOptions};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fs2::FileExt;
use tracing::{info, warn};

use crate::adapters::{
    Downloader, FakeTranscriber, HttpDownloader, HttpTaskQueue, LocalQueue, TaskQueue, Transcriber, WhisperTranscriber,
};
use crate::config::{self, QueueKind, ResolvedConfig, TranscriberBackend};
use crate::core::{DedupStore, Dispatcher, LocalResultStore, ResultStore, SqliteDedupStore};
use crate::domain::DispatchStatus;
use crate::ingest::{CycleReport, FeedFetcher, Poller};
use crate::worker::{self, ScratchSpace, Worker};

/// podscribe - deduplicating podcast transcription dispatcher
#[derive(Parser, Debug)]
#[command(name = "podscribe")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one poll cycle: sweep stale records, fetch feeds, dispatch
    Poll,

    /// Re-offer stale dispatched/processing records without fetching feeds
    Sweep,

    /// Serve the worker endpoint the task queue pushes to
    Serve {
        /// Address to bind to (overrides worker.bind)
        #[arg(short, long, env = "PODSCRIBE_BIND")]
        bind: Option<String>,
    },

    /// Poll and process everything in-process (no external queue)
    Local {
        /// Feed URLs to poll instead of the configured ones
        #[arg(short, long)]
        feed: Vec<String>,

        /// Use the fake transcriber (same as PODSCRIBE_FAKE_MODE=1)
        #[arg(long)]
        fake: bool,
    },

    /// Show dispatch counts and recent records
    Status {
        /// Only show failed records
        #[arg(long)]
        failed: bool,

        /// Maximum number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show a record, its history and its result
    Show {
        /// Episode guid
        guid: String,
    },

    /// Reset a failed record so the next poll dispatches it again
    Replay {
        /// Episode guid
        guid: String,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = config::config()?;

        match self.command {
            Commands::Poll => poll(cfg).await,
            Commands::Sweep => sweep(cfg).await,
            Commands::Serve { bind } => serve(cfg, bind).await,
            Commands::Local { feed, fake } => run_local(cfg, feed, fake).await,
            Commands::Status { failed, limit } => show_status(cfg, failed, limit),
            Commands::Show { guid } => show_record(cfg, &guid).await,
            Commands::Replay { guid } => replay(cfg, &guid),
            Commands::Config => show_config(cfg),
        }
    }
}

// ============================================================================
// Wiring
// ============================================================================

fn open_store(cfg: &ResolvedConfig) -> Result<Arc<SqliteDedupStore>> {
    let path = cfg.db_path();
    let store = SqliteDedupStore::open(&path)
        .with_context(|| format!("Failed to open dedup store: {}", path.display()))?;
    Ok(Arc::new(store))
}

async fn open_results(cfg: &ResolvedConfig) -> Result<Arc<dyn ResultStore>> {
    let store = LocalResultStore::open(&cfg.results_dir)
        .await
        .with_context(|| format!("Failed to open result store: {}", cfg.results_dir.display()))?;
    Ok(Arc::new(store))
}

fn build_transcriber(cfg: &ResolvedConfig, force_fake: bool) -> Arc<dyn Transcriber> {
    if force_fake || cfg.transcriber.backend == TranscriberBackend::Fake {
        info!("Using fake transcriber");
        return Arc::new(FakeTranscriber::new());
    }

    let t = &cfg.transcriber;
    let mut whisper = WhisperTranscriber::new(&t.binary, &t.model, &t.language);
    if let Some(device) = &t.device {
        whisper = whisper.with_device(device);
    }
    Arc::new(whisper)
}

async fn build_worker(cfg: &ResolvedConfig, store: Arc<dyn DedupStore>, force_fake: bool) -> Result<Arc<Worker>> {
    let limits = cfg.worker.limits.clone();
    limits.validate().context("Invalid worker limits")?;

    if cfg.queue.policy.max_attempts != limits.max_delivery_attempts {
        warn!(
            queue_max_attempts = cfg.queue.policy.max_attempts,
            worker_max_delivery_attempts = limits.max_delivery_attempts,
            "Queue and worker disagree on the delivery budget"
        );
    }

    let results = open_results(cfg).await?;

    let downloader: Arc<dyn Downloader> = Arc::new(
        HttpDownloader::new(limits.max_media_bytes, Duration::from_secs(30))
            .context("Failed to create downloader")?,
    );

    let scratch = ScratchSpace::new(&cfg.scratch_dir, limits.max_scratch_bytes)
        .with_context(|| format!("Failed to create scratch dir: {}", cfg.scratch_dir.display()))?;

    let worker = Worker::new(
        store,
        results,
        downloader,
        build_transcriber(cfg, force_fake),
        scratch,
        limits,
    );
    worker.purge_scratch();

    Ok(Arc::new(worker))
}

/// The configured queue. A local queue also gets an in-process worker.
async fn build_queue(
    cfg: &ResolvedConfig,
    store: Arc<dyn DedupStore>,
    force_local: bool,
    force_fake: bool,
) -> Result<QueueHandle> {
    if cfg.queue.kind == QueueKind::Http && !force_local {
        let url = cfg
            .queue
            .url
            .as_deref()
            .context("queue.kind is http but no queue.url (or PODSCRIBE_QUEUE_URL) is set")?;
        let queue = HttpTaskQueue::new(url, Duration::from_secs(cfg.queue.submit_timeout_secs))
            .context("Failed to create HTTP queue client")?;
        return Ok(QueueHandle::Http(Arc::new(queue)));
    }

    let worker = build_worker(cfg, store, force_fake).await?;
    Ok(QueueHandle::Local(Arc::new(LocalQueue::new(worker, cfg.queue.policy.clone()))))
}

enum QueueHandle {
    Http(Arc<HttpTaskQueue>),
    Local(Arc<LocalQueue>),
}

impl QueueHandle {
    fn queue(&self) -> Arc<dyn TaskQueue> {
        match self {
            Self::Http(queue) => queue.clone() as Arc<dyn TaskQueue>,
            Self::Local(queue) => queue.clone() as Arc<dyn TaskQueue>,
        }
    }

    /// Wait for in-process deliveries to finish
    async fn finish(&self) {
        if let Self::Local(queue) = self {
            let reports = queue.drain().await;
            let acked = reports.iter().filter(|r| r.outcome.is_ack()).count();
            if !reports.is_empty() {
                println!("Processed {} task(s): {} acknowledged, {} abandoned", reports.len(), acked, reports.len() - acked);
            }
        }
    }
}

/// Hold an exclusive lock on the poll lock file for the life of the guard
fn acquire_poll_lock(cfg: &ResolvedConfig) -> Result<File> {
    let path = cfg.poll_lock_path();
    std::fs::create_dir_all(&cfg.home)
        .with_context(|| format!("Failed to create home dir: {}", cfg.home.display()))?;

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

    file.try_lock_exclusive()
        .with_context(|| format!("Another poll cycle holds {}", path.display()))?;

    // Lock is released when file is dropped
    Ok(file)
}

// ============================================================================
// Commands
// ============================================================================

async fn poll(cfg: &ResolvedConfig) -> Result<()> {
    run_cycle(cfg, cfg.feeds.clone(), false, false).await
}

async fn run_local(cfg: &ResolvedConfig, feeds: Vec<String>, fake: bool) -> Result<()> {
    let feeds = if feeds.is_empty() { cfg.feeds.clone() } else { feeds };
    run_cycle(cfg, feeds, true, fake).await
}

async fn run_cycle(cfg: &ResolvedConfig, feeds: Vec<String>, force_local: bool, force_fake: bool) -> Result<()> {
    if feeds.is_empty() {
        anyhow::bail!("No feeds configured. Add feeds to .podscribe/config.yaml or pass --feed");
    }

    let _lock = acquire_poll_lock(cfg)?;
    let store = open_store(cfg)?;
    let handle = build_queue(cfg, store.clone(), force_local, force_fake).await?;

    let results = open_results(cfg).await?;
    let dispatcher = Arc::new(Dispatcher::new(store, handle.queue(), results, cfg.dispatch.clone()));
    let fetcher = FeedFetcher::new(Duration::from_secs(60)).context("Failed to create feed fetcher")?;
    let poller = Poller::new(feeds, Arc::new(fetcher), dispatcher);

    let report = poller.run_cycle().await.context("Poll cycle failed")?;
    print_cycle(&report);

    handle.finish().await;
    Ok(())
}

async fn sweep(cfg: &ResolvedConfig) -> Result<()> {
    let _lock = acquire_poll_lock(cfg)?;
    let store = open_store(cfg)?;
    let handle = build_queue(cfg, store.clone(), false, false).await?;
    let results = open_results(cfg).await?;
    let dispatcher = Dispatcher::new(store, handle.queue(), results, cfg.dispatch.clone());

    let summary = dispatcher.reconcile(None).await.context("Sweep failed")?;
    println!(
        "Swept {} stale record(s): {} completed, {} re-offered, {} exhausted, {} enqueue failures",
        summary.swept, summary.completed, summary.reoffered, summary.exhausted, summary.enqueue_failed
    );

    handle.finish().await;
    Ok(())
}

async fn serve(cfg: &ResolvedConfig, bind: Option<String>) -> Result<()> {
    let bind = bind.unwrap_or_else(|| cfg.worker.bind.clone());
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("Invalid bind address: {}", bind))?;

    let store = open_store(cfg)?;
    let worker = build_worker(cfg, store, false).await?;
    worker::serve(worker, addr).await
}

fn show_status(cfg: &ResolvedConfig, failed_only: bool, limit: usize) -> Result<()> {
    let store = open_store(cfg)?;
    let counts = store.counts()?;

    println!("Dispatch records: {}", counts.total());
    println!(
        "  pending: {}  dispatched: {}  processing: {}  done: {}  failed: {}",
        counts.pending, counts.dispatched, counts.processing, counts.done, counts.failed
    );
    println!();

    let filter = failed_only.then_some(DispatchStatus::Failed);
    let records = store.list(filter, limit)?;

    if records.is_empty() {
        println!("No records found");
        return Ok(());
    }

    println!("{:<40} {:<11} {:>8} {:<20} {}", "GUID", "STATUS", "ATTEMPTS", "UPDATED", "DETAIL");
    println!("{}", "-".repeat(110));

    for record in records {
        let detail = match (&record.failure, &record.last_error) {
            (Some(failure), Some(error)) => format!("{}: {}", failure, truncate(error, 40)),
            _ => record.title.as_deref().map(|t| truncate(t, 40)).unwrap_or_default(),
        };
        println!(
            "{:<40} {:<11} {:>8} {:<20} {}",
            truncate(&record.guid, 40),
            record.status,
            record.attempt_count,
            record.last_updated_at.format("%Y-%m-%d %H:%M:%S"),
            detail
        );
    }

    Ok(())
}

async fn show_record(cfg: &ResolvedConfig, guid: &str) -> Result<()> {
    let store = open_store(cfg)?;
    let record = store
        .get(guid)?
        .with_context(|| format!("No dispatch record for guid: {}", guid))?;

    println!("GUID:          {}", record.guid);
    println!("Title:         {}", record.title.as_deref().unwrap_or("-"));
    println!("Media:         {}", record.media_url);
    println!("Status:        {}", record.status);
    println!("Attempts:      {}", record.attempt_count);
    println!("First seen:    {}", record.first_seen_at);
    println!("Last updated:  {}", record.last_updated_at);
    if let Some(failure) = record.failure {
        println!("Failure:       {}", failure);
    }
    if let Some(error) = &record.last_error {
        println!("Last error:    {}", error);
    }

    println!("\nHistory:");
    for event in store.history(guid)? {
        let note = event.note.as_deref().map(|n| format!(" ({})", n)).unwrap_or_default();
        println!(
            "  {}  {:<28} attempt {}{}",
            event.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            event.transition_label(),
            event.attempt_count,
            note
        );
    }

    let results = LocalResultStore::open(&cfg.results_dir).await?;
    match results.get(guid).await? {
        Some(result) => {
            println!("\nResult: {}", results.path_for(guid).display());
            println!(
                "  {} segment(s), model {}, language {}",
                result.segments.len(),
                result.model.model,
                result.model.language
            );
        }
        None => println!("\nResult: (none)"),
    }

    Ok(())
}

fn replay(cfg: &ResolvedConfig, guid: &str) -> Result<()> {
    let store = open_store(cfg)?;

    if store.reset_for_replay(guid)? {
        println!("{} reset to pending; the next poll will dispatch it", guid);
        return Ok(());
    }

    match store.get(guid)? {
        Some(record) => anyhow::bail!("{} is {}, only failed records can be replayed", guid, record.status),
        None => anyhow::bail!("No dispatch record for guid: {}", guid),
    }
}

fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    println!("podscribe configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:          {}", cfg.home.display());
    println!("  Dedup store:   {}", cfg.db_path().display());
    println!("  Results:       {}", cfg.results_dir.display());
    println!("  Scratch:       {}", cfg.scratch_dir.display());
    println!();
    println!("Feeds:");
    if cfg.feeds.is_empty() {
        println!("  (none)");
    }
    for feed in &cfg.feeds {
        println!("  {}", feed);
    }
    println!();

    let sections = serde_yaml::to_string(&serde_json::json!({
        "dispatch": cfg.dispatch,
        "queue": cfg.queue,
        "worker": cfg.worker,
        "transcriber": cfg.transcriber,
    }))
    .context("Failed to render configuration")?;
    println!("{}", sections);

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

fn print_cycle(report: &CycleReport) {
    println!("Cycle {}", report.trace_id);
    println!(
        "  feeds: {} ok, {} failed; {} candidate(s)",
        report.feeds_ok, report.feeds_failed, report.candidates
    );
    if report.reconcile.swept > 0 {
        println!(
            "  sweep: {} stale, {} completed, {} re-offered, {} exhausted",
            report.reconcile.swept,
            report.reconcile.completed,
            report.reconcile.reoffered,
            report.reconcile.exhausted
        );
    }
    println!(
        "  dispatch: {} enqueued, {} skipped, {} enqueue failure(s)",
        report.dispatch.enqueued, report.dispatch.skipped, report.dispatch.enqueue_failed
    );
    for guid in &report.dispatch.permanent_failures {
        println!("  permanently failed: {}", guid);
    }
}
