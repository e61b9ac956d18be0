//! Durable guid → dispatch record mapping.
//!
//! Backed by SQLite. Every status change is a compare-and-set executed
//! inside an immediate transaction, so it is atomic across threads and
//! across processes sharing the database file. Each successful change also
//! appends a row to `dispatch_events` in the same transaction.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;

use crate::domain::{DispatchEvent, DispatchRecord, DispatchStatus, EpisodeCandidate, FailureKind};
use crate::error::StoreError;

/// Operations the dispatcher and the worker need from the dedup store
pub trait DedupStore: Send + Sync {
    /// Look up a record
    fn get(&self, guid: &str) -> Result<Option<DispatchRecord>, StoreError>;

    /// Create a pending record on first sighting. Returns the current
    /// record and whether it was created by this call.
    fn create_if_absent(
        &self,
        candidate: &EpisodeCandidate,
        now: DateTime<Utc>,
    ) -> Result<(DispatchRecord, bool), StoreError>;

    /// Compare-and-set: move `guid` from `expected` to `new`.
    /// Returns false (and changes nothing) if the current status differs.
    fn transition(
        &self,
        guid: &str,
        expected: DispatchStatus,
        new: DispatchStatus,
    ) -> Result<bool, StoreError>;

    /// Compare-and-set from any of `expected` to `new`
    fn transition_any(
        &self,
        guid: &str,
        expected: &[DispatchStatus],
        new: DispatchStatus,
    ) -> Result<bool, StoreError>;

    /// Compare-and-set `expected → dispatched`, incrementing attempt_count
    fn begin_dispatch(&self, guid: &str, expected: DispatchStatus) -> Result<bool, StoreError>;

    /// Compare-and-set `expected → failed`, recording why
    fn fail(
        &self,
        guid: &str,
        expected: DispatchStatus,
        failure: FailureKind,
        error: &str,
    ) -> Result<bool, StoreError>;

    /// Guids in `status` whose last update is at or before `older_than`
    fn sweep(&self, status: DispatchStatus, older_than: DateTime<Utc>) -> Result<Vec<String>, StoreError>;

    /// Records, most recently updated first
    fn list(&self, status: Option<DispatchStatus>, limit: usize) -> Result<Vec<DispatchRecord>, StoreError>;

    /// Number of records per status
    fn counts(&self) -> Result<StatusCounts, StoreError>;

    /// Full status history of a guid, oldest first
    fn history(&self, guid: &str) -> Result<Vec<DispatchEvent>, StoreError>;

    /// Manual replay: `failed → pending` with attempt_count reset to zero
    fn reset_for_replay(&self, guid: &str) -> Result<bool, StoreError>;
}

/// Record counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub dispatched: usize,
    pub processing: usize,
    pub done: usize,
    pub failed: usize,
}

impl StatusCounts {
    /// Total records
    pub fn total(&self) -> usize {
        self.pending + self.dispatched + self.processing + self.done + self.failed
    }

    fn slot(&mut self, status: DispatchStatus) -> &mut usize {
        match status {
            DispatchStatus::Pending => &mut self.pending,
            DispatchStatus::Dispatched => &mut self.dispatched,
            DispatchStatus::Processing => &mut self.processing,
            DispatchStatus::Done => &mut self.done,
            DispatchStatus::Failed => &mut self.failed,
        }
    }
}

/// What a successful compare-and-set writes
enum Change<'a> {
    Status(DispatchStatus),
    BeginDispatch,
    Fail { failure: FailureKind, error: &'a str },
    Replay,
}

impl Change<'_> {
    fn target(&self) -> DispatchStatus {
        match self {
            Self::Status(status) => *status,
            Self::BeginDispatch => DispatchStatus::Dispatched,
            Self::Fail { .. } => DispatchStatus::Failed,
            Self::Replay => DispatchStatus::Pending,
        }
    }

    fn note(&self) -> Option<String> {
        match self {
            Self::Fail { failure, error } => Some(format!("{}: {}", failure, error)),
            Self::Replay => Some("manual replay".to_string()),
            _ => None,
        }
    }
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS dispatch_records (
        guid TEXT PRIMARY KEY,
        title TEXT,
        media_url TEXT NOT NULL,
        status TEXT NOT NULL,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        first_seen_at INTEGER NOT NULL,
        last_updated_at INTEGER NOT NULL,
        failure TEXT,
        last_error TEXT,
        description TEXT,
        publish_date INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_dispatch_status_updated
        ON dispatch_records(status, last_updated_at);

    -- Append-only audit trail; rows are never updated or deleted
    CREATE TABLE IF NOT EXISTS dispatch_events (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        guid TEXT NOT NULL,
        from_status TEXT,
        to_status TEXT NOT NULL,
        attempt_count INTEGER NOT NULL,
        note TEXT,
        recorded_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_dispatch_events_guid ON dispatch_events(guid);
"#;

const RECORD_COLUMNS: &str =
    "guid, title, media_url, status, attempt_count, first_seen_at, last_updated_at, failure, last_error, \
     description, publish_date";

/// SQLite-backed dedup store
pub struct SqliteDedupStore {
    conn: Mutex<Connection>,
}

impl SqliteDedupStore {
    /// Open (or create) the store at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL lets the poller read while a worker writes
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
        ",
        )?;

        Self::with_connection(conn)
    }

    /// Private in-memory store (tests, dry runs)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// The single compare-and-set path behind every status change
    fn apply(&self, guid: &str, expected: &[DispatchStatus], change: Change<'_>) -> Result<bool, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM dispatch_records WHERE guid = ?1",
                params![guid],
                |row| row.get(0),
            )
            .optional()?;

        let Some(current) = current else {
            return Ok(false);
        };
        let current = parse_status(&current, 0)?;
        if !expected.contains(&current) {
            return Ok(false);
        }

        let now = Utc::now().timestamp_millis();
        match &change {
            Change::Status(status) => tx.execute(
                "UPDATE dispatch_records SET status = ?2, last_updated_at = ?3 WHERE guid = ?1",
                params![guid, status.as_str(), now],
            )?,
            Change::BeginDispatch => tx.execute(
                "UPDATE dispatch_records
                 SET status = 'dispatched', attempt_count = attempt_count + 1,
                     failure = NULL, last_error = NULL, last_updated_at = ?2
                 WHERE guid = ?1",
                params![guid, now],
            )?,
            Change::Fail { failure, error } => tx.execute(
                "UPDATE dispatch_records
                 SET status = 'failed', failure = ?2, last_error = ?3, last_updated_at = ?4
                 WHERE guid = ?1",
                params![guid, failure.as_str(), error, now],
            )?,
            Change::Replay => tx.execute(
                "UPDATE dispatch_records
                 SET status = 'pending', attempt_count = 0,
                     failure = NULL, last_error = NULL, last_updated_at = ?2
                 WHERE guid = ?1",
                params![guid, now],
            )?,
        };

        let attempt_count: u32 = tx.query_row(
            "SELECT attempt_count FROM dispatch_records WHERE guid = ?1",
            params![guid],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO dispatch_events (guid, from_status, to_status, attempt_count, note, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                guid,
                current.as_str(),
                change.target().as_str(),
                attempt_count,
                change.note(),
                now
            ],
        )?;

        tx.commit()?;
        Ok(true)
    }
}

impl DedupStore for SqliteDedupStore {
    fn get(&self, guid: &str) -> Result<Option<DispatchRecord>, StoreError> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                &format!("SELECT {} FROM dispatch_records WHERE guid = ?1", RECORD_COLUMNS),
                params![guid],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    fn create_if_absent(
        &self,
        candidate: &EpisodeCandidate,
        now: DateTime<Utc>,
    ) -> Result<(DispatchRecord, bool), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now_ms = now.timestamp_millis();

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO dispatch_records
                (guid, title, media_url, status, attempt_count, first_seen_at, last_updated_at,
                 description, publish_date)
             VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?4, ?5, ?6)",
            params![
                candidate.guid,
                candidate.title,
                candidate.media_url,
                now_ms,
                candidate.description,
                candidate.publish_date.map(|d| d.timestamp_millis()),
            ],
        )?;

        if inserted == 1 {
            tx.execute(
                "INSERT INTO dispatch_events (guid, from_status, to_status, attempt_count, note, recorded_at)
                 VALUES (?1, NULL, 'pending', 0, NULL, ?2)",
                params![candidate.guid, now_ms],
            )?;
        }

        let record = tx.query_row(
            &format!("SELECT {} FROM dispatch_records WHERE guid = ?1", RECORD_COLUMNS),
            params![candidate.guid],
            row_to_record,
        )?;

        tx.commit()?;
        Ok((record, inserted == 1))
    }

    fn transition(
        &self,
        guid: &str,
        expected: DispatchStatus,
        new: DispatchStatus,
    ) -> Result<bool, StoreError> {
        self.apply(guid, &[expected], Change::Status(new))
    }

    fn transition_any(
        &self,
        guid: &str,
        expected: &[DispatchStatus],
        new: DispatchStatus,
    ) -> Result<bool, StoreError> {
        self.apply(guid, expected, Change::Status(new))
    }

    fn begin_dispatch(&self, guid: &str, expected: DispatchStatus) -> Result<bool, StoreError> {
        self.apply(guid, &[expected], Change::BeginDispatch)
    }

    fn fail(
        &self,
        guid: &str,
        expected: DispatchStatus,
        failure: FailureKind,
        error: &str,
    ) -> Result<bool, StoreError> {
        self.apply(guid, &[expected], Change::Fail { failure, error })
    }

    fn sweep(&self, status: DispatchStatus, older_than: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT guid FROM dispatch_records
             WHERE status = ?1 AND last_updated_at <= ?2
             ORDER BY last_updated_at ASC",
        )?;

        let guids = stmt
            .query_map(params![status.as_str(), older_than.timestamp_millis()], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(guids)
    }

    fn list(&self, status: Option<DispatchStatus>, limit: usize) -> Result<Vec<DispatchRecord>, StoreError> {
        let conn = self.lock()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let records = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM dispatch_records WHERE status = ?1
                     ORDER BY last_updated_at DESC LIMIT ?2",
                    RECORD_COLUMNS
                ))?;
                let rows = stmt.query_map(params![status.as_str(), limit], row_to_record)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM dispatch_records ORDER BY last_updated_at DESC LIMIT ?1",
                    RECORD_COLUMNS
                ))?;
                let rows = stmt.query_map(params![limit], row_to_record)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };

        Ok(records)
    }

    fn counts(&self) -> Result<StatusCounts, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM dispatch_records GROUP BY status")?;

        let mut counts = StatusCounts::default();
        let rows = stmt.query_map([], |row| {
            let status = parse_status(&row.get::<_, String>(0)?, 0)?;
            let count: i64 = row.get(1)?;
            Ok((status, count))
        })?;

        for row in rows {
            let (status, count) = row?;
            *counts.slot(status) = usize::try_from(count).unwrap_or(0);
        }

        Ok(counts)
    }

    fn history(&self, guid: &str) -> Result<Vec<DispatchEvent>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT seq, guid, from_status, to_status, attempt_count, note, recorded_at
             FROM dispatch_events WHERE guid = ?1 ORDER BY seq ASC",
        )?;

        let events = stmt
            .query_map(params![guid], |row| {
                let from = row
                    .get::<_, Option<String>>(2)?
                    .map(|s| parse_status(&s, 2))
                    .transpose()?;
                Ok(DispatchEvent {
                    seq: row.get(0)?,
                    guid: row.get(1)?,
                    from,
                    to: parse_status(&row.get::<_, String>(3)?, 3)?,
                    attempt_count: row.get(4)?,
                    note: row.get(5)?,
                    recorded_at: millis_to_datetime(row.get(6)?, 6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(events)
    }

    fn reset_for_replay(&self, guid: &str) -> Result<bool, StoreError> {
        self.apply(guid, &[DispatchStatus::Failed], Change::Replay)
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<DispatchRecord> {
    let failure = row
        .get::<_, Option<String>>(7)?
        .map(|s| {
            s.parse::<FailureKind>()
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))
        })
        .transpose()?;

    Ok(DispatchRecord {
        guid: row.get(0)?,
        title: row.get(1)?,
        media_url: row.get(2)?,
        status: parse_status(&row.get::<_, String>(3)?, 3)?,
        attempt_count: row.get(4)?,
        first_seen_at: millis_to_datetime(row.get(5)?, 5)?,
        last_updated_at: millis_to_datetime(row.get(6)?, 6)?,
        failure,
        last_error: row.get(8)?,
        description: row.get(9)?,
        publish_date: row
            .get::<_, Option<i64>>(10)?
            .map(|millis| millis_to_datetime(millis, 10))
            .transpose()?,
    })
}

fn parse_status(value: &str, column: usize) -> rusqlite::Result<DispatchStatus> {
    value
        .parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

fn millis_to_datetime(millis: i64, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(column, millis))
}
