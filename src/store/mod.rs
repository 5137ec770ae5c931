//! State Store: the single durable owner of catalog records and receipts.
//!
//! Backed by one SQLite file in WAL mode behind an r2d2 pool. Readers use any
//! pooled connection concurrently; writers serialize per external identifier
//! through [`locks::KeyLocks`] and run inside `IMMEDIATE` transactions, so a
//! write lands completely or not at all. `VACUUM` takes the maintenance lock
//! exclusively: writers wait, readers keep reading their WAL snapshot.
//!
//! Lock order for writers: maintenance, then the key lock, then a pooled
//! connection. A connection is never held while waiting for a key lock.
//!
//! Every method blocks. Async callers go through [`StateStore::call`].

mod locks;
pub mod migrations;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{CatalogRecord, NotificationReceipt, ReceiptStatus, ReleaseDetails};
use locks::KeyLocks;

const META_LAST_VACUUM: &str = "last_vacuum_at";
const META_LAST_CYCLE: &str = "last_successful_cycle_at";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("blocking store task failed: {0}")]
    Task(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// What `delete_expired` needs to know to keep undelivered records around.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptGuard {
    pub required_channels: Vec<String>,
    pub max_attempts: u32,
}

impl ReceiptGuard {
    /// True when some required channel still owes a delivery attempt.
    pub fn blocks(&self, receipts: &BTreeMap<String, NotificationReceipt>) -> bool {
        self.required_channels
            .iter()
            .any(|channel| match receipts.get(channel) {
                None => true,
                Some(r) => r.is_retryable(self.max_attempts),
            })
    }
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub pool_size: u32,
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            pool_size: 4,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

pub struct StateStore {
    pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
    locks: KeyLocks,
    maintenance: parking_lot::RwLock<()>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").field("path", &self.path).finish()
    }
}

impl StateStore {
    /// Opens (creating if needed) the store at `path` and applies migrations.
    pub fn open(path: &Path, options: StoreOptions) -> StoreResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let busy_ms = options.busy_timeout.as_millis();
        let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
            conn.execute_batch(&format!(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA foreign_keys = ON;
                PRAGMA busy_timeout = {busy_ms};
                "
            ))
        });

        let pool = Pool::builder()
            .max_size(options.pool_size.max(1))
            .build(manager)
            .map_err(|e| StoreError::Pool(e.to_string()))?;

        {
            let conn = pool.get().map_err(|e| StoreError::Pool(e.to_string()))?;
            migrations::run_migrations(&conn)?;
        }

        info!(target: "store", path = %path.display(), pool_size = options.pool_size, "state store opened");
        Ok(Self {
            pool,
            path: path.to_path_buf(),
            locks: KeyLocks::default(),
            maintenance: parking_lot::RwLock::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> StoreResult<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| StoreError::Pool(e.to_string()))
    }

    /// Runs `f` against the store on tokio's blocking pool.
    pub async fn call<T, F>(self: &Arc<Self>, f: F) -> StoreResult<T>
    where
        F: FnOnce(&StateStore) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Writes content fields and inserts receipts the store does not have yet.
    /// Existing receipts are never touched here. Returns `true` on first insert.
    pub fn upsert(&self, record: &CatalogRecord) -> StoreResult<bool> {
        let _maintenance = self.maintenance.read();
        let key = self.locks.handle(&record.external_id);
        let _guard = key.lock();

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existed: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM catalog_records WHERE external_id = ?1)",
            params![record.external_id],
            |row| row.get(0),
        )?;

        let d = &record.details;
        tx.execute(
            "INSERT INTO catalog_records (
                external_id, title, author, series, series_sequence, narrators,
                publisher, release_date, summary, link, complete, first_seen, last_seen
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(external_id) DO UPDATE SET
                title = excluded.title,
                author = excluded.author,
                series = excluded.series,
                series_sequence = excluded.series_sequence,
                narrators = excluded.narrators,
                publisher = excluded.publisher,
                release_date = excluded.release_date,
                summary = excluded.summary,
                link = excluded.link,
                complete = excluded.complete,
                last_seen = excluded.last_seen",
            params![
                record.external_id,
                d.title,
                d.author,
                d.series,
                d.series_sequence,
                serde_json::to_string(&d.narrators)?,
                d.publisher,
                d.release_date.to_string(),
                d.summary,
                record.link,
                record.complete,
                record.first_seen.to_rfc3339(),
                record.last_seen.to_rfc3339(),
            ],
        )?;

        for receipt in record.receipts.values() {
            tx.execute(
                "INSERT OR IGNORE INTO notification_receipts
                    (external_id, channel, status, attempt_count, last_attempt_at, last_error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.external_id,
                    receipt.channel,
                    receipt.status.as_str(),
                    receipt.attempt_count,
                    receipt.last_attempt_at.map(|t| t.to_rfc3339()),
                    receipt.last_error,
                ],
            )?;
        }

        tx.commit()?;
        debug!(target: "store", id = %record.external_id, new = !existed, "record upserted");
        Ok(!existed)
    }

    pub fn get(&self, external_id: &str) -> StoreResult<Option<CatalogRecord>> {
        let conn = self.conn()?;
        let row = conn
            .prepare_cached(&format!(
                "SELECT {RECORD_COLUMNS} FROM catalog_records WHERE external_id = ?1"
            ))?
            .query_row(params![external_id], RecordRow::from_row)
            .optional()?;
        match row {
            Some(row) => {
                let receipts = load_receipts(&conn, external_id)?;
                Ok(Some(row.into_record(receipts)?))
            }
            None => Ok(None),
        }
    }

    /// Fetches every identifier that exists; missing ones are simply absent.
    pub fn get_many(&self, ids: &[String]) -> StoreResult<Vec<CatalogRecord>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(rec) = self.get(id)? {
                out.push(rec);
            }
        }
        Ok(out)
    }

    /// Records owing a delivery on any of `channels`: a pending receipt with
    /// budget left, or no receipt at all. Ordered by release date, then title.
    pub fn list_pending_notification(
        &self,
        channels: &[String],
        max_attempts: u32,
    ) -> StoreResult<Vec<CatalogRecord>> {
        let channels = serde_json::to_string(channels)?;
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM catalog_records r
                 WHERE EXISTS (
                    SELECT 1 FROM json_each(?1) ch
                    LEFT JOIN notification_receipts n
                        ON n.external_id = r.external_id AND n.channel = ch.value
                    WHERE n.status IS NULL
                       OR (n.status = 'pending' AND n.attempt_count < ?2)
                 )
                 ORDER BY release_date, title, external_id"
            ),
            &[&channels, &max_attempts],
        )
    }

    /// Records releasing on or after `from`, soonest first.
    pub fn list_upcoming(&self, from: NaiveDate, limit: Option<usize>) -> StoreResult<Vec<CatalogRecord>> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM catalog_records
                 WHERE release_date >= ?1
                 ORDER BY release_date, title, external_id
                 LIMIT ?2"
            ),
            &[&from.to_string(), &limit],
        )
    }

    pub fn count(&self) -> StoreResult<usize> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM catalog_records", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    /// Counts one delivery attempt. Terminal receipts are left as they are
    /// (only [`StateStore::reopen_receipt`] moves them back to pending).
    /// Returns the receipt as persisted afterwards.
    pub fn record_receipt(
        &self,
        external_id: &str,
        channel: &str,
        status: ReceiptStatus,
        error: Option<&str>,
    ) -> StoreResult<NotificationReceipt> {
        let _maintenance = self.maintenance.read();
        let key = self.locks.handle(external_id);
        let _guard = key.lock();

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "INSERT INTO notification_receipts
                (external_id, channel, status, attempt_count, last_attempt_at, last_error)
             VALUES (?1, ?2, ?3, 1, ?4, ?5)
             ON CONFLICT(external_id, channel) DO UPDATE SET
                status = excluded.status,
                attempt_count = notification_receipts.attempt_count + 1,
                last_attempt_at = excluded.last_attempt_at,
                last_error = excluded.last_error
             WHERE notification_receipts.status = 'pending'",
            params![external_id, channel, status.as_str(), Utc::now().to_rfc3339(), error],
        )?;
        let receipt = load_receipt(&tx, external_id, channel)?.ok_or_else(|| {
            StoreError::InvalidData(format!("receipt {external_id}/{channel} missing after write"))
        })?;
        tx.commit()?;

        if changed == 0 {
            debug!(target: "store", id = %external_id, channel, status = %receipt.status, "terminal receipt left untouched");
        }
        Ok(receipt)
    }

    /// Moves a receipt back to `pending` with a fresh retry budget.
    pub fn reopen_receipt(&self, external_id: &str, channel: &str) -> StoreResult<()> {
        let _maintenance = self.maintenance.read();
        let key = self.locks.handle(external_id);
        let _guard = key.lock();

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO notification_receipts (external_id, channel, status, attempt_count)
             VALUES (?1, ?2, 'pending', 0)
             ON CONFLICT(external_id, channel) DO UPDATE SET
                status = 'pending',
                attempt_count = 0,
                last_error = NULL",
            params![external_id, channel],
        )?;
        Ok(())
    }

    /// Bumps `last_seen` for records sighted again without changes.
    pub fn touch_seen(&self, ids: &[String], seen_at: DateTime<Utc>) -> StoreResult<usize> {
        let _maintenance = self.maintenance.read();
        let mut touched = 0;
        for id in ids {
            let key = self.locks.handle(id);
            let _guard = key.lock();
            let conn = self.conn()?;
            touched += conn.execute(
                "UPDATE catalog_records SET last_seen = ?2 WHERE external_id = ?1",
                params![id, seen_at.to_rfc3339()],
            )?;
        }
        Ok(touched)
    }

    /// Deletes records with `as_of >= release_date + grace_period_days`,
    /// except those a required channel still owes a delivery attempt.
    pub fn delete_expired(
        &self,
        as_of: NaiveDate,
        grace_period_days: u32,
        guard: &ReceiptGuard,
    ) -> StoreResult<usize> {
        let Some(cutoff) = as_of.checked_sub_days(chrono::Days::new(u64::from(grace_period_days))) else {
            return Ok(0);
        };

        let _maintenance = self.maintenance.read();

        let candidates: Vec<String> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare_cached(
                "SELECT external_id FROM catalog_records WHERE release_date <= ?1 ORDER BY release_date",
            )?;
            let rows = stmt.query_map(params![cutoff.to_string()], |r| r.get::<_, String>(0))?;
            rows.collect::<Result<_, _>>()?
        };

        let mut deleted = 0usize;
        for id in candidates {
            let key = self.locks.handle(&id);
            let _guard = key.lock();
            let mut conn = self.conn()?;

            // Re-check under the key lock; a dispatcher may have reopened a receipt meanwhile.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let receipts = load_receipts(&tx, &id)?;
            if guard.blocks(&receipts) {
                debug!(target: "store", id = %id, "expired record kept: delivery still owed");
                continue;
            }
            deleted += tx.execute(
                "DELETE FROM catalog_records WHERE external_id = ?1 AND release_date <= ?2",
                params![id, cutoff.to_string()],
            )?;
            tx.commit()?;
        }

        if deleted > 0 {
            info!(target: "store", deleted, %cutoff, "expired records deleted");
        }
        Ok(deleted)
    }

    /// Rebuilds the database file to reclaim space and truncates the WAL.
    pub fn vacuum(&self) -> StoreResult<()> {
        let _maintenance = self.maintenance.write();
        let conn = self.conn()?;
        let started = std::time::Instant::now();
        conn.execute_batch("VACUUM")?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        info!(target: "store", elapsed_ms = started.elapsed().as_millis() as u64, "vacuum complete");
        Ok(())
    }

    pub fn last_vacuum(&self) -> StoreResult<Option<DateTime<Utc>>> {
        self.meta_timestamp(META_LAST_VACUUM)
    }

    pub fn set_last_vacuum(&self, at: DateTime<Utc>) -> StoreResult<()> {
        self.set_meta(META_LAST_VACUUM, &at.to_rfc3339())
    }

    pub fn last_successful_cycle(&self) -> StoreResult<Option<DateTime<Utc>>> {
        self.meta_timestamp(META_LAST_CYCLE)
    }

    pub fn set_last_successful_cycle(&self, at: DateTime<Utc>) -> StoreResult<()> {
        self.set_meta(META_LAST_CYCLE, &at.to_rfc3339())
    }

    fn meta_timestamp(&self, key: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row("SELECT value FROM engine_meta WHERE key = ?1", params![key], |r| r.get(0))
            .optional()?;
        raw.map(|s| parse_timestamp(&s)).transpose()
    }

    fn set_meta(&self, key: &str, value: &str) -> StoreResult<()> {
        let _maintenance = self.maintenance.read();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO engine_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn query_records(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> StoreResult<Vec<CatalogRecord>> {
        let conn = self.conn()?;
        let rows: Vec<RecordRow> = {
            let mut stmt = conn.prepare_cached(sql)?;
            let mapped = stmt.query_map(args, RecordRow::from_row)?;
            mapped.collect::<Result<_, _>>()?
        };
        rows.into_iter()
            .map(|row| {
                let receipts = load_receipts(&conn, &row.external_id)?;
                row.into_record(receipts)
            })
            .collect()
    }
}

const RECORD_COLUMNS: &str = "external_id, title, author, series, series_sequence, narrators, \
     publisher, release_date, summary, link, complete, first_seen, last_seen";

/// Raw column values; conversion to the model happens outside rusqlite's closure.
struct RecordRow {
    external_id: String,
    title: String,
    author: String,
    series: Option<String>,
    series_sequence: Option<String>,
    narrators: String,
    publisher: Option<String>,
    release_date: String,
    summary: Option<String>,
    link: Option<String>,
    complete: bool,
    first_seen: String,
    last_seen: String,
}

impl RecordRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            external_id: row.get(0)?,
            title: row.get(1)?,
            author: row.get(2)?,
            series: row.get(3)?,
            series_sequence: row.get(4)?,
            narrators: row.get(5)?,
            publisher: row.get(6)?,
            release_date: row.get(7)?,
            summary: row.get(8)?,
            link: row.get(9)?,
            complete: row.get(10)?,
            first_seen: row.get(11)?,
            last_seen: row.get(12)?,
        })
    }

    fn into_record(self, receipts: BTreeMap<String, NotificationReceipt>) -> StoreResult<CatalogRecord> {
        let release_date = NaiveDate::parse_from_str(&self.release_date, "%Y-%m-%d").map_err(|e| {
            StoreError::InvalidData(format!("release_date '{}' for {}: {e}", self.release_date, self.external_id))
        })?;
        Ok(CatalogRecord {
            details: ReleaseDetails {
                title: self.title,
                author: self.author,
                series: self.series,
                series_sequence: self.series_sequence,
                narrators: serde_json::from_str(&self.narrators)?,
                publisher: self.publisher,
                release_date,
                summary: self.summary,
            },
            link: self.link,
            complete: self.complete,
            receipts,
            first_seen: parse_timestamp(&self.first_seen)?,
            last_seen: parse_timestamp(&self.last_seen)?,
            external_id: self.external_id,
        })
    }
}

fn receipt_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, u32, Option<String>, Option<String>)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn build_receipt(
    (channel, status, attempt_count, last_attempt_at, last_error): (String, String, u32, Option<String>, Option<String>),
) -> StoreResult<NotificationReceipt> {
    Ok(NotificationReceipt {
        status: status.parse().map_err(StoreError::InvalidData)?,
        attempt_count,
        last_attempt_at: last_attempt_at.as_deref().map(parse_timestamp).transpose()?,
        last_error,
        channel,
    })
}

fn load_receipts(conn: &Connection, external_id: &str) -> StoreResult<BTreeMap<String, NotificationReceipt>> {
    let mut stmt = conn.prepare_cached(
        "SELECT channel, status, attempt_count, last_attempt_at, last_error
         FROM notification_receipts WHERE external_id = ?1",
    )?;
    let rows: Vec<_> = stmt
        .query_map(params![external_id], receipt_from_row)?
        .collect::<Result<_, _>>()?;
    rows.into_iter()
        .map(|raw| build_receipt(raw).map(|r| (r.channel.clone(), r)))
        .collect()
}

fn load_receipt(conn: &Connection, external_id: &str, channel: &str) -> StoreResult<Option<NotificationReceipt>> {
    let raw = conn
        .prepare_cached(
            "SELECT channel, status, attempt_count, last_attempt_at, last_error
             FROM notification_receipts WHERE external_id = ?1 AND channel = ?2",
        )?
        .query_row(params![external_id, channel], receipt_from_row)
        .optional()?;
    raw.map(build_receipt).transpose()
}

fn parse_timestamp(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidData(format!("timestamp '{s}': {e}")))
}
