//! Schema migrations, applied in order and tracked in `migrations`.

use rusqlite::Connection;
use tracing::{debug, info};

use super::StoreResult;

pub const CURRENT_VERSION: i32 = 2;

pub fn run_migrations(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;

    if current_version >= CURRENT_VERSION {
        debug!(target: "store", current_version, "schema up to date");
        return Ok(());
    }
    info!(target: "store", current_version, target_version = CURRENT_VERSION, "running migrations");

    if current_version < 1 {
        migrate_v1_catalog(conn)?;
    }
    if current_version < 2 {
        migrate_v2_engine_meta(conn)?;
    }
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(target: "store", version, name, "migration applied");
    Ok(())
}

/// V1: catalog records and per-channel receipts.
fn migrate_v1_catalog(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS catalog_records (
            external_id     TEXT PRIMARY KEY NOT NULL,
            title           TEXT NOT NULL,
            author          TEXT NOT NULL,
            series          TEXT,
            series_sequence TEXT,
            narrators       TEXT NOT NULL DEFAULT '[]',
            publisher       TEXT,
            release_date    TEXT NOT NULL,
            summary         TEXT,
            link            TEXT,
            complete        INTEGER NOT NULL DEFAULT 0,
            first_seen      TEXT NOT NULL,
            last_seen       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_catalog_records_release_date
            ON catalog_records(release_date);

        CREATE TABLE IF NOT EXISTS notification_receipts (
            external_id     TEXT NOT NULL
                REFERENCES catalog_records(external_id) ON DELETE CASCADE,
            channel         TEXT NOT NULL,
            status          TEXT NOT NULL
                CHECK (status IN ('pending', 'delivered', 'failed_permanently')),
            attempt_count   INTEGER NOT NULL DEFAULT 0,
            last_attempt_at TEXT,
            last_error      TEXT,
            PRIMARY KEY (external_id, channel)
        );
        CREATE INDEX IF NOT EXISTS idx_notification_receipts_status
            ON notification_receipts(status);
        ",
    )?;
    record_migration(conn, 1, "catalog_records_and_receipts")
}

/// V2: small key/value table for vacuum and cycle bookkeeping.
fn migrate_v2_engine_meta(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS engine_meta (
            key   TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL
        );
        ",
    )?;
    record_migration(conn, 2, "engine_meta")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        let v: i32 = conn
            .query_row("SELECT MAX(version) FROM migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(v, CURRENT_VERSION);
    }
}
