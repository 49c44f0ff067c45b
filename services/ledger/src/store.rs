//! Shared datastore for packing events, code detections and segment log
//! bookkeeping.
//!
//! All access goes through [`Datastore::with_read`] and
//! [`Datastore::with_write`]. The write path takes an exclusive gate with a
//! bounded retry budget; both paths release their guards on every exit,
//! including errors and panics.

use crate::config::DatabaseConfig;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use chrono::Utc;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Schema version stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA_SQL: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS events (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    camera_name        TEXT    NOT NULL,
    ts                 REAL    NOT NULL,
    te                 REAL,
    duration           REAL,
    tracking_codes     TEXT    NOT NULL DEFAULT '[]',
    video_file         TEXT    NOT NULL,
    packing_time_start INTEGER NOT NULL,  -- UTC ms
    packing_time_end   INTEGER,           -- UTC ms
    timezone           TEXT    NOT NULL,
    retry_needed       INTEGER NOT NULL DEFAULT 0,
    retry_count        INTEGER NOT NULL DEFAULT 0,
    status             TEXT    NOT NULL,
    ts_inferred        INTEGER NOT NULL DEFAULT 0,
    log_file           TEXT    NOT NULL,
    created_at         INTEGER NOT NULL,
    updated_at         INTEGER NOT NULL
);

-- At most one open event per camera.
CREATE UNIQUE INDEX IF NOT EXISTS idx_events_pending
    ON events (camera_name) WHERE te IS NULL;

CREATE INDEX IF NOT EXISTS idx_events_camera_start
    ON events (camera_name, packing_time_start);

CREATE TABLE IF NOT EXISTS code_detections (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id INTEGER NOT NULL REFERENCES events (id) ON DELETE CASCADE,
    ts       REAL    NOT NULL,
    code     TEXT    NOT NULL,
    bbox     TEXT    NOT NULL,
    success  INTEGER NOT NULL,
    UNIQUE (event_id, ts, code, success)
);

CREATE TABLE IF NOT EXISTS processed_logs (
    log_file      TEXT PRIMARY KEY,
    camera_name   TEXT    NOT NULL,
    sealed        INTEGER NOT NULL DEFAULT 0,
    processed     INTEGER NOT NULL DEFAULT 0,
    processed_at  INTEGER,
    failed_reason TEXT,
    registered_at INTEGER NOT NULL
);
"#;

/// Errors raised by the datastore.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to create database directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Exclusive datastore lock not acquired after {attempts} attempts ({waited_ms} ms)")]
    LockTimeout { attempts: u32, waited_ms: u128 },

    #[error("Invalid stored value: {0}")]
    InvalidValue(String),
}

/// SQLite-backed datastore with scoped read/write access.
///
/// The connection itself sits behind a mutex; the read/write gate gives batch
/// writers exclusivity over concurrent readers. Closures passed to
/// `with_read`/`with_write` must not call back into the same datastore.
pub struct Datastore {
    conn: Mutex<Connection>,
    gate: RwLock<()>,
    lock_slice: Duration,
    lock_budget: Duration,
}

impl Datastore {
    /// Open (or create) the datastore at the configured path.
    pub fn open(config: &DatabaseConfig) -> Result<Self, StoreError> {
        if let Some(parent) = Path::new(&config.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&config.path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.busy_timeout(config.lock_slice())?;
        Self::init(&conn)?;

        info!(path = %config.path, "Opened packing event datastore");

        Ok(Self {
            conn: Mutex::new(conn),
            gate: RwLock::new(()),
            lock_slice: config.lock_slice(),
            lock_budget: config.lock_budget(),
        })
    }

    /// Open a private in-memory datastore.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        let defaults = DatabaseConfig::default();

        Ok(Self {
            conn: Mutex::new(conn),
            gate: RwLock::new(()),
            lock_slice: defaults.lock_slice(),
            lock_budget: defaults.lock_budget(),
        })
    }

    /// Override the exclusive lock timing.
    pub fn with_lock_timing(mut self, slice: Duration, budget: Duration) -> Self {
        self.lock_slice = slice;
        self.lock_budget = budget;
        self
    }

    fn init(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(SCHEMA_SQL)?;
        let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if version < SCHEMA_VERSION {
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            debug!(from = version, to = SCHEMA_VERSION, "Datastore schema initialized");
        }
        Ok(())
    }

    /// Run `f` under the shared (read) lock.
    pub fn with_read<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<StoreError>,
    {
        let _shared = self.gate.read();
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` under the exclusive (write) lock.
    ///
    /// Fails with [`StoreError::LockTimeout`] if the lock cannot be taken
    /// within the retry budget.
    pub fn with_write<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Connection) -> Result<T, E>,
        E: From<StoreError>,
    {
        let _exclusive = self.acquire_exclusive()?;
        let mut conn = self.conn.lock();
        f(&mut conn)
    }

    fn acquire_exclusive(&self) -> Result<RwLockWriteGuard<'_, ()>, StoreError> {
        let started = Instant::now();
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.lock_slice)
            .with_max_interval(self.lock_slice * 8)
            .with_max_elapsed_time(Some(self.lock_budget))
            .build();
        let mut attempts = 0u32;

        loop {
            if let Some(guard) = self.gate.try_write_for(self.lock_slice) {
                if attempts > 0 {
                    debug!(attempts = attempts, "Acquired exclusive datastore lock");
                }
                return Ok(guard);
            }
            attempts += 1;

            match backoff.next_backoff() {
                Some(delay) => {
                    warn!(
                        attempt = attempts,
                        delay_ms = delay.as_millis(),
                        "Datastore busy, retrying exclusive lock"
                    );
                    std::thread::sleep(delay);
                }
                None => {
                    return Err(StoreError::LockTimeout {
                        attempts,
                        waited_ms: started.elapsed().as_millis(),
                    });
                }
            }
        }
    }
}

/// Current wall-clock time in UTC milliseconds.
pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Bookkeeping row for one segment log file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedLog {
    pub log_file: String,
    pub camera_name: String,
    pub sealed: bool,
    pub processed: bool,
    pub processed_at: Option<i64>,
    pub failed_reason: Option<String>,
    pub registered_at: i64,
}

/// Access to the `processed_logs` table, the exactly-once gate for segment
/// logs.
pub struct LogRepository<'c> {
    conn: &'c Connection,
}

impl<'c> LogRepository<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Register a log file as unprocessed. Returns false if it was already
    /// known.
    pub fn register(&self, log_file: &str, camera_name: &str, sealed: bool) -> Result<bool, StoreError> {
        let inserted = self.conn.execute(
            r#"
            INSERT OR IGNORE INTO processed_logs (log_file, camera_name, sealed, processed, registered_at)
            VALUES (?1, ?2, ?3, 0, ?4)
            "#,
            params![log_file, camera_name, sealed, now_ms()],
        )?;
        Ok(inserted > 0)
    }

    /// Mark a log as completely written.
    pub fn mark_sealed(&self, log_file: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE processed_logs SET sealed = 1 WHERE log_file = ?1",
            params![log_file],
        )?;
        Ok(())
    }

    pub fn mark_processed(&self, log_file: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE processed_logs SET processed = 1, processed_at = ?2 WHERE log_file = ?1",
            params![log_file, now_ms()],
        )?;
        Ok(())
    }

    /// Record why a log could not be ingested. Failed logs are not retried.
    pub fn mark_failed(&self, log_file: &str, reason: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE processed_logs SET failed_reason = ?2 WHERE log_file = ?1",
            params![log_file, reason],
        )?;
        Ok(())
    }

    pub fn get(&self, log_file: &str) -> Result<Option<ProcessedLog>, StoreError> {
        let log = self
            .conn
            .query_row(
                r#"
                SELECT log_file, camera_name, sealed, processed, processed_at, failed_reason, registered_at
                FROM processed_logs WHERE log_file = ?1
                "#,
                params![log_file],
                log_from_row,
            )
            .optional()?;
        Ok(log)
    }

    /// Sealed logs that are neither processed nor failed.
    pub fn pending(&self) -> Result<Vec<ProcessedLog>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT log_file, camera_name, sealed, processed, processed_at, failed_reason, registered_at
            FROM processed_logs
            WHERE sealed = 1 AND processed = 0 AND failed_reason IS NULL
            ORDER BY registered_at, log_file
            "#,
        )?;
        let logs = stmt
            .query_map([], log_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(logs)
    }

    pub fn count_processed(&self) -> Result<i64, StoreError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM processed_logs WHERE processed = 1", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn log_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProcessedLog> {
    Ok(ProcessedLog {
        log_file: row.get(0)?,
        camera_name: row.get(1)?,
        sealed: row.get(2)?,
        processed: row.get(3)?,
        processed_at: row.get(4)?,
        failed_reason: row.get(5)?,
        registered_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_register_is_idempotent() {
        let store = Datastore::open_in_memory().unwrap();
        store
            .with_write(|conn| {
                let logs = LogRepository::new(conn);
                assert!(logs.register("a.log", "cam-01", false)?);
                assert!(!logs.register("a.log", "cam-01", true)?);
                Ok::<_, StoreError>(())
            })
            .unwrap();

        let log = store
            .with_read(|conn| LogRepository::new(conn).get("a.log"))
            .unwrap()
            .unwrap();
        assert!(!log.sealed);
        assert!(!log.processed);
    }

    #[test]
    fn test_pending_only_returns_sealed_unprocessed_logs() {
        let store = Datastore::open_in_memory().unwrap();
        store
            .with_write(|conn| {
                let logs = LogRepository::new(conn);
                logs.register("open.log", "cam-01", false)?;
                logs.register("done.log", "cam-01", true)?;
                logs.register("bad.log", "cam-01", true)?;
                logs.register("todo.log", "cam-01", true)?;
                logs.mark_processed("done.log")?;
                logs.mark_failed("bad.log", "corrupt header")?;
                Ok::<_, StoreError>(())
            })
            .unwrap();

        let pending = store
            .with_read(|conn| LogRepository::new(conn).pending())
            .unwrap();
        let names: Vec<_> = pending.iter().map(|l| l.log_file.as_str()).collect();
        assert_eq!(names, vec!["todo.log"]);
    }

    #[test]
    fn test_write_lock_times_out_while_reader_holds_gate() {
        let store = Datastore::open_in_memory()
            .unwrap()
            .with_lock_timing(Duration::from_millis(5), Duration::from_millis(40));

        let _reader = store.gate.read();
        let result = store.with_write(|_conn| Ok::<_, StoreError>(()));
        assert!(matches!(result, Err(StoreError::LockTimeout { .. })));
    }

    #[test]
    fn test_lock_released_after_error() {
        let store = Datastore::open_in_memory()
            .unwrap()
            .with_lock_timing(Duration::from_millis(5), Duration::from_millis(40));

        let failed: Result<(), StoreError> =
            store.with_write(|_conn| Err(StoreError::InvalidValue("boom".to_string())));
        assert!(failed.is_err());

        let ok = store.with_write(|_conn| Ok::<_, StoreError>(42));
        assert_eq!(ok.unwrap(), 42);
    }
}
