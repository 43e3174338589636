//! Durable store for events awaiting delivery
//!
//! An embedded SQLite database holding one row per accepted event, keyed
//! by event id and ordered by insertion. Every mutation is its own
//! transaction. Lock conflicts (`SQLITE_BUSY`/`SQLITE_LOCKED`) are not
//! errors: the operation is retried a bounded number of times before
//! surfacing [`RelayError::StoreContention`].

use crate::core::{RelayError, RelayMetrics, Result};
use fs2::FileExt;
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Database file inside the data directory
pub const DATABASE_FILE: &str = "relay.db";

/// Lock file inside the data directory
pub const LOCK_FILE: &str = "relay.lock";

/// Default sleep between lock-conflict retries
pub const DEFAULT_LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Default time SQLite itself waits on a held lock before reporting busy
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS pending (
        seq   INTEGER PRIMARY KEY AUTOINCREMENT,
        key   BLOB NOT NULL UNIQUE,
        frame BLOB NOT NULL
    );
    CREATE TABLE IF NOT EXISTS quarantine (
        key            BLOB PRIMARY KEY,
        frame          BLOB NOT NULL,
        reason         TEXT NOT NULL,
        quarantined_at INTEGER NOT NULL
    );
";

/// Where the store keeps its data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// A directory holding the database and its lock file
    Directory(PathBuf),
    /// A private in-memory database; nothing survives the process
    InMemory,
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub location: StoreLocation,
    /// Attempts per operation before giving up on a lock conflict
    pub lock_timeout_retry_count: u32,
    pub lock_retry_interval: Duration,
    pub lock_timeout: Duration,
}

impl StoreOptions {
    pub fn new(location: StoreLocation) -> Self {
        Self {
            location,
            lock_timeout_retry_count: 5,
            lock_retry_interval: DEFAULT_LOCK_RETRY_INTERVAL,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(StoreLocation::InMemory)
    }

    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self::new(StoreLocation::Directory(path.into()))
    }
}

/// A persisted entry as returned by a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFrame {
    pub key: Vec<u8>,
    pub frame: Vec<u8>,
}

pub struct DurableStore {
    conn: Mutex<Option<Connection>>,
    lock_file: Mutex<Option<File>>,
    location: StoreLocation,
    retry_count: u32,
    retry_interval: Duration,
    metrics: Arc<RelayMetrics>,
}

impl DurableStore {
    /// Open (creating if needed) the store described by `options`
    ///
    /// A directory store takes an exclusive lock on its lock file for as
    /// long as it stays open.
    pub fn open(options: StoreOptions, metrics: Arc<RelayMetrics>) -> Result<Self> {
        if options.lock_timeout_retry_count == 0 {
            return Err(RelayError::config(
                "DurableStore",
                "lock_timeout_retry_count must be at least 1",
            ));
        }

        let (conn, lock_file) = match &options.location {
            StoreLocation::Directory(dir) => {
                fs::create_dir_all(dir)?;
                let lock_file = Self::lock_directory(dir)?;
                let conn = Connection::open(dir.join(DATABASE_FILE))?;
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                    row.get::<_, String>(0)
                })?;
                conn.pragma_update(None, "synchronous", "FULL")?;
                (conn, Some(lock_file))
            }
            StoreLocation::InMemory => (Connection::open_in_memory()?, None),
        };
        conn.busy_timeout(options.lock_timeout)?;
        conn.execute_batch(SCHEMA)?;

        tracing::debug!(location = ?options.location, "Durable store opened");

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            lock_file: Mutex::new(lock_file),
            location: options.location,
            retry_count: options.lock_timeout_retry_count,
            retry_interval: options.lock_retry_interval,
            metrics,
        })
    }

    fn lock_directory(dir: &Path) -> Result<File> {
        let path = dir.join(LOCK_FILE);
        let file = File::create(&path)?;
        file.try_lock_exclusive()
            .map_err(|_| RelayError::store_locked(dir.display().to_string()))?;
        Ok(file)
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    pub fn is_open(&self) -> bool {
        self.conn.lock().is_some()
    }

    /// Insert or replace the frame stored under `key`
    pub fn put(&self, key: &[u8], frame: &[u8]) -> Result<()> {
        self.with_retry("put", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT INTO pending (key, frame) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET frame = excluded.frame",
                params![key, frame],
            )?;
            tx.commit()
        })
    }

    /// Delete every key in one transaction, returning how many existed
    pub fn delete_batch(&self, keys: &[Vec<u8>]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.with_retry("delete_batch", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut deleted = 0;
            {
                let mut stmt = tx.prepare_cached("DELETE FROM pending WHERE key = ?1")?;
                for key in keys {
                    deleted += stmt.execute(params![key])?;
                }
            }
            tx.commit()?;
            Ok(deleted)
        })
    }

    pub fn count(&self) -> Result<u64> {
        self.with_retry("count", |conn| {
            conn.query_row("SELECT COUNT(*) FROM pending", [], |row| row.get::<_, i64>(0))
        })
        .map(|n| n.max(0) as u64)
    }

    /// Up to `limit` entries in insertion order, without mutating the store
    pub fn scan_oldest_first(&self, limit: usize) -> Result<Vec<StoredFrame>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_retry("scan", |conn| {
            let mut stmt =
                conn.prepare_cached("SELECT key, frame FROM pending ORDER BY seq LIMIT ?1")?;
            let rows = stmt.query_map(params![limit], |row| {
                Ok(StoredFrame {
                    key: row.get(0)?,
                    frame: row.get(1)?,
                })
            })?;
            let frames = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(frames)
        })
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        self.with_retry("contains", |conn| {
            conn.query_row(
                "SELECT 1 FROM pending WHERE key = ?1",
                params![key],
                |_| Ok(()),
            )
            .optional()
            .map(|row| row.is_some())
        })
    }

    /// Move unreadable entries aside in one transaction
    ///
    /// Quarantined frames leave the delivery queue but stay on disk.
    pub fn quarantine(&self, keys: &[Vec<u8>], reason: &str) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let now = chrono::Utc::now().timestamp_millis();
        let moved = self.with_retry("quarantine", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut moved = 0;
            {
                let mut copy = tx.prepare_cached(
                    "INSERT OR REPLACE INTO quarantine (key, frame, reason, quarantined_at)
                     SELECT key, frame, ?2, ?3 FROM pending WHERE key = ?1",
                )?;
                let mut delete = tx.prepare_cached("DELETE FROM pending WHERE key = ?1")?;
                for key in keys {
                    copy.execute(params![key, reason, now])?;
                    moved += delete.execute(params![key])?;
                }
            }
            tx.commit()?;
            Ok(moved)
        })?;
        self.metrics.record_quarantined(moved);
        Ok(moved)
    }

    pub fn quarantined_count(&self) -> Result<u64> {
        self.with_retry("quarantined_count", |conn| {
            conn.query_row("SELECT COUNT(*) FROM quarantine", [], |row| row.get::<_, i64>(0))
        })
        .map(|n| n.max(0) as u64)
    }

    /// Close the database and release the directory lock
    ///
    /// Both are attempted even if the first fails. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut first_error = None;

        if let Some(conn) = self.conn.lock().take() {
            if let Err((_conn, e)) = conn.close() {
                tracing::warn!(error = %e, "Failed to close durable store database");
                first_error = Some(RelayError::from(e));
            }
        }
        if let Some(file) = self.lock_file.lock().take() {
            if let Err(e) = FileExt::unlock(&file) {
                tracing::warn!(error = %e, "Failed to release data directory lock");
                first_error.get_or_insert(RelayError::from(e));
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn with_retry<T, F>(&self, op: &'static str, mut f: F) -> Result<T>
    where
        F: FnMut(&mut Connection) -> rusqlite::Result<T>,
    {
        for attempt in 1..=self.retry_count {
            let result = {
                let mut guard = self.conn.lock();
                let conn = guard.as_mut().ok_or(RelayError::StoreClosed)?;
                f(conn)
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if is_lock_conflict(&e) => {
                    self.metrics.record_contention_retry();
                    tracing::trace!(op, attempt, "Lock conflict in durable store, retrying");
                    if attempt < self.retry_count {
                        thread::sleep(self.retry_interval);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(RelayError::contention(self.retry_count))
    }
}

impl Drop for DurableStore {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn is_lock_conflict(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}
