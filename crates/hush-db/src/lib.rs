pub mod error;
pub mod escalation;
pub mod migrations;
pub mod models;
pub mod queries;
pub mod unmasking;

pub use error::ProtocolError;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{Connection, ErrorCode, OpenFlags, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{info, warn};

const READER_POOL_SIZE: usize = 4;

/// How long a connection waits on SQLite's lock before reporting BUSY.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Linear backoff step between transaction retries.
const RETRY_BACKOFF: Duration = Duration::from_millis(25);

/// Tunables of the escalation and unmasking protocols.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// How long after a declined unmasking either participant may ask again.
    /// `None` means never.
    pub unmask_retry_after: Option<chrono::Duration>,
    /// Extra attempts for a transaction that hit a write conflict.
    pub busy_retries: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            unmask_retry_after: None,
            busy_retries: 5,
        }
    }
}

/// The relationship store: one writer connection for every protocol
/// transaction plus a small pool of read-only connections for queries.
pub struct Database {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    reader_idx: AtomicUsize,
    config: ProtocolConfig,
}

impl Database {
    pub fn open(path: &Path, config: ProtocolConfig) -> Result<Self> {
        let writer = Connection::open(path)?;

        // WAL mode for concurrent reads
        writer.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        writer.pragma_update(None, "foreign_keys", "ON")?;
        writer.busy_timeout(BUSY_TIMEOUT)?;

        migrations::run(&writer)?;

        let mut readers = Vec::with_capacity(READER_POOL_SIZE);
        for _ in 0..READER_POOL_SIZE {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            readers.push(Mutex::new(conn));
        }

        info!(
            "Database opened at {} (1 writer + {} readers)",
            path.display(),
            READER_POOL_SIZE
        );
        Ok(Self {
            writer: Mutex::new(writer),
            readers,
            reader_idx: AtomicUsize::new(0),
            config,
        })
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Run a read-only query on one of the reader connections.
    pub fn with_conn<F, T, E>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Connection) -> std::result::Result<T, E>,
        E: From<anyhow::Error>,
    {
        let idx = self.reader_idx.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let conn = self.readers[idx]
            .lock()
            .map_err(|e| anyhow::anyhow!("Reader lock poisoned: {}", e))?;
        f(&conn)
    }

    /// Run `f` inside one `BEGIN IMMEDIATE` transaction.
    ///
    /// The write lock is taken before `f` performs its first read, so every
    /// read-check-write sequence is serialised against other writers, in this
    /// process or any other one sharing the file. Commits on `Ok`, rolls back
    /// on `Err`. A BUSY/LOCKED failure re-runs `f` from scratch, so `f` must
    /// derive everything it writes from what it reads inside the transaction.
    pub fn with_tx<F, T>(&self, mut f: F) -> std::result::Result<T, ProtocolError>
    where
        F: FnMut(&Transaction<'_>) -> std::result::Result<T, ProtocolError>,
    {
        let mut conn = self
            .writer
            .lock()
            .map_err(|e| anyhow::anyhow!("Writer lock poisoned: {}", e))?;

        let mut attempt = 0;
        loop {
            match run_transaction(&mut conn, &mut f) {
                Err(ProtocolError::Storage(ref e))
                    if is_write_conflict(e) && attempt < self.config.busy_retries =>
                {
                    attempt += 1;
                    warn!("Write conflict ({}), retrying transaction (attempt {})", e, attempt);
                    std::thread::sleep(RETRY_BACKOFF * attempt);
                }
                other => return other,
            }
        }
    }
}

fn run_transaction<F, T>(conn: &mut Connection, f: &mut F) -> std::result::Result<T, ProtocolError>
where
    F: FnMut(&Transaction<'_>) -> std::result::Result<T, ProtocolError>,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

fn is_write_conflict(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Current time truncated to the millisecond precision we store.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Fixed-width RFC 3339 (`YYYY-MM-DDTHH:MM:SS.mmmZ`): lexical order is
/// chronological order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    pub fn open_db() -> (Database, TempDir) {
        open_db_with(ProtocolConfig::default())
    }

    pub fn open_db_with(config: ProtocolConfig) -> (Database, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("hush.db"), config).unwrap();
        (db, dir)
    }

    /// Register a user and return its id.
    pub fn user(db: &Database, username: &str) -> String {
        let id = Uuid::new_v4().to_string();
        db.create_user(&id, username, "not-a-real-hash").unwrap();
        id
    }
}
