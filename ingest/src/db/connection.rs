// src/db/connection.rs
//! Opening SQLite with lock-aware retries and per-session pragmas.

use std::{path::{Path, PathBuf}, time::Duration};
use rusqlite::{Connection, ErrorCode};
use thiserror::Error;

use crate::config::DatabaseConfig;
use crate::db::backoff::{Backoff, RetryError};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("database still locked after {attempts} connection attempts")]
    Locked { attempts: u32, #[source] source: rusqlite::Error },

    #[error("cannot open database: {0}")]
    Open(#[from] rusqlite::Error),
}

/// `true` for SQLITE_BUSY / SQLITE_LOCKED, the only errors worth waiting out.
pub fn is_locked(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Pragmas applied once to every connection the provider hands out.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub busy_timeout:       Duration,
    pub synchronous:        String,
    pub cache_size:         i64,
    pub temp_store:         String,
    pub journal_size_limit: i64,
}

impl From<&DatabaseConfig> for SessionConfig {
    fn from(cfg: &DatabaseConfig) -> Self {
        Self {
            busy_timeout:       Duration::from_millis(cfg.busy_timeout_ms),
            synchronous:        cfg.synchronous.clone(),
            cache_size:         cfg.cache_size,
            temp_store:         cfg.temp_store.clone(),
            journal_size_limit: cfg.journal_size_limit.min(i64::MAX as u64) as i64,
        }
    }
}

impl SessionConfig {
    /// WAL journaling, relaxed fsync, large page cache, in-memory temp tables.
    pub fn apply(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.busy_timeout(self.busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            log::debug!("journal_mode stayed '{}' (in-memory database?)", mode);
        }
        conn.pragma_update(None, "synchronous", self.synchronous.as_str())?;
        conn.pragma_update(None, "cache_size", self.cache_size)?;
        let _locking: String =
            conn.pragma_update_and_check(None, "locking_mode", "NORMAL", |row| row.get(0))?;
        conn.pragma_update(None, "temp_store", self.temp_store.as_str())?;
        let _limit: i64 = conn.pragma_update_and_check(
            None,
            "journal_size_limit",
            self.journal_size_limit,
            |row| row.get(0),
        )?;
        Ok(())
    }
}

/// Hands out configured connections to one database file.
#[derive(Debug, Clone)]
pub struct ConnectionProvider {
    path:    PathBuf,
    session: SessionConfig,
    backoff: Backoff,
}

impl ConnectionProvider {
    pub fn new(path: impl Into<PathBuf>, session: SessionConfig, backoff: Backoff) -> Self {
        Self { path: path.into(), session, backoff }
    }

    pub fn from_config(cfg: &DatabaseConfig) -> Self {
        Self::new(&cfg.path, SessionConfig::from(cfg), Backoff::from(&cfg.connect_retry))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open and configure a connection, backing off while the file is locked.
    /// Any other error is returned on the first attempt.
    pub fn acquire(&self) -> Result<Connection, ConnectionError> {
        let result = self.backoff.retry(
            |attempt| {
                let conn = Connection::open(&self.path)?;
                self.session.apply(&conn).inspect_err(|e| {
                    if is_locked(e) && self.backoff.has_next(attempt) {
                        log::warn!(
                            "Attempt {}/{} - database {} is locked, retrying in {:?}",
                            attempt,
                            self.backoff.max_attempts,
                            self.path.display(),
                            self.backoff.delay(attempt),
                        );
                    }
                })?;
                Ok(conn)
            },
            is_locked,
        );

        match result {
            Ok(conn) => {
                log::debug!("Opened connection to {}", self.path.display());
                Ok(conn)
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                log::error!("Max retries exceeded: {} is locked", self.path.display());
                Err(ConnectionError::Locked { attempts, source: last })
            }
            Err(RetryError::Permanent(e)) => {
                log::error!("Error creating a new connection to {}: {}", self.path.display(), e);
                Err(ConnectionError::Open(e))
            }
        }
    }
}

/// Open `path` and create the tables on first run. Bootstrap helper for the
/// binary and tests; the engine itself never issues DDL.
pub fn init_database(path: &Path, cfg: &DatabaseConfig) -> Result<Connection, ConnectionError> {
    let first_run = !path.exists();
    let conn = ConnectionProvider::new(path, SessionConfig::from(cfg), Backoff::from(&cfg.connect_retry))
        .acquire()?;

    if first_run {
        let schema = include_str!("../../resources/schema.sql");
        conn.execute_batch(schema)?;
    }
    log::info!("Database ready at {}", path.display());
    Ok(conn)
}
