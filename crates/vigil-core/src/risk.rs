//! Persistent, time-windowed risk counters backed by `SQLite`.
//!
//! Counters are keyed by `(tenant, bucket)` and survive across runs; each
//! increment runs in its own transaction so concurrent writers serialize per
//! key. A counter resets to zero when `now - window_start >= window_sec` at
//! read time, before the increment is applied.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

/// Schema for the counter table.
const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS risk_counters (
    tenant TEXT NOT NULL,
    bucket TEXT NOT NULL,
    count INTEGER NOT NULL,
    window_start_epoch INTEGER NOT NULL,
    PRIMARY KEY (tenant, bucket)
);
";

/// Errors raised by the risk store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RiskStoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error creating the store location.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable key-counter store with windowed reset.
pub struct RiskStore {
    conn: Mutex<Connection>,
}

impl RiskStore {
    /// Opens or creates a store at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or the
    /// database cannot be opened and initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RiskStoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, RiskStoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Atomically increments a counter and returns the post-increment count.
    ///
    /// Resets the window first when it has expired.
    ///
    /// # Errors
    ///
    /// Returns a database error if the transaction fails.
    pub fn increment_and_get(
        &self,
        tenant: &str,
        bucket: &str,
        window_sec: i64,
        now_epoch: i64,
    ) -> Result<i64, RiskStoreError> {
        let mut guard = self
            .conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let tx = guard.transaction()?;

        let row: Option<(i64, i64)> = tx
            .query_row(
                "SELECT count, window_start_epoch FROM risk_counters
                 WHERE tenant = ?1 AND bucket = ?2",
                params![tenant, bucket],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let new_count = match row {
            None => {
                tx.execute(
                    "INSERT INTO risk_counters (tenant, bucket, count, window_start_epoch)
                     VALUES (?1, ?2, 1, ?3)",
                    params![tenant, bucket, now_epoch],
                )?;
                1
            }
            Some((count, window_start)) => {
                let (base, start) = if now_epoch - window_start >= window_sec {
                    (0, now_epoch)
                } else {
                    (count, window_start)
                };
                let next = base + 1;
                tx.execute(
                    "UPDATE risk_counters SET count = ?3, window_start_epoch = ?4
                     WHERE tenant = ?1 AND bucket = ?2",
                    params![tenant, bucket, next, start],
                )?;
                next
            }
        };

        tx.commit()?;
        Ok(new_count)
    }

    /// Reads the effective count without incrementing.
    ///
    /// An expired window reads as zero; no write is performed.
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails.
    pub fn get(
        &self,
        tenant: &str,
        bucket: &str,
        window_sec: i64,
        now_epoch: i64,
    ) -> Result<i64, RiskStoreError> {
        let guard = self
            .conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let row: Option<(i64, i64)> = guard
            .query_row(
                "SELECT count, window_start_epoch FROM risk_counters
                 WHERE tenant = ?1 AND bucket = ?2",
                params![tenant, bucket],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(match row {
            None => 0,
            Some((_, window_start)) if now_epoch - window_start >= window_sec => 0,
            Some((count, _)) => count,
        })
    }
}
