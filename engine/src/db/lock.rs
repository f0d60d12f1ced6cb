//! Exclusive ownership of a data directory
//!
//! Only the engine that owns the data directory may run startup recovery;
//! any other engine opened on it would otherwise finalize the owner's live
//! records as interrupted. Ownership is an exclusive SQLite lock on a
//! sidecar file, held for as long as the engine runs and released by the
//! OS if the process dies.

use super::now_millis;
use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteLockingMode};
use sqlx::{ConnectOptions, Connection};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Lock file name inside the data directory
pub const LOCK_FILE: &str = "engine.lock";

/// SQLITE_BUSY and SQLITE_LOCKED primary result codes
const BUSY_CODES: [i32; 2] = [5, 6];

/// Held exclusive lock on a data directory
pub struct EngineLock {
    path: PathBuf,
    conn: SqliteConnection,
}

impl EngineLock {
    /// Try to take the lock in `data_dir`
    ///
    /// Returns `Ok(None)` without waiting when another engine holds it.
    pub async fn acquire(data_dir: &Path) -> Result<Option<Self>> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .context("Failed to create data directory")?;

        let path = data_dir.join(LOCK_FILE);
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .locking_mode(SqliteLockingMode::Exclusive)
            .journal_mode(SqliteJournalMode::Delete)
            .busy_timeout(Duration::ZERO)
            .disable_statement_logging();

        let mut conn = match options.connect().await {
            Ok(conn) => conn,
            Err(e) if is_busy(&e) => {
                debug!("Lock {} is held", path.display());
                return Ok(None);
            }
            Err(e) => return Err(e).context("Failed to open engine lock"),
        };

        // exclusive mode keeps the lock from the first write until close
        match write_owner(&mut conn).await {
            Ok(()) => {
                info!("Acquired data directory lock {}", path.display());
                Ok(Some(Self { path, conn }))
            }
            Err(e) if is_busy(&e) => {
                debug!("Lock {} is held", path.display());
                conn.close().await.ok();
                Ok(None)
            }
            Err(e) => Err(e).context("Failed to take engine lock"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock
    pub async fn release(self) -> Result<()> {
        self.conn
            .close()
            .await
            .context("Failed to release engine lock")?;
        debug!("Released data directory lock {}", self.path.display());
        Ok(())
    }
}

async fn write_owner(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS engine_lock (
            id INTEGER PRIMARY KEY NOT NULL,
            pid INTEGER NOT NULL,
            acquired_at INTEGER NOT NULL
        )",
    )
    .execute(&mut *conn)
    .await?;

    let acquired_at = now_millis().unwrap_or_default();
    sqlx::query("INSERT OR REPLACE INTO engine_lock (id, pid, acquired_at) VALUES (1, ?, ?)")
        .bind(std::process::id() as i64)
        .bind(acquired_at)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

fn is_busy(error: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_error) = error else {
        return false;
    };
    db_error
        .code()
        .and_then(|code| code.parse::<i32>().ok())
        .is_some_and(|code| BUSY_CODES.contains(&(code & 0xff)))
}
