/// Database module for SQLite persistence
///
/// This module stores everything the engine needs to survive a restart:
/// chains, workflows, datasets, variables, connector settings and the
/// Output / WorkflowOutput records produced by runs. It uses sqlx with WAL
/// mode for better concurrency between the coordination loop and readers.
///
/// Schema changes live in `engine/migrations/` as numbered SQL files. Each is
/// applied at most once, in order, and recorded in `schema_migrations`, so
/// opening a database is idempotent and replayable.
use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

pub mod chains;
pub mod datasets;
pub mod lock;
pub mod outputs;
pub mod settings;
pub mod variables;
pub mod workflow_outputs;

// Re-export commonly used types
pub use chains::{
    Chain, ChainRepository, ModelSelection, PromptFragment, Workflow, WorkflowRepository,
};
pub use datasets::{Dataset, DatasetRepository};
pub use lock::EngineLock;
pub use outputs::{content_hash, Completion, Output, OutputRepository, Rating};
pub use settings::{ConnectorSetting, ConnectorSettingsRepository};
pub use variables::{Variable, VariableRepository};
pub use workflow_outputs::{WorkflowCompletion, WorkflowOutput, WorkflowOutputRepository};

/// Ordered schema migrations: (version, name, sql)
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (
        1,
        "001_initial.sql",
        include_str!("../../migrations/001_initial.sql"),
    ),
    (
        2,
        "002_outputs.sql",
        include_str!("../../migrations/002_outputs.sql"),
    ),
];

/// Milliseconds since the Unix epoch
pub(crate) fn now_millis() -> Result<i64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as i64)
}

/// Database connection pool
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    ///
    /// This will:
    /// 1. Create the database file if it doesn't exist
    /// 2. Enable WAL mode and foreign keys
    /// 3. Apply any migrations not yet recorded in `schema_migrations`
    ///
    /// SQLite replays an existing WAL on open, so reopening after an unclean
    /// shutdown needs no extra handling here. Outputs left in flight by such a
    /// shutdown are recovered by the orchestrator, not by this layer.
    pub async fn new(db_path: &Path) -> Result<Self> {
        info!("Initializing database at: {}", db_path.display());

        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }

        let connection_string = format!("sqlite:{}", db_path.display());
        let options = SqliteConnectOptions::from_str(&connection_string)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        debug!("Database connection established");

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Apply pending migrations in version order
    ///
    /// Each migration runs in its own transaction together with its
    /// `schema_migrations` row, so a failure leaves no partial version behind.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                applied_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create schema_migrations table")?;

        let applied: Vec<i64> = sqlx::query_scalar("SELECT version FROM schema_migrations")
            .fetch_all(&self.pool)
            .await
            .context("Failed to read applied migrations")?;

        for (version, name, sql) in MIGRATIONS {
            if applied.contains(version) {
                continue;
            }

            info!("Applying migration {}", name);

            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(sql)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to execute migration {}", name))?;
            sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)")
                .bind(version)
                .bind(name)
                .bind(now_millis()?)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to record migration {}", name))?;
            tx.commit().await?;
        }

        debug!("Database schema is up to date");
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Flush the WAL to disk
    ///
    /// Called during graceful shutdown so pending writes land in the main
    /// database file.
    pub async fn flush_wal(&self) -> Result<()> {
        info!("Flushing WAL to disk");

        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .context("Failed to flush WAL")?;

        Ok(())
    }

    /// Flush the WAL and close all connections in the pool
    pub async fn close(self) -> Result<()> {
        self.flush_wal().await?;
        self.pool.close().await;

        info!("Database connection closed");
        Ok(())
    }

    pub fn outputs(&self) -> OutputRepository {
        OutputRepository::new(self.pool.clone())
    }

    pub fn workflow_outputs(&self) -> WorkflowOutputRepository {
        WorkflowOutputRepository::new(self.pool.clone())
    }

    pub fn chains(&self) -> ChainRepository {
        ChainRepository::new(self.pool.clone())
    }

    pub fn workflows(&self) -> WorkflowRepository {
        WorkflowRepository::new(self.pool.clone())
    }

    pub fn datasets(&self) -> DatasetRepository {
        DatasetRepository::new(self.pool.clone())
    }

    pub fn variables(&self) -> VariableRepository {
        VariableRepository::new(self.pool.clone())
    }

    pub fn connector_settings(&self) -> ConnectorSettingsRepository {
        ConnectorSettingsRepository::new(self.pool.clone())
    }
}
