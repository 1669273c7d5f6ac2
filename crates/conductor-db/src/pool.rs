//! SQLite pool management.
//!
//! The store runs SQLite in WAL mode: many concurrent readers, exactly one
//! writer. Two pools enforce that shape -- a read pool sized per config and
//! a write pool capped at a single connection, so every write (and every
//! transaction) serializes on that one connection.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::info;

use crate::config::DbConfig;

/// Handle to the store: a read pool plus a single-connection write pool
/// over the same database file.
#[derive(Debug, Clone)]
pub struct Db {
    read: SqlitePool,
    write: SqlitePool,
}

impl Db {
    /// Open (creating if missing) the database file and build both pools.
    pub async fn connect(config: &DbConfig) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let write = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options.clone())
            .await
            .with_context(|| {
                format!("failed to open database at {}", config.path.display())
            })?;

        let read = SqlitePoolOptions::new()
            .max_connections(config.max_readers)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options.read_only(false))
            .await
            .with_context(|| {
                format!("failed to open read pool at {}", config.path.display())
            })?;

        Ok(Self { read, write })
    }

    /// Pool for queries that only read.
    pub fn read(&self) -> &SqlitePool {
        &self.read
    }

    /// Pool for standalone writes. One connection: writes serialize here.
    pub fn write(&self) -> &SqlitePool {
        &self.write
    }

    /// Begin a write transaction.
    ///
    /// Commits on [`Transaction::commit`], rolls back when dropped without
    /// one. Because the write pool holds a single connection, at most one
    /// transaction is open at a time; a second `begin` waits its turn.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.write
            .begin()
            .await
            .context("failed to begin write transaction")
    }

    /// Run all pending migrations from the given directory.
    ///
    /// Uses a runtime `Migrator` so no database is required at compile time
    /// (unlike the `sqlx::migrate!()` macro).
    pub async fn run_migrations(&self, migrations_dir: &Path) -> Result<()> {
        let migrator = sqlx::migrate::Migrator::new(migrations_dir)
            .await
            .with_context(|| {
                format!(
                    "failed to load migrations from {}",
                    migrations_dir.display()
                )
            })?;

        migrator
            .run(&self.write)
            .await
            .context("failed to run database migrations")?;

        info!("migrations applied successfully");
        Ok(())
    }

    /// Close both pools, flushing WAL state.
    pub async fn close(&self) {
        self.read.close().await;
        self.write.close().await;
    }
}

/// Return the default path to the migrations directory shipped with
/// `conductor-db`.
///
/// Resolves relative to this crate's source tree via the compile-time
/// `CARGO_MANIFEST_DIR` env, so it works for tests and for callers that
/// build from a checkout.
pub fn default_migrations_path() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"))
}
