//! Database pool with split reader/writer connections in WAL mode.
//!
//! SQLite allows only one writer at a time. This module provides a `DatabasePool`
//! with a multi-connection reader pool for concurrent reads and a single-connection
//! writer pool for serialized writes. Both use WAL journal mode and enforce foreign keys.
//!
//! The run store and the broker log live in separate database files, each
//! with its own migration set.

use std::path::Path;
use std::str::FromStr;

use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// Migrations of the run store database (workflows, runs, outbox).
pub static STORE_MIGRATOR: Migrator = sqlx::migrate!("../../migrations/store");

/// Migrations of the broker database (message log, consumer offsets, topic
/// partition counts).
pub static BROKER_MIGRATOR: Migrator = sqlx::migrate!("../../migrations/broker");

/// Split read/write pool for SQLite with WAL mode.
///
/// - `reader`: Multi-connection pool (up to 8) for concurrent SELECT queries.
/// - `writer`: Single-connection pool for serialized INSERT/UPDATE/DELETE.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Create a new DatabasePool with split reader/writer connections.
    ///
    /// Runs `migrator` on the writer pool before the reader pool is opened.
    /// Both pools use WAL journal mode, foreign key enforcement, and 5-second busy timeout.
    pub async fn new(database_url: &str, migrator: &Migrator) -> Result<Self, sqlx::Error> {
        let base_opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5))
            .create_if_missing(true);

        let read_opts = base_opts.clone().read_only(true);
        let write_opts = base_opts;

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(write_opts)
            .await?;

        migrator.run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(read_opts)
            .await?;

        Ok(Self { reader, writer })
    }

    /// Open (and migrate) a run store database.
    pub async fn store(database_url: &str) -> Result<Self, sqlx::Error> {
        Self::new(database_url, &STORE_MIGRATOR).await
    }

    /// Open (and migrate) a broker database.
    pub async fn broker(database_url: &str) -> Result<Self, sqlx::Error> {
        Self::new(database_url, &BROKER_MIGRATOR).await
    }
}

/// `sqlite://` URL of a database file inside `data_dir`.
pub fn database_url_in(data_dir: &Path, file_name: &str) -> String {
    format!("sqlite://{}?mode=rwc", data_dir.join(file_name).display())
}
