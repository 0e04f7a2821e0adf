//! # tessera-db
//!
//! Database layer for Tessera. A single SQLite database holds the durable
//! federation state:
//! - **Outbound queue**: PDU/EDU bodies and their pending destinations
//! - **Blacklist**: destinations not to be attempted
//! - **Notary cache**: remote servers' signing key documents

pub mod repository;

use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tessera_common::config::DatabaseConfig;

/// How long a connection waits on another writer's lock before failing with `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared database state, cheap to clone.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the configured SQLite database.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        tracing::info!(url = %config.url, "Connecting to SQLite...");
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;
        tracing::info!("Connected to SQLite");
        Ok(Self { pool })
    }

    /// A private in-memory database, migrated and ready. Used by tests.
    ///
    /// Every pooled connection to `sqlite::memory:` is a separate database, so the
    /// pool is pinned to one connection that never idles out.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Start a transaction that takes the write lock up front.
    ///
    /// A deferred transaction that reads before it writes cannot wait for the
    /// lock when another connection holds it, and fails with `SQLITE_BUSY`
    /// regardless of the busy timeout. Every read-modify-write goes through here.
    pub async fn begin_write(&self) -> sqlx::Result<Transaction<'static, Sqlite>> {
        self.pool.begin_with("BEGIN IMMEDIATE").await
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("Migrations complete");
        Ok(())
    }
}
