//! SQLite pool construction.
//!
//! Connection policy is driven by how the engine uses the database:
//! WAL mode so queries keep reading while an ingest commit is in flight,
//! foreign-key enforcement because the chunk and vector tables declare
//! references, and a busy timeout because quota and audit writes arrive
//! on several pool connections at once.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::DbConfig;
use crate::error::Result;

/// How long a connection waits on a writer lock before giving up. Quota
/// transactions are short; a contended write resolving slower than this
/// indicates something worse than contention.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn open_pool(config: &DbConfig) -> Result<SqlitePool> {
    if let Some(parent) = config.path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", config.path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await?;

    Ok(pool)
}
