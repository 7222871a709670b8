use crate::error::DbError;
use core_types::TradePair;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Location of the candle database for one pair on one exchange.
pub fn pair_database_path(data_dir: &Path, exchange: &str, pair: &TradePair) -> PathBuf {
    data_dir
        .join(exchange.to_ascii_lowercase())
        .join(format!("{}.sqlite", pair.file_stem()))
}

/// Opens (creating if needed) the SQLite file at `path` and returns a pool over it.
pub async fn connect(path: &Path) -> Result<SqlitePool, DbError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options)
        .await?;

    tracing::debug!(path = %path.display(), "Opened candle database.");
    Ok(pool)
}

/// An in-memory database for tests and throwaway simulations.
///
/// Every SQLite in-memory connection is its own database, so the pool is pinned to
/// a single connection that is never recycled.
pub async fn connect_in_memory() -> Result<SqlitePool, DbError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(|e| DbError::ConnectionConfigError(e.to_string()))?;

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    Ok(pool)
}
