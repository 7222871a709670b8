use crate::DbError;
use core_types::{Candle, Timeframe};
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use std::sync::Arc;

/// A row of a `candles_<tf>` table.
#[derive(FromRow, Debug, Clone, Copy)]
struct DbCandle {
    timestamp: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    median: f64,
    volume: f64,
}

impl From<DbCandle> for Candle {
    fn from(row: DbCandle) -> Self {
        Candle {
            timestamp: row.timestamp,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            median: row.median,
            volume: row.volume,
        }
    }
}

/// SQL text for one timeframe table, rendered once when the repository is opened.
#[derive(Debug)]
struct Statements {
    count: String,
    newest: String,
    oldest: String,
    at_or_before: String,
    count_at_or_before: String,
    by_index: String,
    between: String,
    by_timestamp: String,
    upsert: String,
}

impl Statements {
    fn for_table(table: &str) -> Self {
        const COLUMNS: &str = "timestamp, open, high, low, close, median, volume";
        Self {
            count: format!("SELECT COUNT(*) FROM \"{table}\""),
            newest: format!("SELECT {COLUMNS} FROM \"{table}\" ORDER BY timestamp DESC LIMIT 1"),
            oldest: format!("SELECT {COLUMNS} FROM \"{table}\" ORDER BY timestamp ASC LIMIT 1"),
            at_or_before: format!(
                "SELECT {COLUMNS} FROM \"{table}\" WHERE timestamp <= ? ORDER BY timestamp DESC LIMIT 1"
            ),
            count_at_or_before: format!("SELECT COUNT(*) FROM \"{table}\" WHERE timestamp <= ?"),
            by_index: format!(
                "SELECT {COLUMNS} FROM \"{table}\" ORDER BY timestamp ASC LIMIT ? OFFSET ?"
            ),
            between: format!(
                "SELECT {COLUMNS} FROM \"{table}\" WHERE timestamp >= ? AND timestamp < ? ORDER BY timestamp ASC"
            ),
            by_timestamp: format!("SELECT {COLUMNS} FROM \"{table}\" WHERE timestamp = ?"),
            upsert: format!(
                r#"
                INSERT INTO "{table}" ({COLUMNS})
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (timestamp) DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    median = excluded.median,
                    volume = excluded.volume
                "#
            ),
        }
    }
}

/// Typed access to the candle table of one timeframe inside a pair database.
#[derive(Debug, Clone)]
pub struct CandleRepository {
    pool: SqlitePool,
    timeframe: Timeframe,
    sql: Arc<Statements>,
}

impl CandleRepository {
    /// Opens the table for `timeframe`, creating it on first use.
    pub async fn open(pool: SqlitePool, timeframe: Timeframe) -> Result<Self, DbError> {
        let table = Self::table_name(timeframe);
        let create = format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{table}" (
                timestamp INTEGER NOT NULL UNIQUE,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                median REAL NOT NULL,
                volume REAL NOT NULL
            )
            "#
        );
        sqlx::query(&create).execute(&pool).await?;

        Ok(Self {
            pool,
            timeframe,
            sql: Arc::new(Statements::for_table(&table)),
        })
    }

    pub fn table_name(timeframe: Timeframe) -> String {
        format!("candles_{}", timeframe.as_str())
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub async fn count(&self) -> Result<usize, DbError> {
        let count = sqlx::query_scalar::<_, i64>(&self.sql.count)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }

    pub async fn newest(&self) -> Result<Option<Candle>, DbError> {
        let row = sqlx::query_as::<_, DbCandle>(&self.sql.newest)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Candle::from))
    }

    pub async fn oldest(&self) -> Result<Option<Candle>, DbError> {
        let row = sqlx::query_as::<_, DbCandle>(&self.sql.oldest)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Candle::from))
    }

    /// The last candle whose timestamp is `<= ts`.
    pub async fn latest_at_or_before(&self, ts: i64) -> Result<Option<Candle>, DbError> {
        let row = sqlx::query_as::<_, DbCandle>(&self.sql.at_or_before)
            .bind(ts)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Candle::from))
    }

    /// Number of candles whose timestamp is `<= ts`.
    pub async fn count_at_or_before(&self, ts: i64) -> Result<usize, DbError> {
        let count = sqlx::query_scalar::<_, i64>(&self.sql.count_at_or_before)
            .bind(ts)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }

    /// Candles `[offset, offset + limit)` of the timestamp ordering.
    pub async fn by_index(&self, offset: usize, limit: usize) -> Result<Vec<Candle>, DbError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, DbCandle>(&self.sql.by_index)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Candle::from).collect())
    }

    /// Candles with `from <= timestamp < to`, ascending.
    pub async fn between(&self, from: i64, to: i64) -> Result<Vec<Candle>, DbError> {
        let rows = sqlx::query_as::<_, DbCandle>(&self.sql.between)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Candle::from).collect())
    }

    pub async fn get(&self, ts: i64) -> Result<Option<Candle>, DbError> {
        let row = sqlx::query_as::<_, DbCandle>(&self.sql.by_timestamp)
            .bind(ts)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Candle::from))
    }

    /// Upserts a batch of candles within a single transaction for atomicity.
    pub async fn upsert_batch(&self, candles: &[Candle]) -> Result<(), DbError> {
        if candles.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;

        for candle in candles {
            sqlx::query(&self.sql.upsert)
                .bind(candle.timestamp)
                .bind(candle.open)
                .bind(candle.high)
                .bind(candle.low)
                .bind(candle.close)
                .bind(candle.median)
                .bind(candle.volume)
                .execute(&mut *tx) // Note: must use the transaction object `tx` here
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
