//! # Meridian Database Crate
//!
//! This crate is the durable backing store for candle series. It is the only state
//! the market-data core owns that survives a restart.
//!
//! ## Architectural Principles
//!
//! - **One file per pair, one table per timeframe:** every (exchange, pair) gets its
//!   own SQLite file, and each timeframe lives in a `candles_<tf>` table keyed by a
//!   unique `timestamp`. Writes are upserts, so replaying a fetch is harmless.
//! - **Single writer:** only the designated execution context writes, which is what
//!   makes reopening an existing file safe without any coordination.
//! - **Asynchronous & Pooled:** all operations are asynchronous over a `SqlitePool`.
//!
//! ## Public API
//!
//! - `connect` / `connect_in_memory`: open a pool for a pair database.
//! - `pair_database_path`: where a pair's database file lives under the data directory.
//! - `CandleRepository`: typed queries over one timeframe table.
//! - `DbError`: The specific error types that can be returned from this crate.

// Declare the modules that constitute this crate.
pub mod connection;
pub mod error;
pub mod repository;

// Re-export the key components to create a clean, public-facing API.
pub use connection::{connect, connect_in_memory, pair_database_path};
pub use error::DbError;
pub use repository::CandleRepository;
pub use sqlx::SqlitePool;
