//! # Meridian Market Data
//!
//! Candle series kept in sync with an exchange and served to consumers.
//!
//! ## Architectural Principles
//!
//! - **One store per series:** a `CandleStore` is the authoritative, persistent series
//!   for one (exchange, pair, timeframe). Its scalar reads are memoised and re-derived
//!   from the table whenever a write makes them doubtful.
//! - **Workers never write:** the refresh worker polls the exchange and queues every
//!   effect on the integration pipeline; only the designated context applies them.
//! - **Views are windows:** an `Instrument` pages the store in fixed chunks and, under a
//!   simulated clock, only shows what existed at the simulated "now".
//!
//! ## Public API
//!
//! - `CandleStore`: memoised reads, classified writes, change and syncing topics,
//!   and the reference-counted refresh worker (`acquire` / `StoreLease`).
//! - `Instrument`: random access, time lookups and simulation stepping.
//! - `SyncContext`: the exchange, pipeline handle, shutdown token and settings a worker needs.
//! - `DataChanged` / `DataChangeKind`: change notifications.
//! - `MarketDataError`: The specific error types that can be returned from this crate.

pub mod candle_store;
pub mod error;
pub mod events;
pub mod instrument;
pub mod worker;

pub use candle_store::{CandleStore, interpolate};
pub use error::MarketDataError;
pub use events::{DataChangeKind, DataChanged};
pub use instrument::{DEFAULT_CHUNK_SIZE, Instrument};
pub use worker::{StoreLease, SyncContext};
