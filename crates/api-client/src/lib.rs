//! # Meridian Exchange Interface
//!
//! The market-data core treats an exchange as an opaque capability: something that
//! hands back candle batches and balance snapshots. Protocol details (REST,
//! WebSocket, signing) live behind this trait and outside this workspace.

use async_trait::async_trait;
use core_types::{BalanceSnapshot, Candle, Timeframe, TradePair};
use tokio_util::sync::CancellationToken;

pub mod error;
pub mod replay;

// --- Public API ---
pub use error::ApiError;
pub use replay::ReplayExchange;

/// The generic, abstract interface for a trading exchange.
/// This trait is the contract that the refresh workers and balance poller use,
/// allowing the underlying implementation (live or replay) to be swapped out.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Short identifier, also used to name the exchange's data directory.
    fn name(&self) -> &str;

    /// Fetches candles with `from <= timestamp < to`, sorted ascending.
    /// An empty batch means "no new data yet" and is not an error.
    async fn fetch_candles(
        &self,
        pair: &TradePair,
        timeframe: Timeframe,
        from: i64,
        to: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<Candle>, ApiError>;

    /// The exchange's authoritative balances, one snapshot per coin.
    async fn balance_snapshots(&self) -> Result<Vec<BalanceSnapshot>, ApiError>;
}
