use crate::error::ApiError;
use crate::Exchange;
use async_trait::async_trait;
use core_types::{BalanceSnapshot, Candle, SeriesKey, Timeframe, TradePair};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct ReplayState {
    candles: HashMap<SeriesKey, Vec<Candle>>,
    balances: Vec<BalanceSnapshot>,
    failures_pending: u32,
    candle_fetches: usize,
}

/// An exchange backed by in-memory data.
///
/// Serves recorded candles and balances back through the [`Exchange`] contract, so
/// simulations and tests can drive the sync machinery without a network.
#[derive(Debug)]
pub struct ReplayExchange {
    name: String,
    state: Mutex<ReplayState>,
}

impl ReplayExchange {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(ReplayState::default()),
        }
    }

    /// Makes `candles` available for the series; they are kept sorted by timestamp and
    /// a candle with an existing timestamp replaces the older copy.
    pub fn push_candles(&self, key: SeriesKey, candles: impl IntoIterator<Item = Candle>) {
        let mut state = self.state.lock();
        let series = state.candles.entry(key).or_default();
        for candle in candles {
            match series.binary_search_by_key(&candle.timestamp, |c| c.timestamp) {
                Ok(pos) => series[pos] = candle,
                Err(pos) => series.insert(pos, candle),
            }
        }
    }

    pub fn set_balances(&self, balances: Vec<BalanceSnapshot>) {
        self.state.lock().balances = balances;
    }

    /// The next `count` requests fail with [`ApiError::RequestFailed`].
    pub fn fail_next(&self, count: u32) {
        self.state.lock().failures_pending = count;
    }

    /// Number of candle requests served so far, failed ones included.
    pub fn candle_fetches(&self) -> usize {
        self.state.lock().candle_fetches
    }

    fn take_failure(state: &mut ReplayState) -> Result<(), ApiError> {
        if state.failures_pending > 0 {
            state.failures_pending -= 1;
            tracing::debug!(remaining = state.failures_pending, "Replay exchange injecting a failure.");
            return Err(ApiError::RequestFailed("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Exchange for ReplayExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_candles(
        &self,
        pair: &TradePair,
        timeframe: Timeframe,
        from: i64,
        to: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<Candle>, ApiError> {
        if cancel.is_cancelled() {
            return Err(ApiError::Cancelled);
        }
        let mut state = self.state.lock();
        state.candle_fetches += 1;
        Self::take_failure(&mut state)?;

        let key = SeriesKey::new(pair.clone(), timeframe);
        let batch: Vec<Candle> = state
            .candles
            .get(&key)
            .map(|series| {
                series
                    .iter()
                    .filter(|c| c.timestamp >= from && c.timestamp < to)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        if let Some(broken) = batch.iter().find(|c| !c.is_valid()) {
            return Err(ApiError::InvalidData(format!(
                "{key} candle at {} breaks its price envelope",
                broken.timestamp
            )));
        }
        Ok(batch)
    }

    async fn balance_snapshots(&self) -> Result<Vec<BalanceSnapshot>, ApiError> {
        let mut state = self.state.lock();
        Self::take_failure(&mut state)?;
        Ok(state.balances.clone())
    }
}
