use crate::error::CoreError;
use serde::{Deserialize, Serialize};

/// One OHLCV bar for a fixed time bucket.
///
/// `timestamp` is the bucket's open time in milliseconds since the Unix epoch (UTC).
/// The envelope invariant `low <= min(open, close) <= max(open, close) <= high` holds
/// for every candle built through [`Candle::new`] or refined through [`Candle::update`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub median: f64,
    pub volume: f64,
}

impl Candle {
    /// Builds a candle, widening `high`/`low` so they envelope `open` and `close`.
    pub fn new(
        timestamp: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, CoreError> {
        for (name, value) in [("open", open), ("high", high), ("low", low), ("close", close), ("volume", volume)] {
            if !value.is_finite() {
                return Err(CoreError::InvalidInput(name.to_string(), format!("{value} is not finite")));
            }
        }
        if volume < 0.0 {
            return Err(CoreError::InvalidInput("volume".to_string(), format!("{volume} is negative")));
        }

        let high = open.max(high).max(close);
        let low = open.min(low).min(close);
        Ok(Self {
            timestamp,
            open,
            high,
            low,
            close,
            median: (high + low) / 2.0,
            volume,
        })
    }

    /// Merges a refinement of the still-open candle into `self`.
    ///
    /// The envelope only ever widens; `close` follows the refinement and `volume` keeps
    /// the larger cumulative figure.
    pub fn update(&mut self, other: &Candle) -> Result<(), CoreError> {
        if other.timestamp != self.timestamp {
            return Err(CoreError::TimestampMismatch {
                existing: self.timestamp,
                incoming: other.timestamp,
            });
        }
        self.high = self.high.max(other.high).max(other.close);
        self.low = self.low.min(other.low).min(other.close);
        self.close = other.close;
        self.volume = self.volume.max(other.volume);
        self.median = (self.high + self.low) / 2.0;
        Ok(())
    }

    /// Returns a copy of `self` refined by `other`.
    pub fn merged(&self, other: &Candle) -> Result<Candle, CoreError> {
        let mut merged = *self;
        merged.update(other)?;
        Ok(merged)
    }

    pub fn is_valid(&self) -> bool {
        self.high >= self.low
            && self.high >= self.open.max(self.close)
            && self.low <= self.open.min(self.close)
            && self.volume >= 0.0
    }

    /// A candle stamped further than `max_future_ms` past `now` is treated as garbage.
    pub fn is_plausible(&self, now: i64, max_future_ms: i64) -> bool {
        self.is_valid() && self.timestamp <= now.saturating_add(max_future_ms)
    }

    pub fn is_bullish(&self) -> bool {
        self.close >= self.open
    }
}
