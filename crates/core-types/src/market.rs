use crate::enums::Timeframe;
use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A tradable pair such as `BTC/USDT`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TradePair {
    pub base: String,
    pub quote: String,
}

impl TradePair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into().to_ascii_uppercase(),
            quote: quote.into().to_ascii_uppercase(),
        }
    }

    /// A filesystem-safe rendering, used to name the pair's database file.
    pub fn file_stem(&self) -> String {
        format!("{}-{}", self.base, self.quote)
    }
}

impl fmt::Display for TradePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl FromStr for TradePair {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, quote) = s
            .split_once(['/', '-'])
            .ok_or_else(|| CoreError::InvalidInput("pair".to_string(), s.to_string()))?;
        let (base, quote) = (base.trim(), quote.trim());
        if base.is_empty() || quote.is_empty() {
            return Err(CoreError::InvalidInput("pair".to_string(), s.to_string()));
        }
        Ok(TradePair::new(base, quote))
    }
}

/// Identifies one candle series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub pair: TradePair,
    pub timeframe: Timeframe,
}

impl SeriesKey {
    pub fn new(pair: TradePair, timeframe: Timeframe) -> Self {
        Self { pair, timeframe }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.pair, self.timeframe)
    }
}

/// Read contract of an order book, as consumed by the ledger when reserving funds
/// for an order. The book itself lives outside this crate.
pub trait OrderBook: Send + Sync {
    fn pair(&self) -> &TradePair;
    fn best_bid(&self) -> Option<f64>;
    fn best_ask(&self) -> Option<f64>;
}
