pub mod balance;
pub mod candle;
pub mod clock;
pub mod enums;
pub mod error;
pub mod market;

// Re-export the core types to provide a clean public API.
pub use balance::{BalanceSnapshot, FundAllocation, FundId};
pub use candle::Candle;
pub use clock::{Clock, SimClock, WallClock};
pub use enums::{OrderSide, Timeframe};
pub use error::CoreError;
pub use market::{OrderBook, SeriesKey, TradePair};
