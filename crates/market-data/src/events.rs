use core_types::Candle;
use std::ops::Range;

/// How a write relates to what the store already held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChangeKind {
    /// Appended past the newest candle.
    New,
    /// Refined the still-forming newest candle.
    Current,
    /// Backfill or out-of-order data. Every cached view must be rebuilt.
    Other,
}

/// Published on a store's change topic after every write.
///
/// `range` is expressed in store indices (0 = oldest) and is `None` for
/// [`DataChangeKind::Other`]. `candle` is the last candle written by the change.
#[derive(Debug, Clone, PartialEq)]
pub struct DataChanged {
    pub kind: DataChangeKind,
    pub range: Option<Range<usize>>,
    pub candle: Option<Candle>,
}

impl DataChanged {
    pub fn new(range: Range<usize>, candle: Candle) -> Self {
        Self {
            kind: DataChangeKind::New,
            range: Some(range),
            candle: Some(candle),
        }
    }

    pub fn current(index: usize, candle: Candle) -> Self {
        Self {
            kind: DataChangeKind::Current,
            range: Some(index..index + 1),
            candle: Some(candle),
        }
    }

    pub fn other() -> Self {
        Self {
            kind: DataChangeKind::Other,
            range: None,
            candle: None,
        }
    }
}
