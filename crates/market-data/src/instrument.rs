use crate::candle_store::{CandleStore, interpolate};
use crate::error::MarketDataError;
use crate::events::{DataChangeKind, DataChanged};
use crate::worker::StoreLease;
use core_types::{Candle, Clock, SeriesKey, Timeframe};
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::{self, error::TryRecvError};

pub const DEFAULT_CHUNK_SIZE: usize = 10_000;

/// Unread changes kept before they collapse into a single `Other`.
const PENDING_CAP: usize = 64;

/// A windowed, random-access view over one [`CandleStore`].
///
/// The window `[begin, begin + cache.len())` is expressed in store indices, grows in
/// whole chunks in whichever direction a read needs, and is only ever dropped by
/// [`Instrument::invalidate`] or by a backfill in the store. Under a simulated clock
/// the visible series is truncated to candles at or before "now".
///
/// Every public operation first folds in the store's pending change notifications.
/// Instruments are owned by the designated context and are never shared.
pub struct Instrument {
    store: Weak<CandleStore>,
    key: SeriesKey,
    changes: broadcast::Receiver<DataChanged>,
    clock: Arc<dyn Clock>,
    chunk_size: usize,
    cache: VecDeque<Candle>,
    begin: usize,
    count: Option<usize>,
    sim_bucket: Option<i64>,
    pending: Vec<DataChanged>,
    _lease: Option<StoreLease>,
}

impl Instrument {
    pub fn new(store: &Arc<CandleStore>, clock: Arc<dyn Clock>, chunk_size: usize) -> Self {
        Self {
            store: Arc::downgrade(store),
            key: store.key().clone(),
            changes: store.subscribe(),
            clock,
            chunk_size: chunk_size.max(1),
            cache: VecDeque::new(),
            begin: 0,
            count: None,
            sim_bucket: None,
            pending: Vec::new(),
            _lease: None,
        }
    }

    /// Keeps the store's refresh worker alive for as long as this instrument lives.
    pub fn with_lease(mut self, lease: StoreLease) -> Self {
        self._lease = Some(lease);
        self
    }

    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    pub fn timeframe(&self) -> Timeframe {
        self.key.timeframe
    }

    /// Store indices currently held in memory.
    pub fn window(&self) -> Range<usize> {
        self.begin..self.end()
    }

    fn end(&self) -> usize {
        self.begin + self.cache.len()
    }

    fn store(&self) -> Result<Arc<CandleStore>, MarketDataError> {
        self.store.upgrade().ok_or(MarketDataError::StoreClosed)
    }

    fn cached(&self, index: usize) -> Option<Candle> {
        index
            .checked_sub(self.begin)
            .and_then(|offset| self.cache.get(offset))
            .copied()
    }

    // --- Reads ---

    /// Number of visible candles.
    pub async fn count(&mut self) -> Result<usize, MarketDataError> {
        self.sync_changes().await?;
        self.visible_count().await
    }

    /// The newest visible candle. Under a simulated clock it is replayed as still forming.
    pub async fn latest(&mut self) -> Result<Option<Candle>, MarketDataError> {
        self.sync_changes().await?;
        let count = self.visible_count().await?;
        if count == 0 {
            return Ok(None);
        }
        let candle = self.load(count - 1, count).await?;
        if self.clock.is_simulated() {
            Ok(Some(interpolate(&candle, self.timeframe().duration_ms(), self.clock.now())))
        } else {
            Ok(Some(candle))
        }
    }

    pub async fn get(&mut self, index: usize) -> Result<Candle, MarketDataError> {
        self.sync_changes().await?;
        let count = self.visible_count().await?;
        if index >= count {
            return Err(MarketDataError::IndexOutOfRange { index, count });
        }
        self.load(index, count).await
    }

    /// Index of the last candle with `timestamp <= time`, or 0 when nothing qualifies.
    pub async fn index_at(&mut self, time: i64) -> Result<usize, MarketDataError> {
        self.sync_changes().await?;
        let count = self.visible_count().await?;
        if count == 0 {
            return Ok(0);
        }
        let at_or_before = self.count_at(time).await?;
        Ok(at_or_before.saturating_sub(1).min(count - 1))
    }

    /// [`Instrument::index_at`] plus how far `time` sits into that candle's bucket.
    pub async fn fractional_index_at(&mut self, time: i64) -> Result<f64, MarketDataError> {
        let index = self.index_at(time).await?;
        let count = self.visible_count().await?;
        if count == 0 {
            return Ok(0.0);
        }
        let candle = self.load(index, count).await?;
        let fraction = (time - candle.timestamp) as f64 / self.timeframe().duration_ms() as f64;
        let value = index as f64 + fraction.clamp(0.0, 1.0);
        let ceiling = (index + 1) as f64;
        // Stay strictly below the next index.
        Ok(if value >= ceiling { f64::from_bits(ceiling.to_bits() - 1) } else { value })
    }

    /// Candles `idx_min..=idx_max`, clamped to the visible series.
    pub async fn range(&mut self, idx_min: usize, idx_max: usize) -> Result<Vec<Candle>, MarketDataError> {
        self.sync_changes().await?;
        let count = self.visible_count().await?;
        if count == 0 || idx_min > idx_max || idx_min >= count {
            return Ok(Vec::new());
        }
        let idx_max = idx_max.min(count - 1);
        self.ensure_loaded(idx_min, idx_max + 1).await?;
        Ok((idx_min..=idx_max).filter_map(|index| self.cached(index)).collect())
    }

    /// Drops the window and the visible count.
    pub fn invalidate(&mut self) {
        self.cache.clear();
        self.begin = 0;
        self.count = None;
    }

    /// Changes observed since the last call, translated to this instrument's indices.
    ///
    /// Unread changes are coalesced: appends merge into one `New`, refinements of the
    /// same candle replace each other, and anything past a small backlog becomes `Other`.
    pub async fn take_changes(&mut self) -> Result<Vec<DataChanged>, MarketDataError> {
        self.sync_changes().await?;
        Ok(std::mem::take(&mut self.pending))
    }

    // --- Simulation ---

    /// Re-anchors the visible series at `start_time`, with `steps_ago` candles of
    /// history paged in. Returns the visible count.
    pub async fn sim_reset(&mut self, start_time: i64, steps_ago: usize) -> Result<usize, MarketDataError> {
        self.sync_changes().await?;
        self.count = None;
        let visible = self.count_at(start_time).await?;
        // The warm-up history, the bracketing candle and the one after it.
        self.ensure_loaded(visible.saturating_sub(steps_ago.max(1)), visible + 1).await?;
        self.count = Some(visible);
        self.sim_bucket = Some(self.timeframe().bucket_start(start_time));
        tracing::debug!(series = %self.key, start_time, visible, "Instrument re-anchored for simulation.");
        Ok(visible)
    }

    /// Advances the visible series to `now`.
    ///
    /// Crossing into the next bucket reveals at most one more candle. Any other jump
    /// leaves the count to be recomputed on the next read.
    pub async fn sim_step(&mut self, now: i64) -> Result<(), MarketDataError> {
        self.sync_changes().await?;
        let period = self.timeframe().duration_ms();
        let bucket = self.timeframe().bucket_start(now);
        match (self.sim_bucket, self.count) {
            (Some(previous), _) if bucket == previous => {}
            (Some(previous), Some(count)) if bucket == previous + period => {
                self.ensure_loaded(count, count + 1).await?;
                if self.cached(count).is_some_and(|next| next.timestamp <= now) {
                    self.count = Some(count + 1);
                }
            }
            _ => self.count = None,
        }
        self.sim_bucket = Some(bucket);
        Ok(())
    }

    // --- Internals ---

    async fn visible_count(&mut self) -> Result<usize, MarketDataError> {
        if let Some(count) = self.count {
            return Ok(count);
        }
        let count = if self.clock.is_simulated() {
            self.count_at(self.clock.now()).await?
        } else {
            self.store()?.count().await?
        };
        self.count = Some(count);
        Ok(count)
    }

    /// How many stored candles have `timestamp <= time`. Answered from the window
    /// when it brackets `time`.
    async fn count_at(&self, time: i64) -> Result<usize, MarketDataError> {
        if let (Some(first), Some(last)) = (self.cache.front(), self.cache.back()) {
            if first.timestamp <= time && time < last.timestamp {
                return Ok(self.begin + self.cache.partition_point(|candle| candle.timestamp <= time));
            }
        }
        self.store()?.count_at_or_before(time).await
    }

    async fn load(&mut self, index: usize, count: usize) -> Result<Candle, MarketDataError> {
        self.ensure_loaded(index, index + 1).await?;
        self.cached(index).ok_or(MarketDataError::IndexOutOfRange { index, count })
    }

    /// Grows the window by whole chunks until it covers `lo..hi`, bounded by the store.
    async fn ensure_loaded(&mut self, lo: usize, hi: usize) -> Result<(), MarketDataError> {
        if lo >= hi || (!self.cache.is_empty() && lo >= self.begin && hi <= self.end()) {
            return Ok(());
        }
        let store = self.store()?;
        let stored = store.count().await?;
        let hi = hi.min(stored);
        if lo >= hi {
            return Ok(());
        }
        let chunk = self.chunk_size;
        let aligned_lo = lo / chunk * chunk;
        let aligned_hi = hi.div_ceil(chunk).saturating_mul(chunk).min(stored);

        if !self.cache.is_empty() && aligned_lo < self.begin {
            let wanted = self.begin - aligned_lo;
            let head = store.candles_by_index(aligned_lo, wanted).await?;
            if head.len() == wanted {
                for candle in head.into_iter().rev() {
                    self.cache.push_front(candle);
                }
                self.begin = aligned_lo;
            } else {
                tracing::warn!(series = %self.key, wanted, got = head.len(), "Store changed under the window; reloading.");
                self.invalidate();
            }
        }

        if self.cache.is_empty() {
            let candles = store.candles_by_index(aligned_lo, aligned_hi - aligned_lo).await?;
            self.begin = aligned_lo;
            self.cache = candles.into();
        } else if aligned_hi > self.end() {
            let end = self.end();
            let tail = store.candles_by_index(end, aligned_hi - end).await?;
            self.cache.extend(tail);
        }
        tracing::trace!(series = %self.key, begin = self.begin, end = self.end(), "Window paged.");
        Ok(())
    }

    async fn sync_changes(&mut self) -> Result<(), MarketDataError> {
        let mut incoming = Vec::new();
        loop {
            match self.changes.try_recv() {
                Ok(change) => incoming.push(change),
                Err(TryRecvError::Lagged(missed)) => {
                    tracing::warn!(series = %self.key, missed, "Instrument fell behind its store; rebuilding.");
                    incoming.push(DataChanged::other());
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        if incoming.is_empty() {
            return Ok(());
        }

        let mut rebuild = false;
        for change in &incoming {
            match change.kind {
                DataChangeKind::New => self.count = None,
                DataChangeKind::Current => {
                    if let (Some(range), Some(candle)) = (&change.range, change.candle) {
                        if let Some(slot) = range
                            .start
                            .checked_sub(self.begin)
                            .and_then(|offset| self.cache.get_mut(offset))
                        {
                            *slot = candle;
                        }
                    }
                }
                DataChangeKind::Other => rebuild = true,
            }
        }

        if rebuild {
            self.invalidate();
            let visible = self.visible_count().await?;
            if visible > 0 {
                self.ensure_loaded(visible - 1, visible).await?;
            }
            self.record_change(DataChanged::other());
            return Ok(());
        }

        let visible = self.visible_count().await?;
        for change in incoming {
            let Some(range) = change.range else {
                continue;
            };
            let clipped = range.start.min(visible)..range.end.min(visible);
            if clipped.is_empty() {
                continue;
            }
            let candle = if clipped.end == range.end { change.candle } else { None };
            self.record_change(DataChanged {
                kind: change.kind,
                range: Some(clipped),
                candle,
            });
        }
        Ok(())
    }

    fn record_change(&mut self, change: DataChanged) {
        if change.kind == DataChangeKind::Other || self.pending.len() >= PENDING_CAP {
            self.pending.clear();
            self.pending.push(DataChanged::other());
            return;
        }
        // A pending `Other` already tells the consumer to reload everything.
        if self.pending.first().is_some_and(|first| first.kind == DataChangeKind::Other) {
            return;
        }
        if let (Some(last), Some(range)) = (self.pending.last_mut(), &change.range) {
            if let Some(last_range) = &mut last.range {
                let extends = last.kind == DataChangeKind::New
                    && change.kind == DataChangeKind::New
                    && last_range.end == range.start;
                let refines = change.kind == DataChangeKind::Current && last_range.end == range.end;
                if extends || refines {
                    last_range.end = range.end;
                    last.candle = change.candle;
                    return;
                }
            }
        }
        self.pending.push(change);
    }
}
