use crate::error::MarketDataError;
use crate::events::{DataChangeKind, DataChanged};
use crate::worker::{self, StoreLease, SyncContext, WorkerSlot};
use core_types::{Candle, Clock, SeriesKey, Timeframe};
use database::{CandleRepository, SqlitePool};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, watch};

const CHANGE_CAPACITY: usize = 1024;

/// Lazily derived scalars. A `None` field means "re-query on next read".
///
/// `generation` moves on every write so a query that raced a write never
/// stores its stale result.
#[derive(Debug, Default)]
struct Memo {
    generation: u64,
    count: Option<usize>,
    newest: Option<Option<Candle>>,
    oldest: Option<Option<Candle>>,
    /// Bucket the lookup was made for, and the latest candle at or before it.
    current: Option<(i64, Option<Candle>)>,
}

impl Memo {
    fn invalidate(&mut self) {
        self.generation += 1;
        self.count = None;
        self.newest = None;
        self.oldest = None;
        self.current = None;
    }
}

/// The authoritative candle series for one (exchange, pair, timeframe).
///
/// Reads are memoised on top of the persistent table; writes classify themselves
/// against the newest candle and are announced on the store's change topic.
pub struct CandleStore {
    key: SeriesKey,
    repo: CandleRepository,
    clock: Arc<dyn Clock>,
    max_future_ms: i64,
    memo: Mutex<Memo>,
    write_gate: tokio::sync::Mutex<()>,
    changes: broadcast::Sender<DataChanged>,
    syncing: watch::Sender<bool>,
    pub(crate) worker: Mutex<WorkerSlot>,
    simulation: AtomicBool,
}

impl CandleStore {
    /// Opens (creating if needed) the timeframe table inside `pool` and derives the
    /// initial syncing state.
    pub async fn open(
        key: SeriesKey,
        pool: SqlitePool,
        clock: Arc<dyn Clock>,
        max_future_ms: i64,
    ) -> Result<Arc<Self>, MarketDataError> {
        let repo = CandleRepository::open(pool, key.timeframe).await?;
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        let (syncing, _) = watch::channel(true);
        let store = Arc::new(Self {
            key,
            repo,
            clock,
            max_future_ms,
            memo: Mutex::new(Memo::default()),
            write_gate: tokio::sync::Mutex::new(()),
            changes,
            syncing,
            worker: Mutex::new(WorkerSlot::default()),
            simulation: AtomicBool::new(false),
        });
        store.refresh_syncing().await?;
        Ok(store)
    }

    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    pub fn timeframe(&self) -> Timeframe {
        self.key.timeframe
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn period(&self) -> i64 {
        self.key.timeframe.duration_ms()
    }

    // --- Memoised reads ---

    pub async fn count(&self) -> Result<usize, MarketDataError> {
        let generation = {
            let memo = self.memo.lock();
            if let Some(count) = memo.count {
                return Ok(count);
            }
            memo.generation
        };
        let count = self.repo.count().await?;
        let mut memo = self.memo.lock();
        if memo.generation == generation {
            memo.count = Some(count);
        }
        Ok(count)
    }

    pub async fn newest(&self) -> Result<Option<Candle>, MarketDataError> {
        let generation = {
            let memo = self.memo.lock();
            if let Some(newest) = memo.newest {
                return Ok(newest);
            }
            memo.generation
        };
        let newest = self.repo.newest().await?;
        let mut memo = self.memo.lock();
        if memo.generation == generation {
            memo.newest = Some(newest);
        }
        Ok(newest)
    }

    pub async fn oldest(&self) -> Result<Option<Candle>, MarketDataError> {
        let generation = {
            let memo = self.memo.lock();
            if let Some(oldest) = memo.oldest {
                return Ok(oldest);
            }
            memo.generation
        };
        let oldest = self.repo.oldest().await?;
        let mut memo = self.memo.lock();
        if memo.generation == generation {
            memo.oldest = Some(oldest);
        }
        Ok(oldest)
    }

    /// The latest candle at or before the store clock's "now".
    ///
    /// Under a simulated clock the bracketing candle is replayed as if it were still
    /// forming, see [`interpolate`].
    pub async fn current(&self) -> Result<Option<Candle>, MarketDataError> {
        let now = self.clock.now();
        let bucket = self.key.timeframe.bucket_start(now);
        let (cached, generation) = {
            let memo = self.memo.lock();
            let cached = memo.current.filter(|(at, _)| *at == bucket).map(|(_, candle)| candle);
            (cached, memo.generation)
        };

        let candle = match cached {
            Some(candle) => candle,
            None => {
                let candle = self.repo.latest_at_or_before(now).await?;
                let mut memo = self.memo.lock();
                if memo.generation == generation {
                    memo.current = Some((bucket, candle));
                }
                candle
            }
        };

        Ok(match candle {
            Some(candle) if self.clock.is_simulated() => Some(interpolate(&candle, self.period(), now)),
            other => other,
        })
    }

    // --- Direct reads, used for paging ---

    pub async fn count_at_or_before(&self, ts: i64) -> Result<usize, MarketDataError> {
        Ok(self.repo.count_at_or_before(ts).await?)
    }

    /// Up to `limit` candles starting at store index `offset` (0 = oldest).
    pub async fn candles_by_index(&self, offset: usize, limit: usize) -> Result<Vec<Candle>, MarketDataError> {
        Ok(self.repo.by_index(offset, limit).await?)
    }

    /// Candles with `from <= timestamp < to`.
    pub async fn candles_between(&self, from: i64, to: i64) -> Result<Vec<Candle>, MarketDataError> {
        Ok(self.repo.between(from, to).await?)
    }

    // --- Writes ---

    /// Stores one candle and reports how it was classified.
    pub async fn add_one(&self, candle: Candle) -> Result<DataChangeKind, MarketDataError> {
        let changes = self.add_batch(vec![candle]).await?;
        changes.first().map(|change| change.kind).ok_or_else(|| {
            MarketDataError::Rejected(format!("candle at {} is not plausible", candle.timestamp))
        })
    }

    /// Upserts a batch in one transaction and publishes the resulting changes.
    ///
    /// Implausible candles are dropped. Duplicate timestamps inside the batch are merged.
    /// A batch touching anything other than the newest candle or the tail is reported
    /// as a single [`DataChangeKind::Other`] change and wipes every memoised scalar.
    pub async fn add_batch(&self, candles: Vec<Candle>) -> Result<Vec<DataChanged>, MarketDataError> {
        let now = self.clock.now();
        let mut accepted: Vec<Candle> = Vec::with_capacity(candles.len());
        for candle in candles {
            if candle.is_plausible(now, self.max_future_ms) {
                accepted.push(candle);
            } else {
                tracing::warn!(series = %self.key, timestamp = candle.timestamp, "Dropping implausible candle.");
            }
        }
        if accepted.is_empty() {
            return Ok(Vec::new());
        }

        accepted.sort_by_key(|candle| candle.timestamp);
        let mut batch: Vec<Candle> = Vec::with_capacity(accepted.len());
        for candle in accepted {
            match batch.last_mut() {
                Some(last) if last.timestamp == candle.timestamp => last.update(&candle)?,
                _ => batch.push(candle),
            }
        }

        let _gate = self.write_gate.lock().await;
        let generation = self.memo.lock().generation;
        let count_before = self.count().await?;
        let mut newest = self.newest().await?;
        let period = self.period();

        let mut appended = 0usize;
        let mut refined: Option<(usize, Candle)> = None;
        let mut other = false;
        for candle in batch.iter_mut() {
            match newest {
                None => {
                    appended += 1;
                    newest = Some(*candle);
                }
                Some(last) if candle.timestamp >= last.timestamp + period => {
                    appended += 1;
                    newest = Some(*candle);
                }
                Some(last) if candle.timestamp == last.timestamp => {
                    let merged = last.merged(candle)?;
                    *candle = merged;
                    newest = Some(merged);
                    refined = Some(((count_before + appended).saturating_sub(1), merged));
                }
                Some(_) => other = true,
            }
        }

        self.repo.upsert_batch(&batch).await?;

        let events = {
            let mut memo = self.memo.lock();
            if other || memo.generation != generation {
                memo.invalidate();
            } else {
                memo.generation += 1;
                memo.count = Some(count_before + appended);
                memo.newest = Some(newest);
                if count_before == 0 {
                    memo.oldest = Some(batch.first().copied());
                }
                memo.current = None;
            }

            if other {
                vec![DataChanged::other()]
            } else {
                let mut events = Vec::with_capacity(2);
                if let Some((index, candle)) = refined {
                    events.push(DataChanged::current(index, candle));
                }
                if let Some(last) = newest.filter(|_| appended > 0) {
                    events.push(DataChanged::new(count_before..count_before + appended, last));
                }
                events
            }
        };

        for event in &events {
            // No subscribers is fine.
            let _ = self.changes.send(event.clone());
        }
        tracing::debug!(series = %self.key, written = batch.len(), appended, other, "Stored candle batch.");
        Ok(events)
    }

    /// Every [`DataChanged`] published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<DataChanged> {
        self.changes.subscribe()
    }

    // --- Syncing state ---

    /// True while the store is known to lag behind live data.
    pub fn data_syncing(&self) -> bool {
        *self.syncing.borrow()
    }

    pub fn subscribe_syncing(&self) -> watch::Receiver<bool> {
        self.syncing.subscribe()
    }

    /// Re-derives the syncing flag from the newest candle and the clock.
    pub async fn refresh_syncing(&self) -> Result<bool, MarketDataError> {
        let newest = self.newest().await?;
        let now = self.clock.now();
        let syncing = newest.is_none_or(|candle| now > candle.timestamp + self.period());
        let changed = self.syncing.send_if_modified(|current| {
            if *current == syncing {
                return false;
            }
            *current = syncing;
            true
        });
        if changed {
            tracing::info!(series = %self.key, syncing, "Data syncing state changed.");
        }
        Ok(syncing)
    }

    // --- Refresh worker ---

    /// Registers one more user of live data. The first lease starts the refresh
    /// worker; dropping the last one stops it. Must be called inside a tokio runtime.
    pub fn acquire<S: Send + 'static>(self: &Arc<Self>, ctx: &SyncContext<S>) -> StoreLease {
        let mut slot = self.worker.lock();
        slot.refs += 1;
        if slot.refs == 1 && !self.is_simulation() && !ctx.shutdown.is_cancelled() {
            let cancel = ctx.shutdown.child_token();
            // Seeded here, on the caller's context; a cold memo is resolved through the pipeline.
            let known_newest = self.memo.lock().newest;
            let handle = tokio::spawn(worker::refresh_loop(
                Arc::clone(self),
                known_newest,
                ctx.clone(),
                cancel.clone(),
            ));
            slot.start(cancel, handle);
            tracing::info!(series = %self.key, "Started refresh worker.");
        }
        StoreLease::new(Arc::downgrade(self))
    }

    pub(crate) fn release(&self) {
        let mut slot = self.worker.lock();
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs == 0 && slot.stop() {
            tracing::info!(series = %self.key, "Stopped refresh worker; no users left.");
        }
    }

    /// Switches the store to back-testing. The refresh worker stops and never restarts.
    pub fn enter_simulation(&self) {
        self.simulation.store(true, Ordering::SeqCst);
        if self.worker.lock().stop() {
            tracing::info!(series = %self.key, "Stopped refresh worker for simulation.");
        }
    }

    pub fn is_simulation(&self) -> bool {
        self.simulation.load(Ordering::SeqCst)
    }

    pub fn worker_running(&self) -> bool {
        self.worker.lock().is_running()
    }

    pub fn lease_count(&self) -> usize {
        self.worker.lock().refs
    }
}

/// Replays a finished candle as if observed at `now` while it was forming.
///
/// The price walks open→low→high→close for a bullish candle and open→high→low→close
/// for a bearish one, each leg taking a third of the bucket. The result carries the
/// envelope visited so far and a pro-rata share of the volume.
pub fn interpolate(candle: &Candle, period_ms: i64, now: i64) -> Candle {
    let elapsed = now - candle.timestamp;
    if period_ms <= 0 || elapsed >= period_ms {
        return *candle;
    }
    let progress = elapsed.max(0) as f64 / period_ms as f64;
    let path = if candle.is_bullish() {
        [candle.open, candle.low, candle.high, candle.close]
    } else {
        [candle.open, candle.high, candle.low, candle.close]
    };

    let scaled = progress * 3.0;
    let leg = (scaled.floor() as usize).min(2);
    let along = scaled - leg as f64;
    let price = path[leg] + (path[leg + 1] - path[leg]) * along;
    let visited = &path[..=leg];
    let high = visited.iter().copied().fold(price, f64::max);
    let low = visited.iter().copied().fold(price, f64::min);

    Candle {
        timestamp: candle.timestamp,
        open: candle.open,
        high,
        low,
        close: price,
        median: (high + low) / 2.0,
        volume: candle.volume * progress,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bullish() -> Candle {
        Candle::new(0, 10.0, 16.0, 7.0, 13.0, 30.0).unwrap()
    }

    #[test]
    fn interpolation_starts_at_the_open() {
        let c = interpolate(&bullish(), 60_000, 0);
        assert_eq!(c.close, 10.0);
        assert_eq!(c.high, 10.0);
        assert_eq!(c.low, 10.0);
        assert_eq!(c.volume, 0.0);
    }

    #[test]
    fn bullish_candle_visits_the_low_first() {
        let c = interpolate(&bullish(), 60_000, 20_000);
        assert!((c.close - 7.0).abs() < 1e-9);
        assert_eq!(c.high, 10.0);
        assert!((c.low - 7.0).abs() < 1e-9);
        assert!((c.volume - 10.0).abs() < 1e-9);
    }

    #[test]
    fn bearish_candle_visits_the_high_first() {
        let bearish = Candle::new(0, 13.0, 16.0, 7.0, 10.0, 30.0).unwrap();
        let c = interpolate(&bearish, 60_000, 30_000);
        assert!((c.close - 11.5).abs() < 1e-9);
        assert_eq!(c.high, 16.0);
        assert!((c.low - 11.5).abs() < 1e-9);
        assert!(c.is_valid());
    }

    #[test]
    fn finished_candle_is_returned_as_is() {
        assert_eq!(interpolate(&bullish(), 60_000, 60_000), bullish());
        assert_eq!(interpolate(&bullish(), 60_000, 90_000), bullish());
    }
}
