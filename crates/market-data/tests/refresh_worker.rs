use api_client::{Exchange, ReplayExchange};
use configuration::{RetryPolicy, SyncConfig};
use core_types::{Candle, SeriesKey, SimClock, Timeframe, TradePair};
use market_data::{CandleStore, DataChangeKind, Instrument, SyncContext};
use pipeline::IntegrationPipeline;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MINUTE: i64 = 60_000;

fn key() -> SeriesKey {
    SeriesKey::new(TradePair::new("SOL", "USDT"), Timeframe::M1)
}

fn candle(ts: i64, close: f64) -> Candle {
    Candle::new(ts, close, close + 1.0, close - 1.0, close, 1.0).unwrap()
}

fn fast_sync() -> SyncConfig {
    SyncConfig {
        poll_period_ms: 5,
        chunk_size: 20,
        retry: RetryPolicy::Exponential { max_delay_ms: 40 },
        ..SyncConfig::default()
    }
}

struct Harness {
    clock: Arc<SimClock>,
    exchange: Arc<ReplayExchange>,
    pipeline: IntegrationPipeline<()>,
    shutdown: CancellationToken,
    store: Arc<CandleStore>,
}

impl Harness {
    async fn new() -> Self {
        let clock = Arc::new(SimClock::new(10 * MINUTE + 30_000));
        let exchange = Arc::new(ReplayExchange::new("replay"));
        exchange.push_candles(key(), (0..=10).map(|i| candle(i * MINUTE, 20.0 + i as f64)));
        let pool = database::connect_in_memory().await.unwrap();
        let store = CandleStore::open(key(), pool, clock.clone(), 86_400_000).await.unwrap();
        Self {
            clock,
            exchange,
            pipeline: IntegrationPipeline::new(()),
            shutdown: CancellationToken::new(),
            store,
        }
    }

    fn context(&self) -> SyncContext<()> {
        SyncContext {
            exchange: self.exchange.clone() as Arc<dyn Exchange>,
            pipeline: self.pipeline.handle(),
            shutdown: self.shutdown.clone(),
            config: fast_sync(),
        }
    }

    /// Drains the pipeline until the store holds `expected` candles.
    async fn drain_until_count(&self, expected: usize) {
        for _ in 0..400 {
            self.pipeline.drain().await;
            if self.store.count().await.unwrap() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("store never reached {expected} candles");
    }
}

#[tokio::test]
async fn worker_backfills_through_the_pipeline() {
    let harness = Harness::new().await;
    assert!(harness.store.data_syncing());

    let _lease = harness.store.acquire(&harness.context());
    assert!(harness.store.worker_running());

    harness.drain_until_count(11).await;
    assert_eq!(harness.store.newest().await.unwrap().unwrap().timestamp, 10 * MINUTE);
    assert!(!harness.store.data_syncing());
}

#[tokio::test]
async fn nothing_reaches_the_store_without_a_drain() {
    let harness = Harness::new().await;
    let _lease = harness.store.acquire(&harness.context());

    for _ in 0..100 {
        if harness.pipeline.pending() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(harness.pipeline.pending() > 0);
    assert_eq!(harness.store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn worker_follows_new_and_forming_candles() {
    let harness = Harness::new().await;
    let _lease = harness.store.acquire(&harness.context());
    harness.drain_until_count(11).await;

    harness.clock.set(11 * MINUTE + 10_000);
    harness.exchange.push_candles(key(), [candle(11 * MINUTE, 31.0)]);
    harness.drain_until_count(12).await;

    harness
        .exchange
        .push_candles(key(), [Candle::new(11 * MINUTE, 31.0, 40.0, 30.0, 39.0, 6.0).unwrap()]);
    for _ in 0..400 {
        harness.pipeline.drain().await;
        if harness.store.newest().await.unwrap().unwrap().high == 40.0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let newest = harness.store.newest().await.unwrap().unwrap();
    assert_eq!(newest.high, 40.0);
    assert_eq!(newest.close, 39.0);
    assert_eq!(harness.store.count().await.unwrap(), 12);
}

#[tokio::test]
async fn cold_worker_takes_its_cursor_from_the_draining_context() {
    let harness = Harness::new().await;
    let recent = (5..=8).map(|i| candle(i * MINUTE, 20.0 + i as f64)).collect();
    harness.store.add_batch(recent).await.unwrap();
    // A backfill drops every memoised scalar.
    assert_eq!(harness.store.add_one(candle(0, 20.0)).await.unwrap(), DataChangeKind::Other);

    let _lease = harness.store.acquire(&harness.context());
    tokio::time::sleep(Duration::from_millis(40)).await;

    // Only the cursor request is queued; the worker has not polled yet.
    assert_eq!(harness.pipeline.pending(), 1);
    assert_eq!(harness.exchange.candle_fetches(), 0);

    // Resumes after 8:00 instead of backfilling a whole chunk.
    harness.drain_until_count(7).await;
    let stored: Vec<i64> = harness
        .store
        .candles_by_index(0, 20)
        .await
        .unwrap()
        .iter()
        .map(|c| c.timestamp)
        .collect();
    assert_eq!(stored, vec![0, 5 * MINUTE, 6 * MINUTE, 7 * MINUTE, 8 * MINUTE, 9 * MINUTE, 10 * MINUTE]);
}

#[tokio::test]
async fn worker_retries_after_failures() {
    let harness = Harness::new().await;
    harness.exchange.fail_next(2);

    let _lease = harness.store.acquire(&harness.context());
    harness.drain_until_count(11).await;

    assert!(harness.exchange.candle_fetches() >= 3);
}

#[tokio::test]
async fn worker_lives_as_long_as_its_leases() {
    let harness = Harness::new().await;
    let ctx = harness.context();

    let first = harness.store.acquire(&ctx);
    let second = harness.store.acquire(&ctx);
    assert_eq!(harness.store.lease_count(), 2);
    assert!(harness.store.worker_running());

    drop(first);
    assert_eq!(harness.store.lease_count(), 1);
    assert!(harness.store.worker_running());

    drop(second);
    assert_eq!(harness.store.lease_count(), 0);
    assert!(!harness.store.worker_running());

    let _again = harness.store.acquire(&ctx);
    assert!(harness.store.worker_running());
}

#[tokio::test]
async fn instrument_lease_keeps_the_worker_alive() {
    let harness = Harness::new().await;
    let lease = harness.store.acquire(&harness.context());
    let instrument = Instrument::new(&harness.store, harness.clock.clone(), 10).with_lease(lease);
    assert!(harness.store.worker_running());

    drop(instrument);

    assert!(!harness.store.worker_running());
}

#[tokio::test]
async fn shutdown_stops_every_worker() {
    let harness = Harness::new().await;
    let _lease = harness.store.acquire(&harness.context());
    assert!(harness.store.worker_running());

    harness.shutdown.cancel();
    harness.shutdown.cancel();

    assert!(!harness.store.worker_running());
    let fetches = harness.exchange.candle_fetches();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(harness.exchange.candle_fetches() <= fetches + 1);
}

#[tokio::test]
async fn simulation_mode_stops_and_blocks_the_worker() {
    let harness = Harness::new().await;
    let lease = harness.store.acquire(&harness.context());
    assert!(harness.store.worker_running());

    harness.store.enter_simulation();
    assert!(!harness.store.worker_running());
    drop(lease);

    let _another = harness.store.acquire(&harness.context());
    assert!(!harness.store.worker_running());
}
