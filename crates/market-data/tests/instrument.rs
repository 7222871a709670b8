use core_types::{Candle, Clock, SeriesKey, SimClock, Timeframe, TradePair, WallClock};
use market_data::{CandleStore, DataChangeKind, DataChanged, Instrument, MarketDataError};
use std::sync::Arc;

const MINUTE: i64 = 60_000;
const CHUNK: usize = 10;

fn key() -> SeriesKey {
    SeriesKey::new(TradePair::new("ETH", "BTC"), Timeframe::M1)
}

fn candle(ts: i64, close: f64) -> Candle {
    Candle::new(ts, close, close + 1.0, close - 1.0, close, 2.0).unwrap()
}

/// A store holding 25 one-minute candles starting at t = 0.
async fn seeded_store(clock: Arc<dyn Clock>) -> Arc<CandleStore> {
    let pool = database::connect_in_memory().await.unwrap();
    let store = CandleStore::open(key(), pool, clock, 86_400_000).await.unwrap();
    store
        .add_batch((0..25).map(|i| candle(i * MINUTE, 100.0 + i as f64)).collect())
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn window_pages_whole_chunks_and_only_grows() {
    let store = seeded_store(Arc::new(WallClock)).await;
    let mut instrument = Instrument::new(&store, Arc::new(WallClock), CHUNK);
    assert_eq!(instrument.count().await.unwrap(), 25);

    let mut seen = Vec::new();
    let mut previous_window = 0..0;
    for index in [0, 4, 9, 10, 17, 24] {
        seen.push(instrument.get(index).await.unwrap());
        let window = instrument.window();
        assert!(window.start <= previous_window.start || previous_window.is_empty());
        assert!(window.end >= previous_window.end);
        previous_window = window;
    }
    assert_eq!(instrument.window(), 0..25);

    for (candle, index) in seen.iter().zip([0, 4, 9, 10, 17, 24]) {
        assert_eq!(*candle, instrument.get(index).await.unwrap());
        assert_eq!(candle.timestamp, index as i64 * MINUTE);
    }
}

#[tokio::test]
async fn first_read_loads_only_the_needed_chunk() {
    let store = seeded_store(Arc::new(WallClock)).await;
    let mut instrument = Instrument::new(&store, Arc::new(WallClock), CHUNK);

    instrument.get(13).await.unwrap();
    assert_eq!(instrument.window(), 10..20);

    instrument.get(24).await.unwrap();
    assert_eq!(instrument.window(), 10..25);

    instrument.get(2).await.unwrap();
    assert_eq!(instrument.window(), 0..25);
}

#[tokio::test]
async fn reading_past_the_end_is_an_error() {
    let store = seeded_store(Arc::new(WallClock)).await;
    let mut instrument = Instrument::new(&store, Arc::new(WallClock), CHUNK);

    let error = instrument.get(25).await.unwrap_err();

    assert!(matches!(error, MarketDataError::IndexOutOfRange { index: 25, count: 25 }));
}

#[tokio::test]
async fn time_lookups() {
    let store = seeded_store(Arc::new(WallClock)).await;
    let mut instrument = Instrument::new(&store, Arc::new(WallClock), CHUNK);

    assert_eq!(instrument.index_at(-5).await.unwrap(), 0);
    assert_eq!(instrument.index_at(7 * MINUTE).await.unwrap(), 7);
    assert_eq!(instrument.index_at(7 * MINUTE + 59_999).await.unwrap(), 7);
    assert_eq!(instrument.index_at(100 * MINUTE).await.unwrap(), 24);

    let fractional = instrument.fractional_index_at(7 * MINUTE + 15_000).await.unwrap();
    assert!((fractional - 7.25).abs() < 1e-9);
    let clamped = instrument.fractional_index_at(100 * MINUTE).await.unwrap();
    assert!(clamped >= 24.0 && clamped < 25.0);
}

#[tokio::test]
async fn range_is_inclusive_and_clamped() {
    let store = seeded_store(Arc::new(WallClock)).await;
    let mut instrument = Instrument::new(&store, Arc::new(WallClock), CHUNK);

    let middle = instrument.range(3, 5).await.unwrap();
    assert_eq!(middle.iter().map(|c| c.timestamp / MINUTE).collect::<Vec<_>>(), vec![3, 4, 5]);

    assert_eq!(instrument.range(20, 100).await.unwrap().len(), 5);
    assert!(instrument.range(30, 40).await.unwrap().is_empty());
    assert!(instrument.range(6, 2).await.unwrap().is_empty());
}

#[tokio::test]
async fn empty_store_has_nothing_to_show() {
    let pool = database::connect_in_memory().await.unwrap();
    let store = CandleStore::open(key(), pool, Arc::new(WallClock), 86_400_000).await.unwrap();
    let mut instrument = Instrument::new(&store, Arc::new(WallClock), CHUNK);

    assert_eq!(instrument.count().await.unwrap(), 0);
    assert_eq!(instrument.latest().await.unwrap(), None);
    assert_eq!(instrument.index_at(1_000).await.unwrap(), 0);
    assert_eq!(instrument.fractional_index_at(1_000).await.unwrap(), 0.0);
}

#[tokio::test]
async fn new_and_current_writes_reach_the_instrument() {
    let store = seeded_store(Arc::new(WallClock)).await;
    let mut instrument = Instrument::new(&store, Arc::new(WallClock), CHUNK);
    instrument.get(24).await.unwrap();

    store.add_one(candle(25 * MINUTE, 125.0)).await.unwrap();
    assert_eq!(instrument.count().await.unwrap(), 26);
    let changes = instrument.take_changes().await.unwrap();
    assert_eq!(changes, vec![DataChanged::new(25..26, candle(25 * MINUTE, 125.0))]);
    assert_eq!(instrument.latest().await.unwrap().unwrap().timestamp, 25 * MINUTE);

    let refinement = Candle::new(25 * MINUTE, 125.0, 130.0, 124.0, 129.0, 7.0).unwrap();
    store.add_one(refinement).await.unwrap();
    let refined = instrument.get(25).await.unwrap();
    assert_eq!(refined.high, 130.0);
    assert_eq!(refined.close, 129.0);
    let changes = instrument.take_changes().await.unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].kind, DataChangeKind::Current);
    assert_eq!(changes[0].range, Some(25..26));
}

#[tokio::test]
async fn unread_changes_are_coalesced() {
    let store = seeded_store(Arc::new(WallClock)).await;
    let mut instrument = Instrument::new(&store, Arc::new(WallClock), CHUNK);
    instrument.get(24).await.unwrap();

    for i in 25..30 {
        store.add_one(candle(i * MINUTE, 100.0 + i as f64)).await.unwrap();
        instrument.count().await.unwrap();
    }
    let mut forming = candle(29 * MINUTE, 129.0);
    for step in 1..=2000 {
        let close = 129.0 + step as f64 * 0.01;
        forming = Candle::new(29 * MINUTE, 129.0, close, 128.0, close, 2.0 + step as f64).unwrap();
        store.add_one(forming).await.unwrap();
        instrument.count().await.unwrap();
    }

    let changes = instrument.take_changes().await.unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].kind, DataChangeKind::New);
    assert_eq!(changes[0].range, Some(25..30));
    let reported = changes[0].candle.unwrap();
    assert_eq!(reported.close, forming.close);
    assert_eq!(reported.volume, forming.volume);

    store.add_one(candle(30 * MINUTE, 130.0)).await.unwrap();
    store.add_one(candle(-MINUTE, 99.0)).await.unwrap();
    store.add_one(candle(31 * MINUTE, 131.0)).await.unwrap();
    assert_eq!(instrument.take_changes().await.unwrap(), vec![DataChanged::other()]);
}

#[tokio::test]
async fn backfill_rebuilds_the_window() {
    let store = seeded_store(Arc::new(WallClock)).await;
    let mut instrument = Instrument::new(&store, Arc::new(WallClock), CHUNK);
    assert_eq!(instrument.get(0).await.unwrap().timestamp, 0);

    store.add_one(candle(-MINUTE, 99.0)).await.unwrap();

    assert_eq!(instrument.take_changes().await.unwrap(), vec![DataChanged::other()]);
    assert_eq!(instrument.count().await.unwrap(), 26);
    assert_eq!(instrument.get(0).await.unwrap().timestamp, -MINUTE);
    assert_eq!(instrument.get(25).await.unwrap().timestamp, 24 * MINUTE);
}

#[tokio::test]
async fn dropped_store_is_reported() {
    let store = seeded_store(Arc::new(WallClock)).await;
    let mut instrument = Instrument::new(&store, Arc::new(WallClock), CHUNK);
    drop(store);

    assert!(matches!(instrument.count().await, Err(MarketDataError::StoreClosed)));
}

#[tokio::test]
async fn simulation_truncates_to_now_and_steps_one_bucket_at_a_time() {
    let clock = Arc::new(SimClock::new(30 * MINUTE));
    let store = seeded_store(clock.clone()).await;
    store.enter_simulation();
    let mut instrument = Instrument::new(&store, clock.clone(), CHUNK);

    let start = 10 * MINUTE + 15_000;
    clock.set(start);
    let visible = instrument.sim_reset(start, 5).await.unwrap();
    assert_eq!(visible, 11);
    assert_eq!(instrument.count().await.unwrap(), 11);
    assert!(instrument.window().start <= 6 && instrument.window().end >= 12);

    let forming = instrument.latest().await.unwrap().unwrap();
    assert_eq!(forming.timestamp, 10 * MINUTE);
    assert!(forming.volume < 2.0);
    assert!(matches!(
        instrument.get(11).await,
        Err(MarketDataError::IndexOutOfRange { index: 11, count: 11 })
    ));

    clock.set(11 * MINUTE + 1);
    instrument.sim_step(11 * MINUTE + 1).await.unwrap();
    assert_eq!(instrument.count().await.unwrap(), 12);

    clock.set(11 * MINUTE + 30_000);
    instrument.sim_step(11 * MINUTE + 30_000).await.unwrap();
    assert_eq!(instrument.count().await.unwrap(), 12);

    clock.set(20 * MINUTE + 5);
    instrument.sim_step(20 * MINUTE + 5).await.unwrap();
    assert_eq!(instrument.count().await.unwrap(), 21);

    clock.set(3 * MINUTE);
    instrument.sim_step(3 * MINUTE).await.unwrap();
    assert_eq!(instrument.count().await.unwrap(), 4);
}

#[tokio::test]
async fn simulation_step_waits_for_a_missing_candle() {
    let clock = Arc::new(SimClock::new(0));
    let pool = database::connect_in_memory().await.unwrap();
    let store = CandleStore::open(key(), pool, clock.clone(), 86_400_000).await.unwrap();
    store
        .add_batch(vec![candle(0, 1.0), candle(MINUTE, 2.0), candle(3 * MINUTE, 4.0)])
        .await
        .unwrap();
    let mut instrument = Instrument::new(&store, clock.clone(), CHUNK);

    assert_eq!(instrument.sim_reset(MINUTE + 10, 1).await.unwrap(), 2);

    clock.set(2 * MINUTE + 10);
    instrument.sim_step(2 * MINUTE + 10).await.unwrap();
    assert_eq!(instrument.count().await.unwrap(), 2);

    clock.set(3 * MINUTE + 10);
    instrument.sim_step(3 * MINUTE + 10).await.unwrap();
    assert_eq!(instrument.count().await.unwrap(), 3);
}

#[tokio::test]
async fn instruments_over_one_store_can_disagree_on_now() {
    let store = seeded_store(Arc::new(WallClock)).await;
    let early = Arc::new(SimClock::new(4 * MINUTE));
    let mut simulated = Instrument::new(&store, early, CHUNK);
    let mut live = Instrument::new(&store, Arc::new(WallClock), CHUNK);

    assert_eq!(simulated.count().await.unwrap(), 5);
    assert_eq!(live.count().await.unwrap(), 25);
}
