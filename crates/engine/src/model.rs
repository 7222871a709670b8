use crate::balance_poller::BalancePoller;
use crate::error::EngineError;
use crate::state::MarketState;
use api_client::Exchange;
use configuration::{Config, SyncConfig};
use core_types::{Clock, SeriesKey, Timeframe, TradePair};
use database::SqlitePool;
use ledger::InvariantPolicy;
use market_data::{CandleStore, Instrument, SyncContext};
use pipeline::{IntegrationPipeline, MarketDataLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The live model of one exchange.
///
/// Owns the exchange capability, the clock, the per-pair databases and the
/// integration pipeline over [`MarketState`]. Background tasks (refresh workers and
/// the balance poller) only submit to the pipeline; [`ExchangeModel::run`] drains it
/// on the designated context.
pub struct ExchangeModel {
    exchange: Arc<dyn Exchange>,
    clock: Arc<dyn Clock>,
    data_dir: PathBuf,
    sync: SyncConfig,
    pipeline: Arc<IntegrationPipeline<MarketState>>,
    shutdown: CancellationToken,
    pools: Mutex<HashMap<TradePair, SqlitePool>>,
}

impl ExchangeModel {
    pub fn new(exchange: Arc<dyn Exchange>, clock: Arc<dyn Clock>, config: &Config) -> Self {
        let state = MarketState::new(InvariantPolicy::from(&config.ledger), config.funds.clone());
        Self {
            exchange,
            clock,
            data_dir: config.database.data_dir.clone(),
            sync: config.sync.clone(),
            pipeline: Arc::new(IntegrationPipeline::new(state)),
            shutdown: CancellationToken::new(),
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn exchange_name(&self) -> &str {
        self.exchange.name()
    }

    pub fn pipeline(&self) -> &Arc<IntegrationPipeline<MarketState>> {
        &self.pipeline
    }

    pub fn market_data_lock(&self) -> &MarketDataLock<MarketState> {
        self.pipeline.market_data_lock()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// What a refresh worker started by this model runs with.
    pub fn sync_context(&self) -> SyncContext<MarketState> {
        SyncContext {
            exchange: Arc::clone(&self.exchange),
            pipeline: self.pipeline.handle(),
            shutdown: self.shutdown.clone(),
            config: self.sync.clone(),
        }
    }

    /// The store for `pair` at `timeframe`, opening the pair's database on first use.
    pub async fn store(&self, pair: &TradePair, timeframe: Timeframe) -> Result<Arc<CandleStore>, EngineError> {
        let key = SeriesKey::new(pair.clone(), timeframe);
        if let Some(store) = self.market_data_lock().lock().await.store(&key) {
            return Ok(Arc::clone(store));
        }

        let pool = self.pool_for(pair).await?;
        let store = CandleStore::open(key, pool, Arc::clone(&self.clock), self.sync.max_future_ms).await?;

        let mut state = self.market_data_lock().lock().await;
        Ok(state.register_store(store))
    }

    /// An instrument over `pair` at `timeframe` that keeps the store's refresh worker
    /// running for as long as it lives.
    pub async fn instrument(&self, pair: &TradePair, timeframe: Timeframe) -> Result<Instrument, EngineError> {
        let store = self.store(pair, timeframe).await?;
        let lease = store.acquire(&self.sync_context());
        Ok(Instrument::new(&store, Arc::clone(&self.clock), self.sync.chunk_size).with_lease(lease))
    }

    async fn pool_for(&self, pair: &TradePair) -> Result<SqlitePool, EngineError> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(pair) {
            return Ok(pool.clone());
        }
        let path = database::pair_database_path(&self.data_dir, self.exchange.name(), pair);
        let pool = database::connect(&path).await?;
        tracing::info!(%pair, path = %path.display(), "Opened pair database.");
        pools.insert(pair.clone(), pool.clone());
        Ok(pool)
    }

    /// Starts polling exchange balances into the ledgers.
    pub fn spawn_balance_poller(&self) -> JoinHandle<()> {
        let poller = BalancePoller::new(
            Arc::clone(&self.exchange),
            self.pipeline.handle(),
            self.sync.balance_poll(),
            self.shutdown.child_token(),
        );
        tokio::spawn(poller.run())
    }

    /// Drains the integration pipeline until [`ExchangeModel::shutdown`] is called.
    pub async fn run(&self) {
        tracing::info!(exchange = %self.exchange.name(), "Exchange model running.");
        self.pipeline.run(self.sync.drain_tick(), self.shutdown.clone()).await;
        tracing::info!(exchange = %self.exchange.name(), "Exchange model stopped.");
    }

    /// Stops the drain loop, every refresh worker and the balance poller. Idempotent.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!(exchange = %self.exchange.name(), "Shutting down exchange model.");
            self.shutdown.cancel();
        }
    }
}
