use crate::candle_store::CandleStore;
use api_client::{ApiError, Exchange};
use configuration::SyncConfig;
use core_types::Candle;
use pipeline::PipelineHandle;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Everything a refresh worker needs from its surroundings.
///
/// `S` is the shared state type of the integration pipeline the worker reports to.
pub struct SyncContext<S> {
    pub exchange: Arc<dyn Exchange>,
    pub pipeline: PipelineHandle<S>,
    /// Process-wide cancellation; each worker runs on a child of this token.
    pub shutdown: CancellationToken,
    pub config: SyncConfig,
}

impl<S> Clone for SyncContext<S> {
    fn clone(&self) -> Self {
        Self {
            exchange: Arc::clone(&self.exchange),
            pipeline: self.pipeline.clone(),
            shutdown: self.shutdown.clone(),
            config: self.config.clone(),
        }
    }
}

struct RunningWorker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Reference count and, while it is above zero, the running worker.
#[derive(Default)]
pub(crate) struct WorkerSlot {
    pub(crate) refs: usize,
    running: Option<RunningWorker>,
}

impl WorkerSlot {
    pub(crate) fn start(&mut self, cancel: CancellationToken, handle: JoinHandle<()>) {
        self.running = Some(RunningWorker { cancel, handle });
    }

    /// Cancels the worker if one is running. Returns whether one was.
    pub(crate) fn stop(&mut self) -> bool {
        match self.running.take() {
            Some(worker) => {
                worker.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|worker| !worker.cancel.is_cancelled() && !worker.handle.is_finished())
    }
}

/// Keeps a store's refresh worker alive. Dropping the last lease stops it.
pub struct StoreLease {
    store: Weak<CandleStore>,
}

impl StoreLease {
    pub(crate) fn new(store: Weak<CandleStore>) -> Self {
        Self { store }
    }
}

impl Drop for StoreLease {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.release();
        }
    }
}

/// Polls the exchange for one series until cancelled.
///
/// The worker only keeps its own cursor; every effect on the store is queued on the
/// integration pipeline and applied by whoever drains it. `known_newest` is the
/// store's newest candle as memoised when the worker was started, if it was.
pub(crate) async fn refresh_loop<S: Send + 'static>(
    store: Arc<CandleStore>,
    known_newest: Option<Option<Candle>>,
    ctx: SyncContext<S>,
    cancel: CancellationToken,
) {
    let key = store.key().clone();
    let timeframe = key.timeframe;
    let poll_period = ctx.config.poll_period();

    let newest = match known_newest {
        Some(newest) => newest.map(|candle| candle.timestamp),
        None => match newest_on_designated_context(&store, &ctx, &cancel).await {
            Some(newest) => newest,
            None => {
                tracing::info!(series = %key, "Refresh worker cancelled before its first poll.");
                return;
            }
        },
    };
    let mut cursor = match newest {
        Some(timestamp) => timestamp,
        // Without any history, start one chunk back from now.
        None => {
            let depth = timeframe.duration_ms().saturating_mul(ctx.config.chunk_size as i64);
            timeframe.bucket_start(store.clock().now().saturating_sub(depth))
        }
    };
    let mut failures: u32 = 0;

    loop {
        let delay = if failures == 0 {
            poll_period
        } else {
            ctx.config.retry.delay(poll_period, failures)
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        let now = store.clock().now();
        match ctx.exchange.fetch_candles(&key.pair, timeframe, cursor, now, &cancel).await {
            Ok(candles) => {
                failures = 0;
                if let Some(last) = candles.last() {
                    cursor = cursor.max(last.timestamp);
                }
                tracing::debug!(series = %key, fetched = candles.len(), cursor, "Fetched candles.");
                let target = Arc::clone(&store);
                ctx.pipeline.submit_task(async move {
                    if !candles.is_empty() {
                        target.add_batch(candles).await?;
                    }
                    target.refresh_syncing().await?;
                    anyhow::Ok(())
                });
            }
            Err(ApiError::Cancelled) => break,
            Err(error) => {
                failures = failures.saturating_add(1);
                tracing::warn!(series = %key, error = %error, failures, "Candle fetch failed; will retry.");
                let target = Arc::clone(&store);
                ctx.pipeline.submit_task(async move {
                    target.refresh_syncing().await?;
                    anyhow::Ok(())
                });
            }
        }
    }

    tracing::info!(series = %key, "Refresh worker exited.");
}

/// Asks the draining context for the newest stored timestamp.
///
/// `None` when cancelled first. A failed read counts as an empty store.
async fn newest_on_designated_context<S: Send + 'static>(
    store: &Arc<CandleStore>,
    ctx: &SyncContext<S>,
    cancel: &CancellationToken,
) -> Option<Option<i64>> {
    let (reply, answer) = oneshot::channel();
    let target = Arc::clone(store);
    ctx.pipeline.submit_task(async move {
        let newest = target.newest().await.map(|newest| newest.map(|candle| candle.timestamp));
        // The worker may be gone already.
        let _ = reply.send(newest);
        anyhow::Ok(())
    });

    let newest = tokio::select! {
        _ = cancel.cancelled() => return None,
        answer = answer => answer,
    };
    match newest {
        Ok(Ok(newest)) => Some(newest),
        Ok(Err(error)) => {
            tracing::warn!(series = %store.key(), error = %error, "Could not read the newest candle; backfilling one chunk.");
            Some(None)
        }
        Err(_) => {
            tracing::warn!(series = %store.key(), "Seeding update was dropped; backfilling one chunk.");
            Some(None)
        }
    }
}
