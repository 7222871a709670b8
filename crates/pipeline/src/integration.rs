use crate::lock::MarketDataLock;
use crossbeam_queue::SegQueue;
use futures::future::{BoxFuture, FutureExt};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// A queued effect on the shared state `S`, applied on the designated context.
pub type MarketUpdate<S> =
    Box<dyn for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, anyhow::Result<()>> + Send>;

const EVENT_CAPACITY: usize = 64;

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: usize,
    pub failed: usize,
    /// Another drain was already running; nothing was applied.
    pub skipped: bool,
}

/// Notifications bracketing every drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEvent {
    DrainBegin,
    DrainEnd(DrainReport),
}

/// The submitting side of the pipeline. Cheap to clone and safe to move into
/// background tasks.
pub struct PipelineHandle<S> {
    queue: Arc<SegQueue<MarketUpdate<S>>>,
}

impl<S> Clone for PipelineHandle<S> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<S: Send + 'static> PipelineHandle<S> {
    /// Queues an update that needs mutable access to the shared state.
    pub fn submit<F>(&self, update: F)
    where
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, anyhow::Result<()>> + Send + 'static,
    {
        self.queue.push(Box::new(update));
    }

    /// Queues an update that carries its own targets and ignores the shared state.
    pub fn submit_task<Fut>(&self, task: Fut)
    where
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.submit(move |_state: &mut S| task.boxed());
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

/// Clears the draining flag even when a drain future is dropped half way.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Single-consumer integration of background effects into shared state.
pub struct IntegrationPipeline<S> {
    queue: Arc<SegQueue<MarketUpdate<S>>>,
    lock: MarketDataLock<S>,
    draining: AtomicBool,
    events: broadcast::Sender<PipelineEvent>,
}

impl<S: Send + 'static> IntegrationPipeline<S> {
    pub fn new(state: S) -> Self {
        Self::with_lock(MarketDataLock::new(state))
    }

    pub fn with_lock(lock: MarketDataLock<S>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            queue: Arc::new(SegQueue::new()),
            lock,
            draining: AtomicBool::new(false),
            events,
        }
    }

    pub fn handle(&self) -> PipelineHandle<S> {
        PipelineHandle {
            queue: Arc::clone(&self.queue),
        }
    }

    pub fn market_data_lock(&self) -> &MarketDataLock<S> {
        &self.lock
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Applies every update queued before this call, in FIFO order.
    ///
    /// Updates submitted while the pass runs wait for the next pass. A failing or
    /// panicking update is logged and skipped; it never stops the rest of the batch.
    pub async fn drain(&self) -> DrainReport {
        if self.draining.swap(true, Ordering::AcqRel) {
            return DrainReport {
                skipped: true,
                ..DrainReport::default()
            };
        }
        let _guard = DrainGuard(&self.draining);

        let _ = self.events.send(PipelineEvent::DrainBegin);
        let batch = self.queue.len();
        let mut report = DrainReport::default();

        if batch > 0 {
            let mut state = self.lock.lock().await;
            for _ in 0..batch {
                let Some(update) = self.queue.pop() else {
                    break;
                };
                let target: &mut S = &mut *state;
                let outcome = match std::panic::catch_unwind(AssertUnwindSafe(move || update(target))) {
                    Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
                    Err(payload) => Err(payload),
                };
                match outcome {
                    Ok(Ok(())) => report.applied += 1,
                    Ok(Err(error)) => {
                        report.failed += 1;
                        tracing::error!(error = ?error, "Market update failed; skipping it.");
                    }
                    Err(payload) => {
                        report.failed += 1;
                        tracing::error!(panic = %panic_message(payload.as_ref()), "Market update panicked; skipping it.");
                    }
                }
            }
        }

        let _ = self.events.send(PipelineEvent::DrainEnd(report));
        if report.failed > 0 {
            tracing::warn!(applied = report.applied, failed = report.failed, "Drain pass finished with failures.");
        }
        report
    }

    /// Drains on every tick until `shutdown` fires, then drains once more so nothing
    /// queued before shutdown is lost.
    pub async fn run(&self, tick: Duration, shutdown: CancellationToken) {
        let mut timer = tokio::time::interval(tick);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(tick_ms = tick.as_millis() as u64, "Integration pipeline started.");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {
                    self.drain().await;
                }
            }
        }

        let report = self.drain().await;
        tracing::info!(final_applied = report.applied, "Integration pipeline stopped.");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
