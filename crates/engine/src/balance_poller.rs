use crate::error::EngineError;
use crate::state::MarketState;
use api_client::Exchange;
use futures::FutureExt;
use pipeline::PipelineHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

/// Keeps the ledgers in line with the exchange.
///
/// Runs as a background task: every period it fetches the exchange's balance
/// snapshots and queues their integration on the pipeline. It never touches the
/// ledgers itself.
pub struct BalancePoller {
    exchange: Arc<dyn Exchange>,
    pipeline: PipelineHandle<MarketState>,
    period: Duration,
    cancel: CancellationToken,
}

impl BalancePoller {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        pipeline: PipelineHandle<MarketState>,
        period: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            exchange,
            pipeline,
            period,
            cancel,
        }
    }

    /// Fetches one round of snapshots and queues them. Returns how many were queued.
    pub async fn poll_once(&self) -> Result<usize, EngineError> {
        let snapshots = self.exchange.balance_snapshots().await?;
        let queued = snapshots.len();
        if queued == 0 {
            return Ok(0);
        }

        self.pipeline.submit(move |state: &mut MarketState| {
            async move {
                for snapshot in &snapshots {
                    let changes = state.integrate_snapshot(snapshot)?;
                    for (coin, fund) in &changes.added {
                        tracing::debug!(%coin, %fund, "Fund funded from balance snapshot.");
                    }
                }
                anyhow::Ok(())
            }
            .boxed()
        });
        Ok(queued)
    }

    /// Polls until cancelled. The first poll happens immediately.
    pub async fn run(self) {
        tracing::info!(exchange = %self.exchange.name(), period = ?self.period, "Starting balance poller.");
        let mut timer = interval(self.period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = timer.tick() => {}
            }

            match self.poll_once().await {
                Ok(queued) => tracing::trace!(queued, "Queued balance snapshots."),
                Err(error) => tracing::warn!(error = %error, "Balance poll failed; retrying next period."),
            }
        }
        tracing::info!(exchange = %self.exchange.name(), "Balance poller stopped.");
    }
}
