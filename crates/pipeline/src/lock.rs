use crate::error::PipelineError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

/// Guards the shared market state.
///
/// The drain loop holds it while applying queued updates; any other task that
/// wants a consistent view of the state takes it for the duration of the read.
pub struct MarketDataLock<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> Clone for MarketDataLock<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> MarketDataLock<S> {
    pub fn new(state: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, S> {
        self.inner.lock().await
    }

    /// Non-blocking attempt.
    pub fn try_lock(&self) -> Result<MutexGuard<'_, S>, PipelineError> {
        self.inner.try_lock().map_err(|_| PipelineError::LockBusy)
    }

    /// Waits at most `timeout`. A zero timeout is a pure probe and never yields.
    pub async fn try_lock_for(&self, timeout: Duration) -> Result<MutexGuard<'_, S>, PipelineError> {
        if timeout.is_zero() {
            return self.try_lock();
        }
        tokio::time::timeout(timeout, self.inner.lock())
            .await
            .map_err(|_| PipelineError::LockTimeout(timeout))
    }

    /// True when somebody currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}
