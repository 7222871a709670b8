use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("The market data lock is held elsewhere")]
    LockBusy,

    #[error("Timed out after {0:?} waiting for the market data lock")]
    LockTimeout(Duration),
}
