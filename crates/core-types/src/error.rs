use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("Invalid input for {0}: {1}")]
    InvalidInput(String, String),

    #[error("Cannot merge candle at {incoming} into candle at {existing}")]
    TimestampMismatch { existing: i64, incoming: i64 },

    #[error("Unknown timeframe: {0}")]
    UnknownTimeframe(String),
}
