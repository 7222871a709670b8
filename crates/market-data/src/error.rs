use core_types::CoreError;
use database::DbError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MarketDataError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Invalid candle data: {0}")]
    Core(#[from] CoreError),

    #[error("Index {index} is out of range for an instrument with {count} candles")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("The candle store behind this instrument has been dropped")]
    StoreClosed,

    #[error("Candle rejected: {0}")]
    Rejected(String),
}
