use core_types::TradePair;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("API client error: {0}")]
    ApiClient(#[from] api_client::ApiError),

    #[error("Database error: {0}")]
    Database(#[from] database::DbError),

    #[error("Market data error: {0}")]
    MarketData(#[from] market_data::MarketDataError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger::LedgerError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] pipeline::PipelineError),

    #[error("No ledger is kept for coin '{0}'.")]
    UnknownCoin(String),

    #[error("The order book for {0} has no usable price.")]
    NoPrice(TradePair),
}
