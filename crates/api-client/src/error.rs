use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    #[error("The exchange request failed: {0}")]
    RequestFailed(String),

    #[error("The exchange request was cancelled")]
    Cancelled,

    #[error("Invalid data format from exchange: {0}")]
    InvalidData(String),
}
