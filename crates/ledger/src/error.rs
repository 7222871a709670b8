use crate::hold::HoldId;
use core_types::FundId;
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("Fund {fund} has {available} available, {requested} requested")]
    InsufficientFunds {
        fund: FundId,
        requested: Decimal,
        available: Decimal,
    },

    #[error("Amount must be positive, got {0}")]
    InvalidAmount(Decimal),

    #[error("Fund {0} already exists")]
    FundExists(FundId),

    #[error("Fund {0} does not exist")]
    FundNotFound(FundId),

    #[error("The Main fund cannot be created, removed or allocated")]
    MainFundReserved,

    #[error("Cannot transfer from fund {0} to itself")]
    SameFund(FundId),

    #[error("Hold {0} does not exist")]
    HoldNotFound(HoldId),

    #[error("Snapshot for {got} applied to the {expected} ledger")]
    CoinMismatch { expected: String, got: String },

    #[error("Ledger invariant violated for {coin}/{fund}: {detail}")]
    InvariantViolation {
        coin: String,
        fund: FundId,
        detail: String,
    },
}
