use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of a virtual sub-partition of a coin balance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FundId(pub String);

impl FundId {
    pub const MAIN: &'static str = "Main";

    pub fn main() -> Self {
        FundId(Self::MAIN.to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        FundId(id.into())
    }

    pub fn is_main(&self) -> bool {
        self.0 == Self::MAIN
    }
}

impl fmt::Display for FundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The exchange's authoritative view of one coin, which always belongs to the Main fund.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub coin: String,
    pub total: Decimal,
    pub held_on_exchange: Decimal,
    /// Time the snapshot was taken, in milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// How much of Main's available balance a new fund receives.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundAllocation {
    Amount(Decimal),
    Fraction(Decimal),
}
