use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle returned by [`crate::FundBalance::hold`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HoldId(pub(crate) u64);

impl fmt::Display for HoldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// When a hold stops reserving balance. Expiry is pull based: it is evaluated
/// against the fund's `last_updated` whenever the fund prunes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldExpiry {
    /// Until released.
    Manual,
    /// While the fund's last update is older than this timestamp.
    BeforeTimestamp(i64),
    /// Until the fund is updated past the `last_updated` seen when the hold was made.
    UntilNextUpdate { seen: i64 },
}

impl HoldExpiry {
    pub fn still_needed(&self, last_updated: i64) -> bool {
        match *self {
            HoldExpiry::Manual => true,
            HoldExpiry::BeforeTimestamp(t0) => last_updated < t0,
            HoldExpiry::UntilNextUpdate { seen } => last_updated <= seen,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hold {
    pub id: HoldId,
    pub volume: Decimal,
    pub expiry: HoldExpiry,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_policies() {
        assert!(HoldExpiry::Manual.still_needed(i64::MAX));

        let before = HoldExpiry::BeforeTimestamp(100);
        assert!(before.still_needed(99));
        assert!(!before.still_needed(100));

        let next = HoldExpiry::UntilNextUpdate { seen: 50 };
        assert!(next.still_needed(50));
        assert!(!next.still_needed(51));
    }

    #[test]
    fn expiry_serializes_as_a_tagged_variant() {
        let json = serde_json::to_string(&HoldExpiry::BeforeTimestamp(7)).unwrap();
        assert_eq!(json, r#"{"before_timestamp":7}"#);
        let back: HoldExpiry = serde_json::from_str(r#"{"until_next_update":{"seen":3}}"#).unwrap();
        assert_eq!(back, HoldExpiry::UntilNextUpdate { seen: 3 });
        assert_eq!(serde_json::to_string(&HoldExpiry::Manual).unwrap(), r#""manual""#);
    }
}
