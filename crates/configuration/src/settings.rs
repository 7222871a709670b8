use crate::error::ConfigError;
use core_types::{FundAllocation, FundId};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// The root configuration structure for the entire application.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Bot-owned funds carved out of each coin's Main fund.
    #[serde(default)]
    pub funds: Vec<FundConfig>,
}

/// Where the per-pair candle databases live.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub data_dir: PathBuf,
}

/// Cadences and sizes for the market-data synchronisation machinery.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Sleep between two exchange polls of one candle series.
    pub poll_period_ms: u64,
    /// Tick of the integration pipeline drain loop.
    pub drain_tick_ms: u64,
    /// Number of candles an Instrument pages in at a time.
    pub chunk_size: usize,
    /// Sleep between two balance snapshot fetches.
    pub balance_poll_ms: u64,
    /// Candles stamped further than this into the future are dropped.
    pub max_future_ms: i64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// What a refresh worker does after a failed fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Retry on the next regular poll.
    Fixed,
    /// Double the poll period for every consecutive failure, up to `max_delay_ms`.
    Exponential { max_delay_ms: u64 },
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Slack allowed for decimal truncation when checking invariants.
    pub epsilon: Decimal,
    /// Panic on an invariant violation instead of logging it.
    pub strict_invariants: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG` when set.
    pub level: String,
    /// Directory for the daily rolling log file. Console only when absent.
    pub directory: Option<PathBuf>,
}

/// One configured fund for a coin.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FundConfig {
    pub coin: String,
    pub fund_id: FundId,
    pub allocation: FundAllocation,
}

// --- Default Implementations ---
// This allows a user to omit whole sections from their toml
// and still have it work with sensible defaults.

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_period_ms: 10_000,
            drain_tick_ms: 10,
            chunk_size: 10_000,
            balance_poll_ms: 30_000,
            max_future_ms: 86_400_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Exponential {
            max_delay_ms: 300_000,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            epsilon: dec!(0.00000001),
            strict_invariants: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
        }
    }
}

impl SyncConfig {
    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }

    pub fn drain_tick(&self) -> Duration {
        Duration::from_millis(self.drain_tick_ms)
    }

    pub fn balance_poll(&self) -> Duration {
        Duration::from_millis(self.balance_poll_ms)
    }
}

impl RetryPolicy {
    /// Delay before the next poll given the number of consecutive failures.
    pub fn delay(&self, poll_period: Duration, failures: u32) -> Duration {
        match self {
            RetryPolicy::Fixed => poll_period,
            RetryPolicy::Exponential { max_delay_ms } => {
                let factor = 1u32.checked_shl(failures.min(31)).unwrap_or(u32::MAX);
                let delay = poll_period.saturating_mul(factor);
                delay.min(Duration::from_millis(*max_delay_ms).max(poll_period))
            }
        }
    }
}

impl Config {
    /// Rejects settings that would make the sync loops spin or the ledger misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.poll_period_ms == 0 {
            return Err(ConfigError::ValidationError("sync.poll_period_ms must be positive".into()));
        }
        if self.sync.drain_tick_ms == 0 {
            return Err(ConfigError::ValidationError("sync.drain_tick_ms must be positive".into()));
        }
        if self.sync.balance_poll_ms == 0 {
            return Err(ConfigError::ValidationError("sync.balance_poll_ms must be positive".into()));
        }
        if self.sync.chunk_size == 0 {
            return Err(ConfigError::ValidationError("sync.chunk_size must be positive".into()));
        }
        if self.ledger.epsilon.is_sign_negative() {
            return Err(ConfigError::ValidationError("ledger.epsilon must not be negative".into()));
        }
        for fund in &self.funds {
            if fund.fund_id.is_main() {
                return Err(ConfigError::ValidationError(format!(
                    "fund '{}' for {} cannot be configured explicitly",
                    fund.fund_id, fund.coin
                )));
            }
            match fund.allocation {
                FundAllocation::Fraction(f) if f <= Decimal::ZERO || f > Decimal::ONE => {
                    return Err(ConfigError::ValidationError(format!(
                        "fund '{}' fraction {} must be in (0, 1]",
                        fund.fund_id, f
                    )));
                }
                FundAllocation::Amount(a) if a <= Decimal::ZERO => {
                    return Err(ConfigError::ValidationError(format!(
                        "fund '{}' amount {} must be positive",
                        fund.fund_id, a
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_retry_doubles_and_caps() {
        let policy = RetryPolicy::Exponential { max_delay_ms: 5_000 };
        let poll = Duration::from_millis(1_000);
        assert_eq!(policy.delay(poll, 0), Duration::from_millis(1_000));
        assert_eq!(policy.delay(poll, 1), Duration::from_millis(2_000));
        assert_eq!(policy.delay(poll, 2), Duration::from_millis(4_000));
        assert_eq!(policy.delay(poll, 3), Duration::from_millis(5_000));
        assert_eq!(policy.delay(poll, 40), Duration::from_millis(5_000));
    }

    #[test]
    fn fixed_retry_keeps_the_poll_period() {
        let poll = Duration::from_millis(750);
        assert_eq!(RetryPolicy::Fixed.delay(poll, 9), poll);
    }

    #[test]
    fn validation_rejects_bad_fractions_and_main() {
        let mut config = Config::default();
        config.funds.push(FundConfig {
            coin: "USDT".into(),
            fund_id: FundId::new("bot1"),
            allocation: FundAllocation::Fraction(dec!(1.5)),
        });
        assert!(config.validate().is_err());

        config.funds[0].allocation = FundAllocation::Fraction(dec!(0.3));
        assert!(config.validate().is_ok());

        config.funds[0].fund_id = FundId::main();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_zero_chunk_size() {
        let mut config = Config::default();
        config.sync.chunk_size = 0;
        assert!(config.validate().is_err());
    }
}
