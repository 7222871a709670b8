use crate::balances::InvariantPolicy;
use crate::error::LedgerError;
use crate::hold::{Hold, HoldExpiry, HoldId};
use core_types::FundId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One fund's share of a coin on one exchange, plus the local reservations against it.
///
/// `held_on_exchange` is what the exchange itself has locked (open orders); holds are
/// reservations this process made for actions still in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundBalance {
    fund_id: FundId,
    coin: String,
    total: Decimal,
    held_on_exchange: Decimal,
    last_updated: i64,
    holds: Vec<Hold>,
    next_hold: u64,
    policy: InvariantPolicy,
}

impl FundBalance {
    pub fn new(fund_id: FundId, coin: impl Into<String>) -> Self {
        Self {
            fund_id,
            coin: coin.into(),
            total: Decimal::ZERO,
            held_on_exchange: Decimal::ZERO,
            last_updated: 0,
            holds: Vec::new(),
            next_hold: 1,
            policy: InvariantPolicy::default(),
        }
    }

    /// How this fund reports its own invariant violations.
    pub fn with_policy(mut self, policy: InvariantPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn fund_id(&self) -> &FundId {
        &self.fund_id
    }

    pub fn coin(&self) -> &str {
        &self.coin
    }

    pub fn total(&self) -> Decimal {
        self.total
    }

    pub fn held_on_exchange(&self) -> Decimal {
        self.held_on_exchange
    }

    pub fn last_updated(&self) -> i64 {
        self.last_updated
    }

    pub fn holds(&self) -> &[Hold] {
        &self.holds
    }

    /// Sum of the local holds, expired ones included until the next prune.
    pub fn held_locally(&self) -> Decimal {
        self.holds.iter().map(|hold| hold.volume).sum()
    }

    pub fn held_for_trades(&self) -> Decimal {
        self.held_on_exchange + self.held_locally()
    }

    /// What can still be committed. Prunes expired holds first.
    pub fn available(&mut self) -> Decimal {
        self.prune();
        self.free()
    }

    /// Available balance as of the last prune.
    pub(crate) fn free(&self) -> Decimal {
        (self.total - self.held_for_trades()).max(Decimal::ZERO)
    }

    /// Reserves `volume`. Fails without side effects when it exceeds what is available.
    pub fn hold(&mut self, volume: Decimal, expiry: HoldExpiry) -> Result<HoldId, LedgerError> {
        if volume <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(volume));
        }
        let available = self.available();
        if volume > available {
            return Err(LedgerError::InsufficientFunds {
                fund: self.fund_id.clone(),
                requested: volume,
                available,
            });
        }

        let id = HoldId(self.next_hold);
        self.next_hold += 1;
        self.holds.push(Hold { id, volume, expiry });
        tracing::debug!(coin = %self.coin, fund = %self.fund_id, hold = %id, %volume, "Placed hold.");
        self.assert_valid();
        Ok(id)
    }

    /// A hold that lapses once the next balance snapshot has been integrated.
    pub fn hold_until_next_update(&mut self, volume: Decimal) -> Result<HoldId, LedgerError> {
        let expiry = HoldExpiry::UntilNextUpdate {
            seen: self.last_updated,
        };
        self.hold(volume, expiry)
    }

    /// Removes a hold. Returns it, or `None` if it had already expired or been released.
    pub fn release(&mut self, id: HoldId) -> Option<Hold> {
        let position = self.holds.iter().position(|hold| hold.id == id)?;
        let hold = self.holds.remove(position);
        self.assert_valid();
        Some(hold)
    }

    pub fn set_expiry(&mut self, id: HoldId, expiry: HoldExpiry) -> Result<(), LedgerError> {
        let hold = self
            .holds
            .iter_mut()
            .find(|hold| hold.id == id)
            .ok_or(LedgerError::HoldNotFound(id))?;
        hold.expiry = expiry;
        self.assert_valid();
        Ok(())
    }

    /// Moves the fund's clock and drops the holds that no longer apply.
    pub fn set_last_updated(&mut self, ts: i64) {
        self.last_updated = ts;
        self.prune();
    }

    /// Drops expired holds and returns how many were dropped.
    pub fn prune(&mut self) -> usize {
        let before = self.holds.len();
        let last_updated = self.last_updated;
        self.holds.retain(|hold| hold.expiry.still_needed(last_updated));
        before - self.holds.len()
    }

    pub(crate) fn set_amounts(&mut self, total: Decimal, held_on_exchange: Decimal) {
        self.total = total;
        self.held_on_exchange = held_on_exchange;
    }

    pub(crate) fn adjust_total(&mut self, delta: Decimal) {
        self.total += delta;
    }

    /// Applies the fund's invariant policy: panics when strict, logs otherwise.
    pub fn assert_valid(&self) {
        let Some(detail) = self.check_invariants(self.policy.epsilon).into_iter().next() else {
            return;
        };
        let error = LedgerError::InvariantViolation {
            coin: self.coin.clone(),
            fund: self.fund_id.clone(),
            detail,
        };
        if self.policy.strict {
            panic!("{error}");
        }
        tracing::error!(coin = %self.coin, fund = %self.fund_id, error = %error, "Fund invariant violated; continuing.");
    }

    /// Every per-fund violation, each within `epsilon` of slack.
    pub fn check_invariants(&self, epsilon: Decimal) -> Vec<String> {
        let mut problems = Vec::new();
        let floor = -epsilon;
        if self.total < floor {
            problems.push(format!("total {} is negative", self.total));
        }
        if self.held_on_exchange < floor {
            problems.push(format!("held on exchange {} is negative", self.held_on_exchange));
        }
        let held_for_trades = self.held_for_trades();
        if held_for_trades < floor {
            problems.push(format!("held for trades {held_for_trades} is negative"));
        }
        if held_for_trades > self.total + epsilon {
            problems.push(format!("held for trades {held_for_trades} exceeds total {}", self.total));
        }
        problems
    }
}
