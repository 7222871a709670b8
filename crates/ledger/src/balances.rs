use crate::error::LedgerError;
use crate::fund_balance::FundBalance;
use configuration::LedgerConfig;
use core_types::{BalanceSnapshot, FundAllocation, FundId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How invariant violations are surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantPolicy {
    /// Slack for decimal truncation.
    pub epsilon: Decimal,
    /// Panic on a violation instead of logging it.
    pub strict: bool,
}

impl From<&LedgerConfig> for InvariantPolicy {
    fn from(config: &LedgerConfig) -> Self {
        Self {
            epsilon: config.epsilon,
            strict: config.strict_invariants,
        }
    }
}

impl Default for InvariantPolicy {
    fn default() -> Self {
        Self::from(&LedgerConfig::default())
    }
}

/// The funds of one coin on one exchange.
///
/// `Main` always exists and is the only fund that tracks exchange truth. Every other
/// fund keeps a locally decided balance carved out of Main, so the totals of all funds
/// add up to what the exchange reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balances {
    coin: String,
    main: FundBalance,
    /// Every fund except Main.
    others: BTreeMap<FundId, FundBalance>,
    policy: InvariantPolicy,
}

impl Balances {
    pub fn new(coin: impl Into<String>, policy: InvariantPolicy) -> Self {
        let coin = coin.into();
        Self {
            main: FundBalance::new(FundId::main(), coin.clone()).with_policy(policy),
            coin,
            others: BTreeMap::new(),
            policy,
        }
    }

    pub fn coin(&self) -> &str {
        &self.coin
    }

    pub fn policy(&self) -> InvariantPolicy {
        self.policy
    }

    pub fn main(&self) -> &FundBalance {
        &self.main
    }

    pub fn main_mut(&mut self) -> &mut FundBalance {
        &mut self.main
    }

    pub fn fund(&self, id: &FundId) -> Option<&FundBalance> {
        if id.is_main() { Some(&self.main) } else { self.others.get(id) }
    }

    pub fn fund_mut(&mut self, id: &FundId) -> Option<&mut FundBalance> {
        if id.is_main() { Some(&mut self.main) } else { self.others.get_mut(id) }
    }

    /// Main first, then the other funds by id.
    pub fn funds(&self) -> impl Iterator<Item = &FundBalance> {
        std::iter::once(&self.main).chain(self.others.values())
    }

    fn funds_mut(&mut self) -> impl Iterator<Item = &mut FundBalance> {
        std::iter::once(&mut self.main).chain(self.others.values_mut())
    }

    pub fn fund_ids(&self) -> impl Iterator<Item = &FundId> {
        self.funds().map(FundBalance::fund_id)
    }

    /// Integrates the exchange's view of the coin.
    ///
    /// Main absorbs the exchange totals minus whatever the other funds own. The other
    /// funds keep their totals and only take the new timestamp, which expires their
    /// holds. Main may go negative if the other funds were over-allocated; that is
    /// reported, not corrected.
    pub fn update(&mut self, snapshot: &BalanceSnapshot) -> Result<(), LedgerError> {
        if snapshot.coin != self.coin {
            return Err(LedgerError::CoinMismatch {
                expected: self.coin.clone(),
                got: snapshot.coin.clone(),
            });
        }

        let (others_total, others_held) = self
            .others
            .values()
            .fold((Decimal::ZERO, Decimal::ZERO), |(total, held), fund| {
                (total + fund.total(), held + fund.held_on_exchange())
            });

        self.main
            .set_amounts(snapshot.total - others_total, snapshot.held_on_exchange - others_held);
        for fund in self.funds_mut() {
            fund.set_last_updated(snapshot.timestamp);
        }

        tracing::debug!(coin = %self.coin, total = %snapshot.total, held = %snapshot.held_on_exchange, "Integrated balance snapshot.");
        self.assert_valid();
        Ok(())
    }

    /// Carves a new fund out of Main's available balance. Returns the amount moved.
    pub fn add_fund(&mut self, id: FundId, allocation: FundAllocation) -> Result<Decimal, LedgerError> {
        if id.is_main() {
            return Err(LedgerError::MainFundReserved);
        }
        if self.others.contains_key(&id) {
            return Err(LedgerError::FundExists(id));
        }

        let main = &mut self.main;
        let available = main.available();
        let amount = match allocation {
            FundAllocation::Amount(amount) => amount,
            FundAllocation::Fraction(fraction) => {
                if fraction <= Decimal::ZERO || fraction > Decimal::ONE {
                    return Err(LedgerError::InvalidAmount(fraction));
                }
                available * fraction
            }
        };
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(amount));
        }
        if amount > available {
            return Err(LedgerError::InsufficientFunds {
                fund: FundId::main(),
                requested: amount,
                available,
            });
        }

        main.adjust_total(-amount);
        let last_updated = main.last_updated();
        let mut fund = FundBalance::new(id.clone(), self.coin.clone()).with_policy(self.policy);
        fund.set_amounts(amount, Decimal::ZERO);
        fund.set_last_updated(last_updated);
        self.others.insert(id.clone(), fund);

        tracing::info!(coin = %self.coin, fund = %id, %amount, "Created fund.");
        self.assert_valid();
        Ok(amount)
    }

    /// Folds a fund back into Main, total and exchange-held amounts alike.
    pub fn remove_fund(&mut self, id: &FundId) -> Result<FundBalance, LedgerError> {
        if id.is_main() {
            return Err(LedgerError::MainFundReserved);
        }
        let removed = self
            .others
            .remove(id)
            .ok_or_else(|| LedgerError::FundNotFound(id.clone()))?;

        let main = &mut self.main;
        let total = main.total() + removed.total();
        let held = main.held_on_exchange() + removed.held_on_exchange();
        main.set_amounts(total, held);

        tracing::info!(coin = %self.coin, fund = %id, returned = %removed.total(), "Removed fund.");
        self.assert_valid();
        Ok(removed)
    }

    /// Moves `amount` of available balance between two funds.
    pub fn transfer(&mut self, from: &FundId, to: &FundId, amount: Decimal) -> Result<(), LedgerError> {
        if from == to {
            return Err(LedgerError::SameFund(from.clone()));
        }
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(amount));
        }
        if self.fund(to).is_none() {
            return Err(LedgerError::FundNotFound(to.clone()));
        }
        let source = self
            .fund_mut(from)
            .ok_or_else(|| LedgerError::FundNotFound(from.clone()))?;
        let available = source.available();
        if amount > available {
            return Err(LedgerError::InsufficientFunds {
                fund: from.clone(),
                requested: amount,
                available,
            });
        }
        source.adjust_total(-amount);
        if let Some(target) = self.fund_mut(to) {
            target.adjust_total(amount);
        }

        tracing::info!(coin = %self.coin, %from, %to, %amount, "Transferred between funds.");
        self.assert_valid();
        Ok(())
    }

    pub fn nett_total(&self) -> Decimal {
        self.funds().map(FundBalance::total).sum()
    }

    /// Sum of what every fund can still commit. Prunes expired holds.
    pub fn nett_available(&mut self) -> Decimal {
        self.funds_mut().map(|fund| fund.available()).sum()
    }

    /// First invariant violation found, if any.
    pub fn check_invariants(&self) -> Result<(), LedgerError> {
        let epsilon = self.policy.epsilon;
        for fund in self.funds() {
            if let Some(detail) = fund.check_invariants(epsilon).into_iter().next() {
                return Err(self.violation(fund.fund_id().clone(), detail));
            }
        }

        let nett_total = self.nett_total();
        let nett_available: Decimal = self.funds().map(FundBalance::free).sum();
        if nett_available > nett_total + epsilon {
            return Err(self.violation(
                FundId::main(),
                format!("nett available {nett_available} exceeds nett total {nett_total}"),
            ));
        }
        Ok(())
    }

    /// Applies the invariant policy: panics when strict, logs otherwise.
    pub fn assert_valid(&self) {
        if let Err(error) = self.check_invariants() {
            if self.policy.strict {
                panic!("{error}");
            }
            tracing::error!(coin = %self.coin, error = %error, "Ledger invariant violated; continuing.");
        }
    }

    fn violation(&self, fund: FundId, detail: String) -> LedgerError {
        LedgerError::InvariantViolation {
            coin: self.coin.clone(),
            fund,
            detail,
        }
    }
}
