use crate::error::EngineError;
use configuration::FundConfig;
use core_types::{BalanceSnapshot, FundId, OrderBook, OrderSide, SeriesKey};
use ledger::{Balances, HoldExpiry, HoldId, InvariantPolicy, LedgerError};
use market_data::CandleStore;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Outcome of reconciling the ledgers with the configured fund list.
#[derive(Debug, Default, PartialEq)]
pub struct FundChanges {
    pub added: Vec<(String, FundId)>,
    pub removed: Vec<(String, FundId)>,
    /// Funds that could not be created yet, typically because Main is short.
    pub deferred: Vec<(String, FundId, LedgerError)>,
}

/// All shared market state of one exchange: candle stores and per-coin ledgers.
///
/// Owned by the designated context. Background tasks reach it only through the
/// integration pipeline; other readers go through the market data lock.
pub struct MarketState {
    stores: HashMap<SeriesKey, Arc<CandleStore>>,
    balances: BTreeMap<String, Balances>,
    funds: Vec<FundConfig>,
    policy: InvariantPolicy,
}

impl MarketState {
    pub fn new(policy: InvariantPolicy, funds: Vec<FundConfig>) -> Self {
        Self {
            stores: HashMap::new(),
            balances: BTreeMap::new(),
            funds,
            policy,
        }
    }

    // --- Candle stores ---

    pub fn store(&self, key: &SeriesKey) -> Option<&Arc<CandleStore>> {
        self.stores.get(key)
    }

    /// Registers `store` unless one is already known for its key; returns the one kept.
    pub fn register_store(&mut self, store: Arc<CandleStore>) -> Arc<CandleStore> {
        Arc::clone(self.stores.entry(store.key().clone()).or_insert(store))
    }

    pub fn stores(&self) -> impl Iterator<Item = &Arc<CandleStore>> {
        self.stores.values()
    }

    // --- Ledgers ---

    pub fn balances(&self, coin: &str) -> Option<&Balances> {
        self.balances.get(coin)
    }

    /// The ledger for `coin`, created empty on first use.
    pub fn balances_mut(&mut self, coin: &str) -> &mut Balances {
        let policy = self.policy;
        self.balances
            .entry(coin.to_string())
            .or_insert_with(|| Balances::new(coin, policy))
    }

    pub fn coins(&self) -> impl Iterator<Item = &str> {
        self.balances.keys().map(String::as_str)
    }

    /// Integrates an exchange balance snapshot, then creates any configured fund that
    /// the coin can now afford.
    pub fn integrate_snapshot(&mut self, snapshot: &BalanceSnapshot) -> Result<FundChanges, EngineError> {
        self.balances_mut(&snapshot.coin).update(snapshot)?;
        let mut changes = FundChanges::default();
        self.add_configured_funds(&snapshot.coin, &mut changes);
        Ok(changes)
    }

    /// Replaces the configured fund list: de-configured funds fold back into Main and
    /// new ones are carved out of it.
    pub fn apply_fund_config(&mut self, funds: Vec<FundConfig>) -> FundChanges {
        self.funds = funds;
        let mut changes = FundChanges::default();
        let coins: Vec<String> = self.balances.keys().cloned().collect();

        for coin in &coins {
            let stale: Vec<FundId> = self.balances[coin]
                .fund_ids()
                .filter(|id| !id.is_main() && !self.is_configured(coin, id))
                .cloned()
                .collect();
            for id in stale {
                match self.balances_mut(coin).remove_fund(&id) {
                    Ok(_) => changes.removed.push((coin.clone(), id)),
                    Err(error) => tracing::warn!(%coin, fund = %id, %error, "Could not remove fund."),
                }
            }
            self.add_configured_funds(coin, &mut changes);
        }
        changes
    }

    fn is_configured(&self, coin: &str, id: &FundId) -> bool {
        self.funds.iter().any(|fund| fund.coin == coin && &fund.fund_id == id)
    }

    fn add_configured_funds(&mut self, coin: &str, changes: &mut FundChanges) {
        let missing: Vec<FundConfig> = self
            .funds
            .iter()
            .filter(|fund| fund.coin == coin)
            .filter(|fund| self.balances.get(coin).is_none_or(|ledger| ledger.fund(&fund.fund_id).is_none()))
            .cloned()
            .collect();

        for fund in missing {
            match self.balances_mut(coin).add_fund(fund.fund_id.clone(), fund.allocation) {
                Ok(amount) => {
                    tracing::info!(%coin, fund = %fund.fund_id, %amount, "Configured fund created.");
                    changes.added.push((coin.to_string(), fund.fund_id));
                }
                Err(error @ LedgerError::InsufficientFunds { .. }) => {
                    tracing::debug!(%coin, fund = %fund.fund_id, %error, "Configured fund deferred.");
                    changes.deferred.push((coin.to_string(), fund.fund_id, error));
                }
                Err(error) => {
                    tracing::warn!(%coin, fund = %fund.fund_id, %error, "Configured fund rejected.");
                    changes.deferred.push((coin.to_string(), fund.fund_id, error));
                }
            }
        }
    }

    /// Reserves what an order of `volume` base units will consume from `fund`.
    ///
    /// Buys hold the quote coin at the best ask; sells hold the base coin.
    pub fn hold_for_order(
        &mut self,
        fund: &FundId,
        side: OrderSide,
        volume: Decimal,
        book: &dyn OrderBook,
        expiry: HoldExpiry,
    ) -> Result<(String, HoldId), EngineError> {
        let pair = book.pair();
        let (coin, amount) = match side {
            OrderSide::Buy => {
                let ask = book
                    .best_ask()
                    .and_then(|ask| Decimal::try_from(ask).ok())
                    .filter(|ask| *ask > Decimal::ZERO)
                    .ok_or_else(|| EngineError::NoPrice(pair.clone()))?;
                (pair.quote.clone(), volume * ask)
            }
            OrderSide::Sell => (pair.base.clone(), volume),
        };

        let ledger = self
            .balances
            .get_mut(&coin)
            .ok_or_else(|| EngineError::UnknownCoin(coin.clone()))?;
        let balance = ledger
            .fund_mut(fund)
            .ok_or_else(|| LedgerError::FundNotFound(fund.clone()))?;
        let id = balance.hold(amount, expiry)?;
        Ok((coin, id))
    }
}
