use core_types::{BalanceSnapshot, FundAllocation, FundId};
use ledger::{Balances, HoldExpiry, InvariantPolicy, LedgerError};
use proptest::prelude::*;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

fn snapshot(total: Decimal, held: Decimal, timestamp: i64) -> BalanceSnapshot {
    BalanceSnapshot {
        coin: "USDT".to_string(),
        total,
        held_on_exchange: held,
        timestamp,
    }
}

fn strict() -> InvariantPolicy {
    InvariantPolicy {
        epsilon: dec!(0.00000001),
        strict: true,
    }
}

fn ledger_with_main(total: Decimal) -> Balances {
    let mut balances = Balances::new("USDT", strict());
    balances.update(&snapshot(total, Decimal::ZERO, 1)).unwrap();
    balances
}

#[test]
fn fraction_fund_round_trip() {
    let mut balances = ledger_with_main(dec!(100));
    let bot = FundId::new("bot1");

    let moved = balances.add_fund(bot.clone(), FundAllocation::Fraction(dec!(0.3))).unwrap();

    assert_eq!(moved, dec!(30));
    assert_eq!(balances.main().total(), dec!(70));
    assert_eq!(balances.fund(&bot).unwrap().total(), dec!(30));
    assert_eq!(balances.nett_total(), dec!(100));

    balances.remove_fund(&bot).unwrap();

    assert_eq!(balances.main().total(), dec!(100));
    assert!(balances.fund(&bot).is_none());
}

#[test]
fn hold_beyond_available_is_refused() {
    let mut balances = ledger_with_main(dec!(50));
    let main = balances.main_mut();

    main.hold(dec!(40), HoldExpiry::Manual).unwrap();
    let error = main.hold(dec!(20), HoldExpiry::Manual).unwrap_err();

    assert!(matches!(error, LedgerError::InsufficientFunds { requested, available, .. }
        if requested == dec!(20) && available == dec!(10)));
}

#[test]
fn update_keeps_exchange_truth_in_main() {
    let mut balances = ledger_with_main(dec!(100));
    let bot = FundId::new("bot1");
    balances.add_fund(bot.clone(), FundAllocation::Amount(dec!(25))).unwrap();

    balances.update(&snapshot(dec!(120), dec!(10), 2)).unwrap();

    assert_eq!(balances.main().total(), dec!(95));
    assert_eq!(balances.main().held_on_exchange(), dec!(10));
    assert_eq!(balances.fund(&bot).unwrap().total(), dec!(25));
    assert_eq!(balances.fund(&bot).unwrap().last_updated(), 2);
    assert_eq!(balances.nett_total(), dec!(120));
}

#[test]
fn update_expires_holds_in_every_fund() {
    let mut balances = ledger_with_main(dec!(100));
    let bot = FundId::new("bot1");
    balances.add_fund(bot.clone(), FundAllocation::Amount(dec!(40))).unwrap();
    balances.main_mut().hold(dec!(10), HoldExpiry::BeforeTimestamp(5)).unwrap();
    balances.fund_mut(&bot).unwrap().hold_until_next_update(dec!(15)).unwrap();
    assert_eq!(balances.nett_available(), dec!(75));

    balances.update(&snapshot(dec!(100), Decimal::ZERO, 5)).unwrap();

    assert_eq!(balances.main().held_locally(), dec!(0));
    assert_eq!(balances.fund(&bot).unwrap().held_locally(), dec!(0));
    assert_eq!(balances.nett_available(), dec!(100));
}

#[test]
fn over_allocation_leaves_main_negative_and_reports_it() {
    let mut balances = Balances::new("USDT", InvariantPolicy::default());
    balances.update(&snapshot(dec!(100), Decimal::ZERO, 1)).unwrap();
    balances.add_fund(FundId::new("bot1"), FundAllocation::Amount(dec!(80))).unwrap();

    balances.update(&snapshot(dec!(50), Decimal::ZERO, 2)).unwrap();

    assert_eq!(balances.main().total(), dec!(-30));
    assert!(matches!(
        balances.check_invariants(),
        Err(LedgerError::InvariantViolation { fund, .. }) if fund.is_main()
    ));
}

#[test]
#[should_panic(expected = "invariant violated")]
fn strict_policy_panics_on_violation() {
    let mut balances = ledger_with_main(dec!(100));
    balances.add_fund(FundId::new("bot1"), FundAllocation::Amount(dec!(80))).unwrap();
    let _ = balances.update(&snapshot(dec!(50), Decimal::ZERO, 2));
}

#[test]
fn fund_lifecycle_errors() {
    let mut balances = ledger_with_main(dec!(10));
    let bot = FundId::new("bot1");

    assert_eq!(
        balances.add_fund(FundId::main(), FundAllocation::Amount(dec!(1))),
        Err(LedgerError::MainFundReserved)
    );
    assert_eq!(balances.remove_fund(&FundId::main()).unwrap_err(), LedgerError::MainFundReserved);
    assert_eq!(balances.remove_fund(&bot).unwrap_err(), LedgerError::FundNotFound(bot.clone()));
    assert!(matches!(
        balances.add_fund(bot.clone(), FundAllocation::Amount(dec!(11))),
        Err(LedgerError::InsufficientFunds { .. })
    ));
    assert_eq!(
        balances.add_fund(bot.clone(), FundAllocation::Fraction(dec!(1.5))),
        Err(LedgerError::InvalidAmount(dec!(1.5)))
    );

    balances.add_fund(bot.clone(), FundAllocation::Amount(dec!(4))).unwrap();
    assert_eq!(
        balances.add_fund(bot.clone(), FundAllocation::Amount(dec!(1))),
        Err(LedgerError::FundExists(bot))
    );
}

#[test]
fn allocations_only_use_what_main_has_available() {
    let mut balances = ledger_with_main(dec!(100));
    balances.main_mut().hold(dec!(60), HoldExpiry::Manual).unwrap();

    let moved = balances.add_fund(FundId::new("half"), FundAllocation::Fraction(dec!(0.5))).unwrap();

    assert_eq!(moved, dec!(20));
    assert!(matches!(
        balances.add_fund(FundId::new("big"), FundAllocation::Amount(dec!(30))),
        Err(LedgerError::InsufficientFunds { .. })
    ));
}

#[test]
fn transfer_moves_available_balance() {
    let mut balances = ledger_with_main(dec!(100));
    let bot = FundId::new("bot1");
    balances.add_fund(bot.clone(), FundAllocation::Amount(dec!(10))).unwrap();

    balances.transfer(&FundId::main(), &bot, dec!(15)).unwrap();
    assert_eq!(balances.main().total(), dec!(75));
    assert_eq!(balances.fund(&bot).unwrap().total(), dec!(25));

    balances.fund_mut(&bot).unwrap().hold(dec!(20), HoldExpiry::Manual).unwrap();
    assert!(matches!(
        balances.transfer(&bot, &FundId::main(), dec!(10)),
        Err(LedgerError::InsufficientFunds { .. })
    ));
    assert_eq!(
        balances.transfer(&bot, &FundId::new("ghost"), dec!(1)),
        Err(LedgerError::FundNotFound(FundId::new("ghost")))
    );
}

#[test]
fn transfer_to_the_same_fund_is_rejected() {
    let mut balances = ledger_with_main(dec!(100));

    assert_eq!(
        balances.transfer(&FundId::main(), &FundId::main(), dec!(5)),
        Err(LedgerError::SameFund(FundId::main()))
    );
    assert_eq!(balances.main().total(), dec!(100));
}

#[test]
fn snapshots_for_another_coin_are_refused() {
    let mut balances = Balances::new("BTC", strict());
    let error = balances.update(&snapshot(dec!(1), Decimal::ZERO, 1)).unwrap_err();
    assert!(matches!(error, LedgerError::CoinMismatch { .. }));
}

#[derive(Debug, Clone)]
enum Op {
    Hold { fund: bool, percent: u32, manual_expiry: bool },
    Release { fund: bool, nth: usize },
    Update { total: u32, held_percent: u32 },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<bool>(), 1u32..=100, any::<bool>())
            .prop_map(|(fund, percent, manual_expiry)| Op::Hold { fund, percent, manual_expiry }),
        (any::<bool>(), 0usize..4).prop_map(|(fund, nth)| Op::Release { fund, nth }),
        (100u32..10_000, 0u32..=100).prop_map(|(total, held_percent)| Op::Update { total, held_percent }),
    ]
}

proptest! {
    #[test]
    fn valid_sequences_keep_the_ledger_consistent(ops in prop::collection::vec(op(), 1..60)) {
        let mut balances = ledger_with_main(dec!(1000));
        let bot = FundId::new("bot");
        balances.add_fund(bot.clone(), FundAllocation::Fraction(dec!(0.05))).unwrap();
        let mut clock = 1i64;

        for op in ops {
            match op {
                Op::Hold { fund, percent, manual_expiry } => {
                    let id = if fund { bot.clone() } else { FundId::main() };
                    let target = balances.fund_mut(&id).unwrap();
                    let volume = (target.available() * Decimal::from(percent) / dec!(100))
                        .round_dp_with_strategy(8, RoundingStrategy::ToZero);
                    if volume > Decimal::ZERO {
                        // Manual holds only go on the bot fund, whose total never moves.
                        let expiry = if manual_expiry && fund {
                            HoldExpiry::Manual
                        } else {
                            HoldExpiry::UntilNextUpdate { seen: clock }
                        };
                        target.hold(volume, expiry).unwrap();
                    }
                }
                Op::Release { fund, nth } => {
                    let id = if fund { bot.clone() } else { FundId::main() };
                    let target = balances.fund_mut(&id).unwrap();
                    if let Some(hold) = target.holds().get(nth).map(|hold| hold.id) {
                        target.release(hold);
                    }
                }
                Op::Update { total, held_percent } => {
                    clock += 1;
                    let others = balances.fund(&bot).unwrap().total();
                    let total = Decimal::from(total) + others;
                    let held = (total - others) * Decimal::from(held_percent) / dec!(100);
                    balances.update(&snapshot(total, held, clock)).unwrap();
                }
            }

            prop_assert!(balances.check_invariants().is_ok(), "{:?}", balances.check_invariants());
            let nett_total = balances.nett_total();
            let nett_available = balances.nett_available();
            prop_assert!(nett_available >= Decimal::ZERO && nett_available <= nett_total);
        }
    }
}
