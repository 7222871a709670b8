//! # Meridian Ledger
//!
//! The hold-aware balance ledger: per coin, a `Main` fund mirroring the exchange and
//! any number of locally managed funds carved out of it. Everything here is plain,
//! synchronous state owned by the designated context.
//!
//! ## Public API
//!
//! - `Balances`: the funds of one coin, exchange snapshot integration, fund lifecycle.
//! - `FundBalance`: one fund with its local holds.
//! - `Hold`, `HoldId`, `HoldExpiry`: reservations and their pull-based expiry.
//! - `InvariantPolicy`: tolerance and panic-or-log choice for invariant checks.
//! - `LedgerError`: The specific error types that can be returned from this crate.

pub mod balances;
pub mod error;
pub mod fund_balance;
pub mod hold;

pub use balances::{Balances, InvariantPolicy};
pub use error::LedgerError;
pub use fund_balance::FundBalance;
pub use hold::{Hold, HoldExpiry, HoldId};
