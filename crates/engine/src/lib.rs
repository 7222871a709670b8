//! # Meridian Engine
//!
//! Wires the market-data core together for one exchange.
//!
//! - `ExchangeModel`: the live model. Opens per-pair databases and candle stores on
//!   demand, hands out leased instruments, polls balances and drains the
//!   integration pipeline on the designated context.
//! - `MarketState`: everything the pipeline serialises access to (stores and ledgers).
//! - `BalancePoller`: background task feeding exchange balances into the ledgers.
//! - `Simulation`: the same stores and ledgers replayed under a simulated clock.

pub mod balance_poller;
pub mod error;
pub mod model;
pub mod simulation;
pub mod state;

pub use balance_poller::BalancePoller;
pub use error::EngineError;
pub use model::ExchangeModel;
pub use simulation::Simulation;
pub use state::{FundChanges, MarketState};
