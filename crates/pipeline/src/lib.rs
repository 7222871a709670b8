//! # Meridian Integration Pipeline
//!
//! Background workers never touch shared market state. They hand the pipeline a
//! closure instead, and one designated task drains the queue at a fixed cadence,
//! applying every update under the market data lock.
//!
//! ## Public API
//!
//! - `IntegrationPipeline`: the queue, the drain routine and the drain loop.
//! - `PipelineHandle`: the cloneable, `Send` side workers use to submit updates.
//! - `MarketDataLock`: the mutex non-designated readers take before reading state.
//! - `PipelineError`: The specific error types that can be returned from this crate.

pub mod error;
pub mod integration;
pub mod lock;

pub use error::PipelineError;
pub use integration::{DrainReport, IntegrationPipeline, MarketUpdate, PipelineEvent, PipelineHandle};
pub use lock::MarketDataLock;
