use crate::error::EngineError;
use crate::state::MarketState;
use core_types::{Clock, SimClock};
use market_data::{CandleStore, Instrument};
use std::sync::Arc;

/// Back-testing driver.
///
/// Replays stored series under a [`SimClock`]. The stores are switched into
/// simulation mode, so no refresh worker runs, and the state is owned directly:
/// there is no background task to serialise against.
pub struct Simulation {
    clock: Arc<SimClock>,
    step_ms: i64,
    state: MarketState,
    instruments: Vec<Instrument>,
    chunk_size: usize,
}

impl Simulation {
    pub fn new(clock: Arc<SimClock>, step_ms: i64, state: MarketState, chunk_size: usize) -> Self {
        Self {
            clock,
            step_ms: step_ms.max(1),
            state,
            instruments: Vec::new(),
            chunk_size,
        }
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    pub fn step_ms(&self) -> i64 {
        self.step_ms
    }

    pub fn state(&self) -> &MarketState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut MarketState {
        &mut self.state
    }

    /// Puts `store` into simulation mode and adds an instrument over it. Returns the
    /// instrument's index.
    pub fn add_store(&mut self, store: Arc<CandleStore>) -> usize {
        store.enter_simulation();
        let store = self.state.register_store(store);
        let clock: Arc<dyn Clock> = self.clock.clone();
        self.instruments.push(Instrument::new(&store, clock, self.chunk_size));
        self.instruments.len() - 1
    }

    pub fn instrument(&mut self, index: usize) -> Option<&mut Instrument> {
        self.instruments.get_mut(index)
    }

    pub fn instruments(&mut self) -> &mut [Instrument] {
        &mut self.instruments
    }

    /// Moves the clock to `start` and re-anchors every instrument with `steps_ago`
    /// candles of history.
    pub async fn reset(&mut self, start: i64, steps_ago: usize) -> Result<(), EngineError> {
        self.clock.set(start);
        for instrument in &mut self.instruments {
            instrument.sim_reset(start, steps_ago).await?;
        }
        tracing::info!(start, steps_ago, instruments = self.instruments.len(), "Simulation reset.");
        Ok(())
    }

    /// Advances the clock by one step. Returns the new time.
    pub async fn step(&mut self) -> Result<i64, EngineError> {
        let now = self.clock.advance(self.step_ms);
        for instrument in &mut self.instruments {
            instrument.sim_step(now).await?;
        }
        Ok(now)
    }

    /// Steps until the clock reaches `end`, calling `on_step` after each step.
    /// Returns the number of steps taken.
    pub async fn run_until<F>(&mut self, end: i64, mut on_step: F) -> Result<usize, EngineError>
    where
        F: FnMut(i64),
    {
        let mut steps = 0;
        while self.now() + self.step_ms <= end {
            let now = self.step().await?;
            steps += 1;
            on_step(now);
        }
        tracing::info!(steps, now = self.now(), "Simulation reached its end.");
        Ok(steps)
    }
}
