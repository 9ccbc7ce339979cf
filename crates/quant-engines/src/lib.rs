//! Rule-based strategy engines: Grid, DCA and RSI.
//!
//! Each engine runs one `run_cycle` per tick against its persisted runtime
//! state. Position changes go through the shared isolation core so that
//! symbol exclusivity and capital budgets hold across every strategy on an
//! account.

pub mod core;
pub mod dca;
pub mod grid;
pub mod rsi;

#[cfg(test)]
mod tests;

pub use crate::core::{CycleOutcome, EngineCore, EngineError};
pub use dca::DcaEngine;
pub use grid::GridEngine;
pub use rsi::RsiEngine;

use agent_core::QuantConfig;
use async_trait::async_trait;

/// One cycle of a quant strategy. Implementations must never panic a
/// cycle; engine-level failures become `CycleOutcome { success: false }`.
#[async_trait]
pub trait QuantEngine: Send {
    async fn run_cycle(&mut self) -> CycleOutcome;
}

/// Build the engine for a strategy's config, seeded with its persisted
/// runtime state.
pub fn create_engine(
    config: &QuantConfig,
    core: EngineCore,
    runtime_state: serde_json::Value,
) -> Box<dyn QuantEngine + Send> {
    match config {
        QuantConfig::Grid(cfg) => Box::new(GridEngine::new(core, cfg.clone(), runtime_state)),
        QuantConfig::Dca(cfg) => Box::new(DcaEngine::new(core, cfg.clone(), runtime_state)),
        QuantConfig::Rsi(cfg) => Box::new(RsiEngine::new(core, cfg.clone(), runtime_state)),
    }
}
