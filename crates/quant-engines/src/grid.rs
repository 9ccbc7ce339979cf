use std::collections::BTreeSet;

use agent_core::GridConfig;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use trader_trait::PositionSide;

use crate::core::{CycleOutcome, EngineCore, EngineError};
use crate::QuantEngine;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GridState {
    #[serde(default)]
    pub initialized: bool,
    #[serde(default)]
    pub config_hash: String,
    #[serde(default)]
    pub grid_levels: Vec<f64>,
    #[serde(default)]
    pub filled_buys: BTreeSet<String>,
    #[serde(default)]
    pub filled_sells: BTreeSet<String>,
    #[serde(default)]
    pub total_invested: f64,
    #[serde(default)]
    pub total_returned: f64,
    #[serde(default)]
    pub last_price: Option<f64>,
    #[serde(default)]
    pub last_check: Option<String>,
}

/// Grid trading: a ladder of buy levels inside a price band. A level buys
/// when price touches it and sells when price clears the next level up.
pub struct GridEngine {
    core: EngineCore,
    config: GridConfig,
    state: GridState,
}

impl GridEngine {
    pub fn new(core: EngineCore, config: GridConfig, runtime_state: serde_json::Value) -> Self {
        let state = serde_json::from_value(runtime_state).unwrap_or_default();
        Self { core, config, state }
    }

    fn state_value(&self) -> serde_json::Value {
        serde_json::to_value(&self.state).unwrap_or(serde_json::Value::Null)
    }

    async fn cycle(&mut self) -> Result<CycleOutcome, EngineError> {
        let cfg = self.config.clone();
        if cfg.upper_price <= cfg.lower_price {
            return Ok(CycleOutcome::failure(
                self.state_value(),
                "Error: upper_price must be > lower_price",
            ));
        }
        if cfg.grid_count < 1 {
            return Ok(CycleOutcome::failure(
                self.state_value(),
                "Error: grid_count must be >= 1",
            ));
        }

        let grid_step = (cfg.upper_price - cfg.lower_price) / cfg.grid_count as f64;
        let amount_per_grid = cfg.total_investment / cfg.grid_count as f64;
        let current_price = self.core.current_price().await?;

        // Reset state on first run or after a config edit.
        let config_hash = format!(
            "{}:{}:{}",
            cfg.upper_price, cfg.lower_price, cfg.grid_count
        );
        if !self.state.initialized || self.state.config_hash != config_hash {
            let mut levels = Vec::with_capacity(cfg.grid_count as usize + 1);
            for i in 0..=cfg.grid_count {
                let price = cfg.lower_price + i as f64 * grid_step;
                levels.push((price * 100.0).round() / 100.0);
            }
            self.state = GridState {
                initialized: true,
                config_hash,
                grid_levels: levels,
                ..GridState::default()
            };
        }

        let mut trades_executed = 0u32;
        let mut pnl_change = 0.0;
        let mut total_size_usd = 0.0;
        let levels = self.state.grid_levels.clone();

        for (i, level) in levels.iter().enumerate() {
            let level = *level;
            let level_key = i.to_string();

            // Buy when price sits at or below the level, within one step of
            // it. Level 0 catches everything below the band so a breakdown
            // still deploys the bottom rung, and only the nearest level
            // fires for any given price.
            let buy_signal = current_price <= level
                && (i == 0 || current_price > level - grid_step)
                && !self.state.filled_buys.contains(&level_key);

            if buy_signal {
                match self
                    .core
                    .open_with_isolation(amount_per_grid, cfg.leverage, PositionSide::Long)
                    .await
                {
                    Ok(result) if result.success => {
                        self.state.filled_buys.insert(level_key);
                        trades_executed += 1;
                        total_size_usd += amount_per_grid;
                        self.state.total_invested += amount_per_grid;
                        tracing::info!(
                            agent_id = %self.core.agent.id,
                            level,
                            current_price,
                            fill = result.filled_price.unwrap_or(current_price),
                            size_usd = amount_per_grid,
                            "grid buy"
                        );
                    }
                    Ok(result) => {
                        tracing::warn!(
                            level,
                            "grid buy rejected: {}",
                            result.error.as_deref().unwrap_or("unknown")
                        );
                    }
                    Err(EngineError::Trade(e)) => {
                        tracing::warn!(level, "grid buy error: {e}");
                    }
                    Err(e) => return Err(e),
                }
            } else if current_price >= level + grid_step
                && self.state.filled_buys.contains(&level_key)
                && !self.state.filled_sells.contains(&level_key)
            {
                // Price cleared the level above a filled buy: take the rung
                // profit.
                match self.core.close_with_isolation().await {
                    Ok(result) if result.success => {
                        // The rung is realized: record the sell and re-arm
                        // the level's buy for the next oscillation.
                        self.state.filled_sells.insert(level_key.clone());
                        self.state.filled_buys.remove(&level_key);
                        trades_executed += 1;
                        total_size_usd += amount_per_grid;
                        let profit = if level > 0.0 {
                            amount_per_grid * (grid_step / level)
                        } else {
                            0.0
                        };
                        pnl_change += profit;
                        self.state.total_returned += amount_per_grid + profit;
                        tracing::info!(
                            agent_id = %self.core.agent.id,
                            level,
                            current_price,
                            profit,
                            "grid sell"
                        );
                    }
                    Ok(result) => {
                        tracing::warn!(
                            level,
                            "grid sell rejected: {}",
                            result.error.as_deref().unwrap_or("unknown")
                        );
                    }
                    Err(EngineError::Trade(e)) => {
                        tracing::warn!(level, "grid sell error: {e}");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        self.state.last_price = Some(current_price);
        self.state.last_check = Some(Utc::now().to_rfc3339());

        Ok(CycleOutcome {
            success: true,
            trades_executed,
            pnl_change,
            total_size_usd,
            updated_state: self.state_value(),
            message: format!(
                "Grid check: price={current_price:.2}, trades={trades_executed}"
            ),
        })
    }
}

#[async_trait]
impl QuantEngine for GridEngine {
    async fn run_cycle(&mut self) -> CycleOutcome {
        match self.cycle().await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(agent_id = %self.core.agent.id, "grid engine error: {e}");
                CycleOutcome::failure(self.state_value(), format!("Error: {e}"))
            }
        }
    }
}
