use agent_core::DcaConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trader_trait::PositionSide;

use crate::core::{CycleOutcome, EngineCore, EngineError};
use crate::QuantEngine;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DcaState {
    #[serde(default)]
    pub initialized: bool,
    #[serde(default)]
    pub orders_placed: u32,
    #[serde(default)]
    pub total_invested: f64,
    #[serde(default)]
    pub total_quantity: f64,
    #[serde(default)]
    pub avg_cost: f64,
    #[serde(default)]
    pub last_order_time: Option<String>,
    #[serde(default)]
    pub last_check: Option<String>,
}

/// Dollar-cost averaging: buy a fixed amount on an interval, exit the whole
/// position at the take-profit threshold.
pub struct DcaEngine {
    core: EngineCore,
    config: DcaConfig,
    state: DcaState,
}

impl DcaEngine {
    pub fn new(core: EngineCore, config: DcaConfig, runtime_state: serde_json::Value) -> Self {
        let state = serde_json::from_value(runtime_state).unwrap_or_default();
        Self { core, config, state }
    }

    fn state_value(&self) -> serde_json::Value {
        serde_json::to_value(&self.state).unwrap_or(serde_json::Value::Null)
    }

    fn outcome(
        &self,
        trades_executed: u32,
        pnl_change: f64,
        total_size_usd: f64,
        message: String,
    ) -> CycleOutcome {
        CycleOutcome {
            success: true,
            trades_executed,
            pnl_change,
            total_size_usd,
            updated_state: self.state_value(),
            message,
        }
    }

    async fn cycle(&mut self) -> Result<CycleOutcome, EngineError> {
        let cfg = self.config.clone();
        let current_price = self.core.current_price().await?;

        if !self.state.initialized {
            self.state = DcaState {
                initialized: true,
                ..DcaState::default()
            };
        }

        // Take-profit check comes first: an exit resets the ladder.
        if self.state.total_quantity > 0.0 && self.state.avg_cost > 0.0 {
            let pnl_pct = (current_price - self.state.avg_cost) / self.state.avg_cost * 100.0;
            if pnl_pct >= cfg.take_profit_percent {
                let sell_value = self.state.total_quantity * current_price;
                match self.core.close_with_isolation().await {
                    Ok(result) if result.success => {
                        let pnl = sell_value - self.state.total_invested;
                        tracing::info!(
                            agent_id = %self.core.agent.id,
                            current_price,
                            avg_cost = self.state.avg_cost,
                            pnl,
                            pnl_pct,
                            "dca take profit"
                        );
                        self.state.total_invested = 0.0;
                        self.state.total_quantity = 0.0;
                        self.state.avg_cost = 0.0;
                        self.state.last_check = Some(Utc::now().to_rfc3339());
                        return Ok(self.outcome(
                            1,
                            pnl,
                            sell_value,
                            format!("Take profit: +{pnl_pct:.1}%, P/L: ${pnl:.2}"),
                        ));
                    }
                    Ok(result) => {
                        tracing::warn!(
                            "dca take profit rejected: {}",
                            result.error.as_deref().unwrap_or("unknown")
                        );
                    }
                    Err(EngineError::Trade(e)) => {
                        tracing::warn!("dca take profit error: {e}");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        // Budget / order-count caps hold the ladder until take-profit.
        if cfg.total_budget > 0.0 && self.state.total_invested >= cfg.total_budget {
            return Ok(self.outcome(
                0,
                0.0,
                0.0,
                "Budget limit reached, waiting for take profit".to_string(),
            ));
        }
        if cfg.max_orders > 0 && self.state.orders_placed >= cfg.max_orders {
            return Ok(self.outcome(
                0,
                0.0,
                0.0,
                "Max orders reached, waiting for take profit".to_string(),
            ));
        }

        // Respect the configured interval between buys. A malformed
        // timestamp falls through to placing the order.
        if let Some(last) = self
            .state
            .last_order_time
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        {
            let elapsed = (Utc::now() - last.with_timezone(&Utc)).num_seconds();
            if elapsed < cfg.interval_minutes * 60 {
                self.state.last_check = Some(Utc::now().to_rfc3339());
                return Ok(self.outcome(
                    0,
                    0.0,
                    0.0,
                    format!(
                        "Waiting for interval ({}min), elapsed={:.1}min",
                        cfg.interval_minutes,
                        elapsed as f64 / 60.0
                    ),
                ));
            }
        }

        let mut trades_executed = 0u32;
        let mut total_size_usd = 0.0;
        match self
            .core
            .open_with_isolation(cfg.order_amount, 1, PositionSide::Long)
            .await
        {
            Ok(result) if result.success => {
                trades_executed += 1;
                total_size_usd += cfg.order_amount;

                let actual_price = result.filled_price.unwrap_or(current_price);
                let quantity = result
                    .filled_size
                    .unwrap_or(cfg.order_amount / actual_price);

                let new_invested = self.state.total_invested + cfg.order_amount;
                let new_quantity = self.state.total_quantity + quantity;
                self.state.avg_cost = if new_quantity > 0.0 {
                    new_invested / new_quantity
                } else {
                    actual_price
                };
                self.state.orders_placed += 1;
                self.state.total_invested = new_invested;
                self.state.total_quantity = new_quantity;
                self.state.last_order_time = Some(Utc::now().to_rfc3339());

                tracing::info!(
                    agent_id = %self.core.agent.id,
                    amount = cfg.order_amount,
                    current_price,
                    avg_cost = self.state.avg_cost,
                    total_invested = new_invested,
                    "dca buy"
                );
            }
            Ok(result) => {
                tracing::warn!(
                    "dca buy rejected: {}",
                    result.error.as_deref().unwrap_or("unknown")
                );
            }
            Err(EngineError::Trade(e)) => {
                tracing::warn!("dca buy error: {e}");
            }
            Err(e) => return Err(e),
        }

        self.state.last_check = Some(Utc::now().to_rfc3339());
        Ok(self.outcome(
            trades_executed,
            0.0,
            total_size_usd,
            format!(
                "DCA cycle: price={current_price:.2}, orders={}",
                self.state.orders_placed
            ),
        ))
    }
}

#[async_trait]
impl QuantEngine for DcaEngine {
    async fn run_cycle(&mut self) -> CycleOutcome {
        match self.cycle().await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(agent_id = %self.core.agent.id, "dca engine error: {e}");
                CycleOutcome::failure(self.state_value(), format!("Error: {e}"))
            }
        }
    }
}
