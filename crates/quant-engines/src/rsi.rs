use agent_core::RsiConfig;
use async_trait::async_trait;
use chrono::Utc;
use market_analysis::indicators;
use serde::{Deserialize, Serialize};
use trader_trait::PositionSide;

use crate::core::{CycleOutcome, EngineCore, EngineError};
use crate::QuantEngine;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RsiState {
    #[serde(default)]
    pub initialized: bool,
    #[serde(default)]
    pub has_position: bool,
    #[serde(default)]
    pub entry_price: f64,
    #[serde(default)]
    pub position_size_usd: f64,
    #[serde(default)]
    pub last_rsi: Option<f64>,
    #[serde(default)]
    pub last_signal: Option<String>,
    #[serde(default)]
    pub last_price: Option<f64>,
    #[serde(default)]
    pub last_check: Option<String>,
}

/// RSI signal trading: long when oversold, flat when overbought.
pub struct RsiEngine {
    core: EngineCore,
    config: RsiConfig,
    state: RsiState,
}

impl RsiEngine {
    pub fn new(core: EngineCore, config: RsiConfig, runtime_state: serde_json::Value) -> Self {
        let state = serde_json::from_value(runtime_state).unwrap_or_default();
        Self { core, config, state }
    }

    fn state_value(&self) -> serde_json::Value {
        serde_json::to_value(&self.state).unwrap_or(serde_json::Value::Null)
    }

    async fn calculate_rsi(&self) -> Option<f64> {
        let period = self.config.rsi_period as usize;
        let klines = match self
            .core
            .trader
            .get_klines(&self.core.symbol, &self.config.timeframe, period + 10)
            .await
        {
            Ok(klines) => klines,
            Err(e) => {
                tracing::warn!("rsi kline fetch failed: {e}");
                return None;
            }
        };
        if klines.len() < period + 1 {
            return None;
        }
        let closes: Vec<f64> = klines.iter().map(|k| k.close).collect();
        indicators::rsi(&closes, period).map(|v| (v * 100.0).round() / 100.0)
    }

    /// Keep `has_position` honest against the exchange: a manual close or
    /// liquidation resets the state; an untracked position is adopted.
    async fn sync_position_state(&mut self) {
        let actual = match self.core.trader.get_position(&self.core.symbol).await {
            Ok(pos) => pos,
            Err(e) => {
                tracing::debug!("rsi position sync check failed: {e}");
                return;
            }
        };
        let actual_has_position = actual.as_ref().map(|p| p.size > 0.0).unwrap_or(false);

        if self.state.has_position && !actual_has_position {
            tracing::warn!(
                agent_id = %self.core.agent.id,
                symbol = %self.core.symbol,
                "state says has_position but exchange shows none, resetting"
            );
            self.state.has_position = false;
            self.state.entry_price = 0.0;
            self.state.position_size_usd = 0.0;
        } else if !self.state.has_position && actual_has_position {
            let pos = actual.unwrap();
            tracing::warn!(
                agent_id = %self.core.agent.id,
                symbol = %self.core.symbol,
                "exchange shows a position the state does not, syncing"
            );
            self.state.has_position = true;
            self.state.entry_price = pos.entry_price;
            self.state.position_size_usd = pos.size_usd;
        }
    }

    async fn cycle(&mut self) -> Result<CycleOutcome, EngineError> {
        let cfg = self.config.clone();

        if !self.state.initialized {
            self.state = RsiState {
                initialized: true,
                ..RsiState::default()
            };
        }

        let current_price = self.core.current_price().await?;
        let rsi_value = match self.calculate_rsi().await {
            Some(v) => v,
            None => {
                self.state.last_check = Some(Utc::now().to_rfc3339());
                return Ok(CycleOutcome {
                    success: true,
                    trades_executed: 0,
                    pnl_change: 0.0,
                    total_size_usd: 0.0,
                    updated_state: self.state_value(),
                    message: "Insufficient data for RSI calculation".to_string(),
                });
            }
        };

        self.sync_position_state().await;
        self.state.last_rsi = Some(rsi_value);

        let mut trades_executed = 0u32;
        let mut pnl_change = 0.0;
        let mut total_size_usd = 0.0;

        if rsi_value <= cfg.oversold_threshold && !self.state.has_position {
            match self
                .core
                .open_with_isolation(cfg.order_amount, cfg.leverage, PositionSide::Long)
                .await
            {
                Ok(result) if result.success => {
                    trades_executed += 1;
                    total_size_usd += cfg.order_amount;
                    let entry = result.filled_price.unwrap_or(current_price);
                    self.state.has_position = true;
                    self.state.entry_price = entry;
                    self.state.position_size_usd = cfg.order_amount;
                    self.state.last_signal = Some("buy".to_string());
                    tracing::info!(
                        agent_id = %self.core.agent.id,
                        rsi = rsi_value,
                        oversold = cfg.oversold_threshold,
                        entry,
                        "rsi buy signal"
                    );
                }
                Ok(result) => {
                    tracing::warn!(
                        "rsi buy rejected: {}",
                        result.error.as_deref().unwrap_or("unknown")
                    );
                }
                Err(EngineError::Trade(e)) => {
                    tracing::warn!("rsi buy error: {e}");
                }
                Err(e) => return Err(e),
            }
        } else if rsi_value >= cfg.overbought_threshold && self.state.has_position {
            let entry_price = self.state.entry_price;
            let position_size = if self.state.position_size_usd > 0.0 {
                self.state.position_size_usd
            } else {
                cfg.order_amount
            };
            match self.core.close_with_isolation().await {
                Ok(result) if result.success => {
                    trades_executed += 1;
                    total_size_usd += position_size;
                    let close = result.filled_price.unwrap_or(current_price);
                    if entry_price > 0.0 {
                        pnl_change = position_size * (close - entry_price) / entry_price;
                    }
                    self.state.has_position = false;
                    self.state.entry_price = 0.0;
                    self.state.position_size_usd = 0.0;
                    self.state.last_signal = Some("sell".to_string());
                    tracing::info!(
                        agent_id = %self.core.agent.id,
                        rsi = rsi_value,
                        overbought = cfg.overbought_threshold,
                        pnl = pnl_change,
                        "rsi sell signal"
                    );
                }
                Ok(result) => {
                    tracing::warn!(
                        "rsi sell rejected: {}",
                        result.error.as_deref().unwrap_or("unknown")
                    );
                }
                Err(EngineError::Trade(e)) => {
                    tracing::warn!("rsi sell error: {e}");
                }
                Err(e) => return Err(e),
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
                "RSI={rsi_value:.1}, price={current_price:.2}, trades={trades_executed}"
            ),
        })
    }
}

#[async_trait]
impl QuantEngine for RsiEngine {
    async fn run_cycle(&mut self) -> CycleOutcome {
        match self.cycle().await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(agent_id = %self.core.agent.id, "rsi engine error: {e}");
                CycleOutcome::failure(self.state_value(), format!("Error: {e}"))
            }
        }
    }
}
