use std::sync::Arc;

use agent_core::Agent;
use position_service::{PositionError, PositionService, PositionStatus};
use thiserror::Error;
use trader_trait::{OrderResult, PositionSide, TradeError, Trader};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Trade(#[from] TradeError),
    #[error(transparent)]
    Position(#[from] PositionError),
}

/// Result of one engine cycle, persisted back onto the strategy.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub success: bool,
    pub trades_executed: u32,
    pub pnl_change: f64,
    pub total_size_usd: f64,
    pub updated_state: serde_json::Value,
    pub message: String,
}

impl CycleOutcome {
    pub fn failure(state: serde_json::Value, message: impl Into<String>) -> Self {
        Self {
            success: false,
            trades_executed: 0,
            pnl_change: 0.0,
            total_size_usd: 0.0,
            updated_state: state,
            message: message.into(),
        }
    }
}

/// Shared plumbing for all quant engines: the trader, the position
/// registry, and the per-cycle equity cache.
pub struct EngineCore {
    pub agent: Agent,
    pub trader: Arc<dyn Trader>,
    pub symbol: String,
    pub positions: Option<PositionService>,
    cached_equity: Option<f64>,
}

impl EngineCore {
    pub fn new(
        agent: Agent,
        trader: Arc<dyn Trader>,
        symbol: impl Into<String>,
        positions: Option<PositionService>,
    ) -> Self {
        Self {
            agent,
            trader,
            symbol: symbol.into().to_uppercase(),
            positions,
            cached_equity: None,
        }
    }

    /// Current mid price; invalid quotes are trade errors.
    pub async fn current_price(&self) -> Result<f64, TradeError> {
        let data = self.trader.get_market_data(&self.symbol).await?;
        if data.mid_price <= 0.0 {
            return Err(TradeError::InvalidPrice {
                symbol: self.symbol.clone(),
                price: data.mid_price,
            });
        }
        Ok(data.mid_price)
    }

    /// Account equity, fetched once per cycle. A grid crossing many levels
    /// in one tick must not hit the venue once per level.
    async fn account_equity(&mut self) -> Result<f64, TradeError> {
        if let Some(equity) = self.cached_equity {
            return Ok(equity);
        }
        let state = self.trader.get_account_state().await?;
        self.cached_equity = Some(state.equity);
        Ok(state.equity)
    }

    /// Open (or add to) a position with strategy-level isolation.
    ///
    /// Domain rejections (symbol conflict, capital budget) come back as
    /// failed `OrderResult`s; order exceptions propagate after the claim is
    /// resolved. When the order errored but the exchange shows a position
    /// anyway, the claim is confirmed rather than released. Accumulating
    /// onto an existing open record never deletes it on failure.
    pub async fn open_with_isolation(
        &mut self,
        size_usd: f64,
        leverage: u32,
        side: PositionSide,
    ) -> Result<OrderResult, EngineError> {
        let mut claim = None;
        let mut is_existing = false;

        if let Some(ps) = self.positions.clone() {
            let equity = self.account_equity().await?;
            let claimed = ps
                .claim_position_with_capital_check(
                    &self.agent,
                    "quant",
                    self.agent.account_id,
                    &self.symbol,
                    side,
                    leverage as i64,
                    equity,
                    size_usd,
                )
                .await;
            match claimed {
                Ok(record) => {
                    // Already-open record means this order accumulates onto
                    // it; the record must survive an order failure.
                    is_existing = record.status == PositionStatus::Open;
                    claim = Some(record);
                }
                Err(e) if e.is_domain() => {
                    tracing::warn!(
                        agent_id = %self.agent.id,
                        symbol = %self.symbol,
                        "claim rejected: {e}"
                    );
                    return Ok(OrderResult::failed(e.to_string()));
                }
                Err(e) => return Err(e.into()),
            }
        }

        let order = match side {
            PositionSide::Long => {
                self.trader
                    .open_long(&self.symbol, size_usd, leverage, None, None)
                    .await
            }
            PositionSide::Short => {
                self.trader
                    .open_short(&self.symbol, size_usd, leverage, None, None)
                    .await
            }
        };

        let ps = self.positions.clone();
        let result = match order {
            Err(trade_err) => {
                if let (Some(ps), Some(record)) = (&ps, &claim) {
                    if !is_existing {
                        self.resolve_claim_after_order_error(ps, record.id).await;
                    }
                }
                return Err(trade_err.into());
            }
            Ok(result) => result,
        };

        if let (Some(ps), Some(record)) = (&ps, &claim) {
            if result.success {
                let fill_price = result.filled_price.unwrap_or(0.0);
                let estimated_size = result
                    .filled_size
                    .unwrap_or_else(|| size_usd / result.filled_price.unwrap_or(1.0));
                let update = if is_existing {
                    ps.accumulate_position(record.id, estimated_size, size_usd, fill_price)
                        .await
                } else {
                    ps.confirm_position(record.id, estimated_size, size_usd, fill_price)
                        .await
                };
                if let Err(e) = update {
                    // Order succeeded on the exchange; keep the record and
                    // let reconciliation heal it.
                    tracing::error!(
                        agent_id = %self.agent.id,
                        symbol = %self.symbol,
                        claim_id = %record.id,
                        "position registry update failed after successful order, leaving for \
                         reconciliation: {e}"
                    );
                }
            } else if !is_existing {
                ps.release_claim(record.id).await?;
            }
        }

        Ok(result)
    }

    /// Order submission threw, but the order may have landed anyway: ask
    /// the exchange, confirm the claim if a position exists, release it
    /// otherwise.
    async fn resolve_claim_after_order_error(
        &self,
        ps: &PositionService,
        claim_id: uuid::Uuid,
    ) {
        let mut should_release = true;
        match self.trader.get_position(&self.symbol).await {
            Ok(Some(pos)) if pos.size > 0.0 => {
                tracing::warn!(
                    agent_id = %self.agent.id,
                    symbol = %self.symbol,
                    "order errored but exchange shows a position, confirming claim"
                );
                if let Err(e) = ps
                    .confirm_position(claim_id, pos.size, pos.size_usd, pos.entry_price)
                    .await
                {
                    tracing::error!(
                        claim_id = %claim_id,
                        "failed to confirm claim after detecting exchange position: {e}"
                    );
                }
                should_release = false;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    symbol = %self.symbol,
                    "could not verify exchange position after order error: {e}"
                );
            }
        }
        if should_release {
            if let Err(e) = ps.release_claim(claim_id).await {
                tracing::error!(claim_id = %claim_id, "failed to release claim: {e}");
            }
        }
    }

    /// Close this agent's position on the symbol and settle the registry
    /// record using the actual fill price.
    pub async fn close_with_isolation(&self) -> Result<OrderResult, EngineError> {
        let record = match &self.positions {
            Some(ps) => {
                ps.get_agent_position_for_symbol(self.agent.id, &self.symbol)
                    .await?
            }
            None => None,
        };

        let result = self.trader.close_position(&self.symbol, None, None).await?;

        if let (Some(ps), Some(record)) = (&self.positions, record) {
            if result.success {
                let close_price = result.filled_price.unwrap_or(0.0);
                let realized = if close_price > 0.0 && record.entry_price > 0.0 {
                    match record.side {
                        PositionSide::Long => (close_price - record.entry_price) * record.size,
                        PositionSide::Short => (record.entry_price - close_price) * record.size,
                    }
                } else {
                    0.0
                };
                ps.close_position_record(record.id, close_price, realized)
                    .await?;
            }
        }

        Ok(result)
    }
}
