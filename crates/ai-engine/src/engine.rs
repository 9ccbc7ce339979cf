//! One LLM-driven agent cycle: account view, risk gate, market context,
//! prompt, generate (single model or debate), parse, execute, persist.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use agent_core::{
    ActionType, Agent, AiStrategyConfig, ConsensusMode, DebateConfig, DebateResult,
    DecisionResponse, TradingDecision,
};
use agent_store::{AgentRepository, DecisionRepository, NewDecisionRecord};
use ai_client::AIClient;
use market_analysis::{IndicatorCalculator, MarketContext};
use position_service::{PositionError, PositionService};
use serde::Serialize;
use serde_json::json;
use trader_trait::{AccountState, OrderResult, Position, PositionSide, Trader};
use uuid::Uuid;

use crate::debate::DebateEngine;
use crate::parser::DecisionParser;
use crate::prompt::PromptBuilder;

/// Orders below this notional are rejected before reaching the venue.
const MIN_POSITION_SIZE_USD: f64 = 10.0;

#[derive(Debug, Clone, Serialize)]
pub struct OrderSummary {
    pub order_id: Option<String>,
    pub filled_size: Option<f64>,
    pub filled_price: Option<f64>,
    pub status: String,
    pub error: Option<String>,
}

impl From<&OrderResult> for OrderSummary {
    fn from(result: &OrderResult) -> Self {
        Self {
            order_id: result.order_id.clone(),
            filled_size: result.filled_size,
            filled_price: result.filled_price,
            status: result.status.clone(),
            error: result.error.clone(),
        }
    }
}

/// Outcome of one decision within a cycle, persisted into the audit row.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub symbol: String,
    pub action: String,
    pub confidence: i64,
    pub executed: bool,
    pub reason: String,
    pub requested_size_usd: f64,
    pub actual_size_usd: Option<f64>,
    pub order: Option<OrderSummary>,
    pub realized_pnl: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct AiCycleReport {
    pub success: bool,
    pub decision: Option<DecisionResponse>,
    pub executed: Vec<ExecutionResult>,
    pub error: Option<String>,
    pub latency_ms: i64,
    pub tokens_used: i64,
    pub decision_record_id: Option<Uuid>,
    pub is_debate: bool,
}

impl AiCycleReport {
    fn empty() -> Self {
        Self {
            success: false,
            decision: None,
            executed: vec![],
            error: None,
            latency_ms: 0,
            tokens_used: 0,
            decision_record_id: None,
            is_debate: false,
        }
    }
}

pub struct StrategyEngine {
    agent: Agent,
    config: AiStrategyConfig,
    trader: Arc<dyn Trader>,
    positions: Option<PositionService>,
    agents: AgentRepository,
    decisions: DecisionRepository,
    ai_client: Option<Arc<dyn AIClient>>,
    debate_clients: Vec<(String, Arc<dyn AIClient>)>,
    debate: Option<DebateEngine>,
    parser: DecisionParser,
    prompt_builder: PromptBuilder,
    calculator: IndicatorCalculator,
    max_positions: usize,
}

impl StrategyEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent: Agent,
        config: AiStrategyConfig,
        trader: Arc<dyn Trader>,
        positions: Option<PositionService>,
        agents: AgentRepository,
        decisions: DecisionRepository,
        ai_client: Option<Arc<dyn AIClient>>,
        debate_clients: Vec<(String, Arc<dyn AIClient>)>,
        max_positions: usize,
    ) -> Self {
        let risk_controls = config.risk_controls.clone();

        // Debate is driven by the agent's configuration; it needs at least
        // two resolvable clients to be worth running.
        let debate = if agent.debate_enabled && debate_clients.len() >= 2 {
            let debate_config = DebateConfig {
                model_ids: debate_clients.iter().map(|(id, _)| id.clone()).collect(),
                consensus_mode: agent
                    .debate_consensus_mode
                    .as_deref()
                    .and_then(ConsensusMode::parse)
                    .unwrap_or_default(),
                min_participants: agent.debate_min_participants.max(2) as usize,
                timeout_seconds: 120,
            };
            tracing::info!(
                agent_id = %agent.id,
                models = debate_clients.len(),
                "debate mode enabled"
            );
            Some(DebateEngine::new(debate_config, risk_controls.clone()))
        } else {
            None
        };

        Self {
            parser: DecisionParser::new(risk_controls),
            prompt_builder: PromptBuilder::new(config.clone(), max_positions),
            calculator: IndicatorCalculator::default(),
            agent,
            config,
            trader,
            positions,
            agents,
            decisions,
            ai_client,
            debate_clients,
            debate,
            max_positions,
        }
    }

    pub async fn run_cycle(&mut self) -> AiCycleReport {
        let started = Instant::now();
        let mut report = AiCycleReport::empty();

        // 1. Agent-isolated account view.
        let mut account = match self.agent_account_state().await {
            Ok(account) => account,
            Err(e) => {
                report.error = Some(e.to_string());
                report.latency_ms = started.elapsed().as_millis() as i64;
                self.persist_error_record(&mut report, "Account state fetch", &e.to_string())
                    .await;
                return report;
            }
        };

        // 2. Fatal risk gate: only conditions that make calling the model
        // pointless belong here; open-gating happens per decision later.
        if account.equity <= 0.0 {
            let message = format!(
                "Risk limit reached: equity is zero or negative (${:.2})",
                account.equity
            );
            report.error = Some(message.clone());
            report.decision = Some(DecisionResponse::empty(&message));
            report.latency_ms = started.elapsed().as_millis() as i64;
            self.persist_error_record(&mut report, "Risk limit check", &message)
                .await;
            return report;
        }

        // 3. Market context for every watchlist symbol.
        let contexts = self.market_contexts().await;
        self.update_parser_market_data(&contexts);

        // 4. Prompts.
        let system_prompt = self.prompt_builder.build_system_prompt();
        let recent_trades = self.recent_trade_lines().await;
        let user_prompt = self
            .prompt_builder
            .build_user_prompt(&account, &contexts, &recent_trades);

        // 5. Generate: debate fan-out or single model.
        let mut debate_result: Option<DebateResult> = None;
        let (mut decision, raw_response) = if let Some(debate) = &self.debate {
            let result = debate
                .run_debate(&self.debate_clients, &system_prompt, &user_prompt)
                .await;
            report.tokens_used = result.participants.iter().map(|p| p.tokens_used).sum();
            report.is_debate = true;
            let mut decision = result.to_decision_response();
            // The debate path bypasses parser.parse(), so risk enforcement
            // and SL/TP auto-fill run explicitly on the consensus output.
            self.parser.enforce_risk_controls(&mut decision);
            let raw = result.combined_chain_of_thought.clone();
            debate_result = Some(result);
            (decision, raw)
        } else {
            let client = match &self.ai_client {
                Some(client) => Arc::clone(client),
                None => {
                    let message = "No AI model configured for this agent".to_string();
                    report.error = Some(message.clone());
                    report.latency_ms = started.elapsed().as_millis() as i64;
                    self.persist_error_record(&mut report, "AI invocation", &message)
                        .await;
                    return report;
                }
            };
            let response = match client.generate(&system_prompt, &user_prompt, true).await {
                Ok(response) => response,
                Err(e) => {
                    let message = e.to_string();
                    report.error = Some(message.clone());
                    report.latency_ms = started.elapsed().as_millis() as i64;
                    self.persist_record(
                        &mut report,
                        &system_prompt,
                        &user_prompt,
                        &message,
                        None,
                        &contexts,
                        Some(&account),
                        None,
                    )
                    .await;
                    return report;
                }
            };
            report.tokens_used = response.tokens_used;

            match self.parser.parse(&response.content) {
                Ok(decision) => (decision, response.content),
                Err(e) => {
                    let message = format!("Failed to parse AI response: {e}");
                    tracing::warn!(agent_id = %self.agent.id, "{message}");
                    report.error = Some(message.clone());
                    report.latency_ms = started.elapsed().as_millis() as i64;
                    self.persist_record(
                        &mut report,
                        &system_prompt,
                        &user_prompt,
                        &response.content,
                        None,
                        &contexts,
                        Some(&account),
                        None,
                    )
                    .await;
                    return report;
                }
            }
        };

        // Debate invalidity surfaces as an empty decision list with the
        // failure reason in the reasoning; still recorded.
        if let Some(result) = &debate_result {
            if !result.is_valid() {
                decision.decisions.clear();
            }
        }

        // 6. Execute (closes first, then opens; passive actions are skipped
        // inside).
        if self.agent.auto_execute {
            report.executed = self.execute_decisions(&decision, &mut account).await;
        }
        report.decision = Some(decision.clone());
        report.success = true;
        report.latency_ms = started.elapsed().as_millis() as i64;

        // 7. Persist the audit record and fold realized PnL into the
        // performance counters.
        self.persist_record(
            &mut report,
            &system_prompt,
            &user_prompt,
            &raw_response,
            Some(&decision),
            &contexts,
            Some(&account),
            debate_result.as_ref(),
        )
        .await;
        self.update_performance(&report.executed).await;

        report
    }

    // ------------------------------------------------------------------
    // Account / market context
    // ------------------------------------------------------------------

    /// Agent-isolated account view: only this agent's registry positions,
    /// valued at current prices, over the real account's balances. Falls
    /// back to the trader's full account when isolation is unavailable.
    async fn agent_account_state(&self) -> Result<AccountState, anyhow::Error> {
        let real = self.trader.get_account_state().await?;
        let ps = match &self.positions {
            Some(ps) => ps,
            None => return Ok(real),
        };

        let records = ps
            .get_agent_positions(self.agent.id, Some(position_service::PositionStatus::Open))
            .await?;
        let mut positions = Vec::new();
        let mut unrealized = 0.0;
        let mut margin_used = 0.0;
        for record in records {
            let mark = match self.trader.get_market_data(&record.symbol).await {
                Ok(data) if data.mid_price > 0.0 => data.mid_price,
                _ => record.entry_price,
            };
            let pnl = match record.side {
                PositionSide::Long => (mark - record.entry_price) * record.size,
                PositionSide::Short => (record.entry_price - mark) * record.size,
            };
            let margin = record.margin();
            unrealized += pnl;
            margin_used += margin;
            positions.push(Position {
                symbol: record.symbol.clone(),
                side: record.side,
                size: record.size,
                size_usd: record.size_usd,
                entry_price: record.entry_price,
                mark_price: mark,
                leverage: record.leverage.max(1) as u32,
                unrealized_pnl: pnl,
                unrealized_pnl_percent: if margin > 0.0 { pnl / margin * 100.0 } else { 0.0 },
                liquidation_price: None,
                margin_used: margin,
            });
        }

        Ok(AccountState {
            equity: real.equity,
            available_balance: real.available_balance,
            total_margin_used: margin_used,
            unrealized_pnl: unrealized,
            positions,
        })
    }

    async fn market_contexts(&self) -> Vec<MarketContext> {
        let mut contexts = Vec::new();
        for symbol in self.prompt_builder.symbols() {
            let current = match self.trader.get_market_data(symbol).await {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(%symbol, "market data fetch failed, skipping: {e}");
                    continue;
                }
            };
            let mut ctx = MarketContext::basic(symbol.clone(), current);

            for timeframe in &self.config.timeframes {
                match self.trader.get_klines(symbol, timeframe, 100).await {
                    Ok(klines) if !klines.is_empty() => {
                        ctx.indicators
                            .insert(timeframe.clone(), self.calculator.calculate(&klines));
                        ctx.klines.insert(timeframe.clone(), klines);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(%symbol, %timeframe, "kline fetch failed: {e}");
                    }
                }
            }

            match self.trader.get_funding_history(symbol, 24).await {
                Ok(rates) => ctx.funding_history = rates,
                Err(e) => tracing::debug!(%symbol, "funding history fetch failed: {e}"),
            }

            contexts.push(ctx);
        }
        contexts
    }

    fn update_parser_market_data(&mut self, contexts: &[MarketContext]) {
        let mut prices = HashMap::new();
        let mut atrs = HashMap::new();
        for ctx in contexts {
            if ctx.current.mid_price > 0.0 {
                prices.insert(ctx.symbol.clone(), ctx.current.mid_price);
            }
            if let Some(atr) = ctx.preferred_atr() {
                atrs.insert(ctx.symbol.clone(), atr);
            }
        }
        self.parser.update_market_data(prices, atrs);
    }

    async fn recent_trade_lines(&self) -> Vec<String> {
        let rows = match self.decisions.recent_executed(self.agent.id, 10).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::debug!("recent trade lookup failed: {e}");
                return vec![];
            }
        };
        let mut lines = Vec::new();
        for (created_at, results) in rows {
            if let Some(entries) = results.as_array() {
                for entry in entries {
                    if entry["executed"].as_bool() != Some(true) {
                        continue;
                    }
                    let pnl = entry["realized_pnl"].as_f64();
                    lines.push(format!(
                        "{} {}: {} ({created_at})",
                        entry["symbol"].as_str().unwrap_or("?"),
                        entry["action"].as_str().unwrap_or("?"),
                        pnl.map(|p| format!("${p:+.2}"))
                            .unwrap_or_else(|| "open".to_string()),
                    ));
                }
            }
        }
        lines
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    async fn execute_decisions(
        &self,
        decision: &DecisionResponse,
        account: &mut AccountState,
    ) -> Vec<ExecutionResult> {
        let mut results = Vec::new();

        // Closes release margin opens may need: closes, then opens, then
        // passive actions.
        let mut ordered: Vec<&TradingDecision> = decision.decisions.iter().collect();
        ordered.sort_by_key(|d| {
            if d.action.is_close() {
                0
            } else if d.action.is_open() {
                1
            } else {
                2
            }
        });

        let watchlist: std::collections::HashSet<String> = self
            .prompt_builder
            .symbols()
            .iter()
            .map(|s| s.to_uppercase())
            .collect();

        for d in ordered {
            let mut exec = ExecutionResult {
                symbol: d.symbol.clone(),
                action: d.action.as_str().to_string(),
                confidence: d.confidence,
                executed: false,
                reason: String::new(),
                requested_size_usd: d.position_size_usd,
                actual_size_usd: None,
                order: None,
                realized_pnl: None,
            };

            if !watchlist.is_empty() && !watchlist.contains(&d.symbol.to_uppercase()) {
                exec.reason = format!("Symbol {} not in strategy watchlist", d.symbol);
                tracing::warn!(symbol = %d.symbol, action = %d.action.as_str(), "skip: {}", exec.reason);
                results.push(exec);
                continue;
            }

            let (should, reason) = self.parser.should_execute(d);
            exec.reason = reason;
            if !should {
                results.push(exec);
                continue;
            }

            if d.action.is_open() {
                // Refresh balances right before committing margin; the
                // analysis-phase snapshot may be minutes old.
                if let Ok(fresh) = self.trader.get_account_state().await {
                    account.equity = fresh.equity;
                    account.available_balance = fresh.available_balance;
                }

                let (can_open, open_reason) = self.check_can_open(account).await;
                if !can_open {
                    exec.reason = open_reason;
                    tracing::warn!(symbol = %d.symbol, "skip open: {}", exec.reason);
                    results.push(exec);
                    continue;
                }
            }

            let position_size = self.apply_position_limits(d.position_size_usd, account, d.leverage);
            exec.actual_size_usd = Some(position_size);
            if (d.position_size_usd - position_size).abs() > f64::EPSILON {
                tracing::info!(
                    symbol = %d.symbol,
                    requested = d.position_size_usd,
                    capped = position_size,
                    "position size capped by risk limits"
                );
            }

            if d.action.is_open() && position_size < MIN_POSITION_SIZE_USD {
                exec.reason = format!(
                    "Position size ${position_size:.2} below minimum \
                     ${MIN_POSITION_SIZE_USD:.2} after risk limits (requested ${:.2})",
                    d.position_size_usd
                );
                results.push(exec);
                continue;
            }

            match self.execute_single(d, position_size, account).await {
                Ok((order, realized)) => {
                    exec.executed = order.success;
                    exec.order = Some(OrderSummary::from(&order));
                    exec.realized_pnl = realized;
                    if !order.success {
                        exec.reason = order
                            .error
                            .clone()
                            .unwrap_or_else(|| "order rejected".to_string());
                    }
                }
                Err(e) => {
                    exec.reason = e;
                    tracing::error!(
                        symbol = %d.symbol,
                        action = %d.action.as_str(),
                        "order exception: {}",
                        exec.reason
                    );
                }
            }
            results.push(exec);
        }

        results
    }

    /// Gate for opening new positions only; close/hold decisions are never
    /// blocked here.
    async fn check_can_open(&self, account: &AccountState) -> (bool, String) {
        let rc = &self.config.risk_controls;

        let open_count = match &self.positions {
            Some(ps) => ps
                .get_agent_positions(self.agent.id, Some(position_service::PositionStatus::Open))
                .await
                .map(|p| p.len())
                .unwrap_or(account.position_count()),
            None => account.position_count(),
        };
        if open_count >= self.max_positions {
            return (
                false,
                format!(
                    "Agent max positions ({}) reached (agent has {open_count})",
                    self.max_positions
                ),
            );
        }

        if account.margin_usage_percent() >= rc.max_total_exposure * 100.0 {
            return (
                false,
                format!(
                    "Margin usage {:.1}% exceeds limit",
                    account.margin_usage_percent()
                ),
            );
        }

        if account.equity > 0.0 && account.unrealized_pnl < 0.0 {
            let drawdown = -account.unrealized_pnl / account.equity;
            if drawdown >= rc.max_drawdown_percent {
                return (
                    false,
                    format!(
                        "Drawdown {:.1}% exceeds max {:.1}%",
                        drawdown * 100.0,
                        rc.max_drawdown_percent * 100.0
                    ),
                );
            }
        }

        (true, "OK".to_string())
    }

    /// Margin-based size cap: `max_position_ratio` limits margin as a
    /// share of effective equity, converted to a notional cap through
    /// leverage so high-leverage positions aren't starved.
    fn apply_position_limits(
        &self,
        requested: f64,
        account: &AccountState,
        leverage: u32,
    ) -> f64 {
        let rc = &self.config.risk_controls;
        let lev = leverage.max(1) as f64;
        let effective_equity = self
            .agent
            .effective_capital(account.equity)
            .unwrap_or(account.equity);

        let max_by_ratio = effective_equity * rc.max_position_ratio * lev;
        let max_by_balance = account.available_balance * 0.95 * lev;
        requested.min(max_by_ratio).min(max_by_balance)
    }

    async fn execute_single(
        &self,
        d: &TradingDecision,
        position_size: f64,
        account: &AccountState,
    ) -> Result<(OrderResult, Option<f64>), String> {
        match d.action {
            ActionType::OpenLong | ActionType::OpenShort => {
                self.execute_open(d, position_size, account).await
            }
            ActionType::CloseLong | ActionType::CloseShort => self.execute_close(d, account).await,
            ActionType::Hold | ActionType::Wait => Ok((OrderResult::no_action(), None)),
        }
    }

    async fn execute_open(
        &self,
        d: &TradingDecision,
        position_size: f64,
        account: &AccountState,
    ) -> Result<(OrderResult, Option<f64>), String> {
        let side = if d.action == ActionType::OpenLong {
            PositionSide::Long
        } else {
            PositionSide::Short
        };

        // Claim-then-fill: reserve the symbol (atomically with the capital
        // check) before touching the venue.
        let claim = match &self.positions {
            Some(ps) => {
                match ps
                    .claim_position_with_capital_check(
                        &self.agent,
                        "ai",
                        self.agent.account_id,
                        &d.symbol,
                        side,
                        d.leverage as i64,
                        account.equity,
                        position_size,
                    )
                    .await
                {
                    Ok(record) => Some(record),
                    Err(e @ PositionError::CapitalExceeded(_))
                    | Err(e @ PositionError::PositionConflict { .. }) => {
                        return Ok((OrderResult::failed(e.to_string()), None));
                    }
                    Err(e) => return Err(e.to_string()),
                }
            }
            None => None,
        };

        let order = match side {
            PositionSide::Long => {
                self.trader
                    .open_long(&d.symbol, position_size, d.leverage, d.stop_loss, d.take_profit)
                    .await
            }
            PositionSide::Short => {
                self.trader
                    .open_short(&d.symbol, position_size, d.leverage, d.stop_loss, d.take_profit)
                    .await
            }
        };

        let ps = self.positions.as_ref();
        let order = match order {
            Err(e) => {
                // The order may have landed despite the error; check the
                // venue before releasing the claim.
                if let (Some(ps), Some(claim)) = (ps, &claim) {
                    let mut release = true;
                    if let Ok(Some(pos)) = self.trader.get_position(&d.symbol).await {
                        if pos.size > 0.0 {
                            tracing::warn!(
                                symbol = %d.symbol,
                                "order errored but exchange shows a position, confirming claim"
                            );
                            if let Err(confirm_err) = ps
                                .confirm_position(claim.id, pos.size, pos.size_usd, pos.entry_price)
                                .await
                            {
                                tracing::error!(
                                    claim_id = %claim.id,
                                    "failed to confirm claim after order error: {confirm_err}"
                                );
                            }
                            release = false;
                        }
                    }
                    if release {
                        if let Err(release_err) = ps.release_claim(claim.id).await {
                            tracing::error!(claim_id = %claim.id, "release failed: {release_err}");
                        }
                    }
                }
                return Err(e.to_string());
            }
            Ok(order) => order,
        };

        if let (Some(ps), Some(claim)) = (ps, &claim) {
            if order.success {
                let estimated_size = order
                    .filled_size
                    .unwrap_or_else(|| position_size / order.filled_price.unwrap_or(1.0));
                if let Err(e) = ps
                    .confirm_position(
                        claim.id,
                        estimated_size,
                        position_size,
                        order.filled_price.unwrap_or(0.0),
                    )
                    .await
                {
                    // Never release after a successful order; reconciliation
                    // heals the pending row within five minutes.
                    tracing::error!(
                        claim_id = %claim.id,
                        "confirm failed after successful order, leaving pending: {e}"
                    );
                }
            } else if let Err(e) = ps.release_claim(claim.id).await {
                tracing::error!(claim_id = %claim.id, "release failed: {e}");
            }
        }

        Ok((order, None))
    }

    async fn execute_close(
        &self,
        d: &TradingDecision,
        account: &AccountState,
    ) -> Result<(OrderResult, Option<f64>), String> {
        // Capture entry data before the close so realized PnL uses the
        // actual fill against it.
        let live = account.positions.iter().find(|p| p.symbol == d.symbol);
        let record = match &self.positions {
            Some(ps) => ps
                .get_agent_position_for_symbol(self.agent.id, &d.symbol)
                .await
                .map_err(|e| e.to_string())?,
            None => None,
        };
        if record.is_none() && self.positions.is_some() {
            tracing::warn!(
                symbol = %d.symbol,
                agent_id = %self.agent.id,
                "no position record owned by agent, closing anyway"
            );
        }

        let order = self
            .trader
            .close_position(&d.symbol, None, None)
            .await
            .map_err(|e| e.to_string())?;
        if !order.success {
            return Ok((order, None));
        }

        let close_price = order.filled_price.unwrap_or(0.0);
        let (entry_price, size, side) = match (live, &record) {
            (Some(pos), _) if pos.entry_price > 0.0 && pos.size > 0.0 => {
                (pos.entry_price, pos.size, pos.side)
            }
            (_, Some(rec)) => (rec.entry_price, rec.size, rec.side),
            _ => (0.0, 0.0, PositionSide::Long),
        };

        let realized = if close_price > 0.0 && entry_price > 0.0 && size > 0.0 {
            let pnl = match side {
                PositionSide::Long => (close_price - entry_price) * size,
                PositionSide::Short => (entry_price - close_price) * size,
            };
            tracing::info!(
                symbol = %d.symbol,
                entry_price,
                close_price,
                size,
                pnl,
                "realized pnl computed from fill"
            );
            Some(pnl)
        } else {
            tracing::warn!(
                symbol = %d.symbol,
                close_price,
                entry_price,
                size,
                "cannot compute realized pnl"
            );
            None
        };

        if let (Some(ps), Some(rec)) = (&self.positions, &record) {
            ps.close_position_record(rec.id, close_price, realized.unwrap_or(0.0))
                .await
                .map_err(|e| e.to_string())?;
        }

        Ok((order, realized))
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    async fn persist_error_record(
        &self,
        report: &mut AiCycleReport,
        stage: &str,
        message: &str,
    ) {
        let decision = report.decision.clone();
        self.persist_record(
            report,
            stage,
            &format!("Error: {message}"),
            message,
            decision.as_ref(),
            &[],
            None,
            None,
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist_record(
        &self,
        report: &mut AiCycleReport,
        system_prompt: &str,
        user_prompt: &str,
        raw_response: &str,
        decision: Option<&DecisionResponse>,
        contexts: &[MarketContext],
        account: Option<&AccountState>,
        debate_result: Option<&DebateResult>,
    ) {
        let decisions_json = decision
            .map(|d| {
                json!(d
                    .decisions
                    .iter()
                    .map(|entry| {
                        json!({
                            "symbol": entry.symbol,
                            "action": entry.action.as_str(),
                            "leverage": entry.leverage,
                            "position_size_usd": entry.position_size_usd,
                            "entry_price": entry.entry_price,
                            "stop_loss": entry.stop_loss,
                            "take_profit": entry.take_profit,
                            "confidence": entry.confidence,
                            "risk_usd": entry.risk_usd,
                            "reasoning": entry.reasoning,
                        })
                    })
                    .collect::<Vec<_>>())
            })
            .unwrap_or_else(|| json!([]));

        let market_snapshot = if contexts.is_empty() {
            None
        } else {
            Some(json!(contexts
                .iter()
                .map(|ctx| ctx.to_snapshot(5))
                .collect::<Vec<_>>()))
        };
        let account_snapshot = account.map(|a| {
            json!({
                "equity": a.equity,
                "available_balance": a.available_balance,
                "total_margin_used": a.total_margin_used,
                "unrealized_pnl": a.unrealized_pnl,
                "margin_usage_percent": a.margin_usage_percent(),
                "position_count": a.position_count(),
                "positions": a.positions,
            })
        });

        let ai_model = if report.is_debate {
            format!("debate:{}models", self.debate_clients.len())
        } else {
            self.agent.ai_model.clone().unwrap_or_default()
        };

        let record = NewDecisionRecord {
            agent_id: self.agent.id,
            system_prompt: system_prompt.to_string(),
            user_prompt: user_prompt.to_string(),
            raw_response: raw_response.to_string(),
            chain_of_thought: decision.map(|d| d.chain_of_thought.clone()).unwrap_or_default(),
            market_assessment: decision.map(|d| d.market_assessment.clone()).unwrap_or_default(),
            decisions: decisions_json,
            overall_confidence: decision.map(|d| d.overall_confidence).unwrap_or(0),
            executed: report.executed.iter().any(|e| e.executed),
            execution_results: serde_json::to_value(&report.executed).unwrap_or(json!([])),
            error: report.error.clone(),
            ai_model,
            tokens_used: report.tokens_used,
            latency_ms: report.latency_ms,
            is_debate: report.is_debate,
            debate_models: debate_result.map(|r| {
                json!(r.participants.iter().map(|p| p.model_id.clone()).collect::<Vec<_>>())
            }),
            debate_responses: debate_result.map(|r| {
                json!(r
                    .participants
                    .iter()
                    .map(|p| {
                        json!({
                            "model_id": p.model_id,
                            "succeeded": p.succeeded(),
                            "confidence": p.overall_confidence,
                            "latency_ms": p.latency_ms,
                            "tokens_used": p.tokens_used,
                            "error": p.error,
                            "raw_response": p.raw_response,
                            "decisions": p.decisions.iter().map(|d| {
                                json!({
                                    "symbol": d.symbol,
                                    "action": d.action.as_str(),
                                    "confidence": d.confidence,
                                })
                            }).collect::<Vec<_>>(),
                        })
                    })
                    .collect::<Vec<_>>())
            }),
            debate_consensus_mode: debate_result.map(|r| r.consensus_mode.as_str().to_string()),
            debate_agreement_score: debate_result.map(|r| r.agreement_score),
            market_snapshot,
            account_snapshot,
        };

        match self.decisions.create(&record).await {
            Ok(id) => {
                report.decision_record_id = Some(id);
                tracing::debug!(record_id = %id, agent_id = %self.agent.id, "decision record saved");
            }
            Err(e) => {
                // Persistence failure never fails the cycle.
                tracing::error!(agent_id = %self.agent.id, "failed to save decision record: {e}");
            }
        }
    }

    async fn update_performance(&self, executed: &[ExecutionResult]) {
        for result in executed {
            if !result.executed {
                continue;
            }
            let Some(pnl) = result.realized_pnl else { continue };
            if let Err(e) = self
                .agents
                .update_performance(self.agent.id, pnl, pnl > 0.0, 1)
                .await
            {
                tracing::warn!(agent_id = %self.agent.id, "failed to update performance: {e}");
            } else {
                tracing::info!(
                    agent_id = %self.agent.id,
                    realized_pnl = pnl,
                    "agent performance updated"
                );
            }
        }
    }
}
