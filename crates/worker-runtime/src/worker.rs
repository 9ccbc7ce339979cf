//! Per-agent worker: heartbeat task, ownership refresher, execution loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_core::{Agent, AgentStatus, StrategyKind};
use agent_store::{
    AgentRepository, DecisionRepository, HeartbeatService, StrategyRepository,
    HEARTBEAT_INTERVAL_SECONDS,
};
use ai_engine::StrategyEngine;
use position_service::PositionService;
use quant_engines::{create_engine, EngineCore};
use redis::aio::ConnectionManager;
use retry_utils::{backoff_delay, classify_message, ErrorKind, ErrorWindow};
use sqlx::AnyPool;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use trader_trait::Trader;
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::coordination::Coordinator;
use crate::events::EventPublisher;
use crate::providers::{EnvClientProvider, TraderProvider};

/// Hard ceiling on a single cycle; a hung cycle is a transient error.
const CYCLE_TIMEOUT: Duration = Duration::from_secs(300);
const STOP_GRACE: Duration = Duration::from_secs(30);
const OWNERSHIP_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Shared dependencies handed to every worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub pool: AnyPool,
    pub redis: Option<ConnectionManager>,
    pub config: RuntimeConfig,
    pub coordinator: Coordinator,
    pub events: EventPublisher,
    pub trader_provider: Arc<dyn TraderProvider>,
    pub clients: Arc<EnvClientProvider>,
}

enum CycleStatus {
    Completed,
    Skipped,
    AgentStopped,
}

pub struct AgentWorker {
    agent_id: Uuid,
    ctx: WorkerContext,
    trader: Arc<Mutex<Arc<dyn Trader>>>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
}

impl AgentWorker {
    /// Create the trader, send the initial heartbeat, and spawn the three
    /// long-lived tasks.
    pub async fn start(agent: Agent, ctx: WorkerContext) -> anyhow::Result<Self> {
        let strategies = StrategyRepository::new(ctx.pool.clone());
        let template = strategies
            .get_by_id(agent.strategy_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("strategy {} not found", agent.strategy_id))?;
        let symbols = template.symbols();

        let trader = ctx.trader_provider.create(&agent, &symbols).await?;
        let trader = Arc::new(Mutex::new(trader));

        // Initial heartbeat closes the visibility gap between activation
        // and the first cycle.
        let heartbeats = HeartbeatService::new(ctx.pool.clone());
        if let Err(e) = heartbeats
            .update_heartbeat(agent.id, ctx.coordinator.instance_id())
            .await
        {
            tracing::warn!(agent_id = %agent.id, "initial heartbeat failed: {e}");
        }

        let running = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(Notify::new());
        let mut tasks = Vec::new();

        // Heartbeat task.
        {
            let heartbeats = heartbeats.clone();
            let agent_id = agent.id;
            let instance = ctx.coordinator.instance_id().to_string();
            let running = Arc::clone(&running);
            let shutdown = Arc::clone(&shutdown);
            tasks.push(tokio::spawn(async move {
                let interval = Duration::from_secs(HEARTBEAT_INTERVAL_SECONDS);
                while running.load(Ordering::Relaxed) {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = shutdown.notified() => break,
                    }
                    if !running.load(Ordering::Relaxed) {
                        break;
                    }
                    if let Err(e) = heartbeats.update_heartbeat(agent_id, &instance).await {
                        tracing::warn!(%agent_id, "background heartbeat failed: {e}");
                    }
                }
            }));
        }

        // Ownership refresher: losing the key stops this worker so the new
        // owner runs alone.
        {
            let coordinator = ctx.coordinator.clone();
            let agent_id = agent.id;
            let running = Arc::clone(&running);
            let shutdown = Arc::clone(&shutdown);
            tasks.push(tokio::spawn(async move {
                while running.load(Ordering::Relaxed) {
                    tokio::select! {
                        _ = tokio::time::sleep(OWNERSHIP_REFRESH_INTERVAL) => {}
                        _ = shutdown.notified() => break,
                    }
                    if !running.load(Ordering::Relaxed) {
                        break;
                    }
                    if !coordinator.refresh_ownership(agent_id).await {
                        tracing::warn!(
                            %agent_id,
                            "ownership lost to another instance, stopping local worker"
                        );
                        running.store(false, Ordering::Relaxed);
                        shutdown.notify_waiters();
                        break;
                    }
                }
            }));
        }

        // Execution loop.
        {
            let ctx = ctx.clone();
            let agent_id = agent.id;
            let interval = Duration::from_secs(agent.execution_interval_minutes.max(1) as u64 * 60);
            let trader = Arc::clone(&trader);
            let running = Arc::clone(&running);
            let shutdown = Arc::clone(&shutdown);
            tasks.push(tokio::spawn(async move {
                execution_loop(ctx, agent_id, interval, trader, running, shutdown).await;
            }));
        }

        tracing::info!(agent_id = %agent.id, "worker started");
        Ok(Self {
            agent_id: agent.id,
            ctx,
            trader,
            running,
            shutdown,
            tasks,
        })
    }

    pub fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Graceful stop: cancel the tasks, wait out the grace period, clear
    /// the heartbeat, release ownership, close the trader.
    pub async fn stop(mut self) {
        self.running.store(false, Ordering::Relaxed);
        self.shutdown.notify_waiters();

        let drain = async {
            for task in self.tasks.drain(..) {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(STOP_GRACE, drain).await.is_err() {
            tracing::warn!(agent_id = %self.agent_id, "worker did not stop in time, aborting tasks");
            for task in &self.tasks {
                task.abort();
            }
        }

        let heartbeats = HeartbeatService::new(self.ctx.pool.clone());
        if let Err(e) = heartbeats.clear_heartbeat(self.agent_id).await {
            tracing::warn!(agent_id = %self.agent_id, "failed to clear heartbeat: {e}");
        }
        self.ctx.coordinator.release_ownership(self.agent_id).await;

        let trader = self.trader.lock().await;
        if let Err(e) = trader.close().await {
            tracing::warn!(agent_id = %self.agent_id, "error closing trader: {e}");
        }
        tracing::info!(agent_id = %self.agent_id, "worker stopped");
    }
}

async fn execution_loop(
    ctx: WorkerContext,
    agent_id: Uuid,
    interval: Duration,
    trader: Arc<Mutex<Arc<dyn Trader>>>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) {
    let mut error_window = ErrorWindow::new(
        ctx.config.worker_error_window_seconds,
        ctx.config.worker_max_consecutive_errors,
    );
    let mut attempt = 0u32;
    let agents = AgentRepository::new(ctx.pool.clone());

    while running.load(Ordering::Relaxed) {
        let cycle = tokio::time::timeout(
            CYCLE_TIMEOUT,
            run_agent_cycle(&ctx, agent_id, &trader),
        )
        .await;

        let error_message = match cycle {
            Ok(Ok(CycleStatus::Completed)) => {
                error_window.reset();
                attempt = 0;
                None
            }
            Ok(Ok(CycleStatus::Skipped)) => None,
            Ok(Ok(CycleStatus::AgentStopped)) => {
                tracing::info!(%agent_id, "agent no longer active, stopping worker");
                running.store(false, Ordering::Relaxed);
                shutdown.notify_waiters();
                break;
            }
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "cycle timed out after {}s",
                CYCLE_TIMEOUT.as_secs()
            )),
        };

        if let Some(message) = error_message {
            let kind = classify_message(&message);
            tracing::error!(%agent_id, ?kind, "cycle error: {message}");

            if kind == ErrorKind::Permanent {
                mark_errored(&agents, &ctx.events, agent_id, &message).await;
                running.store(false, Ordering::Relaxed);
                shutdown.notify_waiters();
                break;
            }

            error_window.record_error();
            if error_window.should_stop() {
                let summary = format!(
                    "too many errors within window ({} in {}s); last: {message}",
                    error_window.error_count(),
                    ctx.config.worker_error_window_seconds
                );
                mark_errored(&agents, &ctx.events, agent_id, &summary).await;
                running.store(false, Ordering::Relaxed);
                shutdown.notify_waiters();
                break;
            }

            // Network-shaped failures often mean dead connections; rebuild
            // the trader before the next cycle.
            try_reconnect_trader(&ctx, agent_id, &trader).await;

            let delay = backoff_delay(
                attempt,
                ctx.config.worker_retry_base_delay,
                ctx.config.worker_retry_max_delay,
                ctx.config.worker_retry_jitter,
            );
            attempt = attempt.saturating_add(1);
            tracing::info!(%agent_id, "backing off {:.1}s before next cycle", delay.as_secs_f64());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.notified() => break,
            }
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.notified() => break,
        }
    }
}

async fn mark_errored(
    agents: &AgentRepository,
    events: &EventPublisher,
    agent_id: Uuid,
    message: &str,
) {
    if let Err(e) = agents
        .update_status(agent_id, AgentStatus::Error, Some(message))
        .await
    {
        tracing::error!(%agent_id, "failed to mark agent as errored: {e}");
    }
    events
        .publish_strategy_status(agent_id, "error", Some(message))
        .await;
}

async fn try_reconnect_trader(
    ctx: &WorkerContext,
    agent_id: Uuid,
    trader: &Arc<Mutex<Arc<dyn Trader>>>,
) {
    let agents = AgentRepository::new(ctx.pool.clone());
    let strategies = StrategyRepository::new(ctx.pool.clone());
    let agent = match agents.get_by_id(agent_id).await {
        Ok(Some(agent)) => agent,
        _ => return,
    };
    let symbols = match strategies.get_by_id(agent.strategy_id).await {
        Ok(Some(template)) => template.symbols(),
        _ => return,
    };

    match ctx.trader_provider.create(&agent, &symbols).await {
        Ok(new_trader) => {
            let mut slot = trader.lock().await;
            if let Err(e) = slot.close().await {
                tracing::debug!(%agent_id, "error closing stale trader: {e}");
            }
            *slot = new_trader;
            tracing::info!(%agent_id, "trader reconnected");
        }
        Err(e) => {
            tracing::warn!(%agent_id, "trader reconnection failed: {e}");
        }
    }
}

/// One execution cycle under the distributed execution lock.
async fn run_agent_cycle(
    ctx: &WorkerContext,
    agent_id: Uuid,
    trader: &Arc<Mutex<Arc<dyn Trader>>>,
) -> anyhow::Result<CycleStatus> {
    let Some(lock_key) = ctx.coordinator.acquire_execution_lock(agent_id).await else {
        return Ok(CycleStatus::Skipped);
    };

    let result = run_agent_cycle_inner(ctx, agent_id, trader).await;
    ctx.coordinator.release_execution_lock(&lock_key).await;
    result
}

async fn run_agent_cycle_inner(
    ctx: &WorkerContext,
    agent_id: Uuid,
    trader: &Arc<Mutex<Arc<dyn Trader>>>,
) -> anyhow::Result<CycleStatus> {
    let agents = AgentRepository::new(ctx.pool.clone());
    let strategies = StrategyRepository::new(ctx.pool.clone());
    let heartbeats = HeartbeatService::new(ctx.pool.clone());

    heartbeats
        .update_heartbeat(agent_id, ctx.coordinator.instance_id())
        .await?;

    // Re-read the agent each cycle: the user may have paused or edited it.
    let Some(agent) = agents.get_by_id(agent_id).await? else {
        return Ok(CycleStatus::AgentStopped);
    };
    if agent.status != AgentStatus::Active {
        return Ok(CycleStatus::AgentStopped);
    }
    let Some(template) = strategies.get_by_id(agent.strategy_id).await? else {
        anyhow::bail!("strategy {} not found", agent.strategy_id);
    };

    let trader = trader.lock().await.clone();
    let positions = Some(PositionService::new(ctx.pool.clone(), ctx.redis.clone()));

    match &template.kind {
        StrategyKind::Quant(config) => {
            let symbol = template
                .symbol
                .clone()
                .ok_or_else(|| anyhow::anyhow!("quant strategy {} has no symbol", template.id))?;

            let core = EngineCore::new(agent.clone(), trader, symbol, positions);
            let mut engine = create_engine(config, core, template.runtime_state.clone());
            let outcome = engine.run_cycle().await;

            strategies
                .update_runtime_state(template.id, &outcome.updated_state)
                .await?;

            if outcome.trades_executed > 0 {
                agents
                    .update_performance(
                        agent.id,
                        outcome.pnl_change,
                        outcome.pnl_change > 0.0,
                        outcome.trades_executed as i64,
                    )
                    .await?;
                ctx.events
                    .publish_position_update(
                        agent.user_id,
                        agent.account_id,
                        serde_json::json!({
                            "agent_id": agent.id,
                            "trades_executed": outcome.trades_executed,
                            "total_size_usd": outcome.total_size_usd,
                            "pnl_change": outcome.pnl_change,
                        }),
                    )
                    .await;
            }

            if outcome.success {
                tracing::info!(%agent_id, "quant cycle: {}", outcome.message);
            } else {
                tracing::warn!(%agent_id, "quant cycle failed: {}", outcome.message);
            }
        }
        StrategyKind::Ai(config) => {
            let ai_client = agent
                .ai_model
                .as_deref()
                .and_then(|model| match ctx.clients.client_for(model) {
                    Ok(client) => Some(client),
                    Err(e) => {
                        tracing::warn!(%agent_id, "ai client unavailable: {e}");
                        None
                    }
                });
            let debate_clients = if agent.debate_enabled {
                ctx.clients.debate_clients(&agent.debate_models)
            } else {
                vec![]
            };

            let mut engine = StrategyEngine::new(
                agent.clone(),
                config.clone(),
                trader,
                positions,
                agents.clone(),
                DecisionRepository::new(ctx.pool.clone()),
                ai_client,
                debate_clients,
                ctx.config.default_max_positions,
            );
            let report = engine.run_cycle().await;

            ctx.events
                .publish_decision(
                    agent.user_id,
                    agent.id,
                    serde_json::json!({
                        "id": report.decision_record_id,
                        "success": report.success,
                        "error": report.error,
                        "latency_ms": report.latency_ms,
                        "tokens_used": report.tokens_used,
                        "is_debate": report.is_debate,
                        "overall_confidence": report
                            .decision
                            .as_ref()
                            .map(|d| d.overall_confidence),
                        "decisions": report.decision.as_ref().map(|d| {
                            d.decisions
                                .iter()
                                .map(|entry| {
                                    serde_json::json!({
                                        "symbol": entry.symbol,
                                        "action": entry.action.as_str(),
                                        "confidence": entry.confidence,
                                    })
                                })
                                .collect::<Vec<_>>()
                        }),
                    }),
                )
                .await;

            if report.executed.iter().any(|e| e.executed) {
                ctx.events
                    .publish_position_update(
                        agent.user_id,
                        agent.account_id,
                        serde_json::to_value(&report.executed)
                            .unwrap_or(serde_json::Value::Null),
                    )
                    .await;
            }

            // Domain skips and model errors live in the decision record;
            // only infrastructure failures bubble up as cycle errors.
            if let Some(error) = &report.error {
                if !report.success && !error.starts_with("Risk limit reached") {
                    anyhow::bail!("{error}");
                }
            }
        }
    }

    agents
        .update_run_times(agent_id, agent.execution_interval_minutes)
        .await?;
    Ok(CycleStatus::Completed)
}
