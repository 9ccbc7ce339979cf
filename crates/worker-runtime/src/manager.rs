//! Process-wide supervisor: discovers active agents, claims ownership, and
//! keeps one worker per claimed agent alive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_core::AgentStatus;
use agent_store::{AgentRepository, HeartbeatService};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::worker::{AgentWorker, WorkerContext};

const SYNC_INTERVAL: Duration = Duration::from_secs(60);

pub struct WorkerManager {
    ctx: WorkerContext,
    workers: DashMap<Uuid, AgentWorker>,
    sync_task: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl WorkerManager {
    pub fn new(ctx: WorkerContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            workers: DashMap::new(),
            sync_task: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Fresh start: wipe heartbeats, claim what we can, then keep syncing.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let heartbeats = HeartbeatService::new(self.ctx.pool.clone());
        match heartbeats.clear_all_for_active().await {
            Ok(count) => tracing::info!(count, "cleared heartbeats for active agents"),
            Err(e) => tracing::warn!("failed to clear heartbeats at startup: {e}"),
        }

        self.load_active_agents().await;

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while manager.running.load(Ordering::Relaxed) {
                tokio::time::sleep(SYNC_INTERVAL).await;
                if !manager.running.load(Ordering::Relaxed) {
                    break;
                }
                manager.prune_stopped_workers().await;
                manager.load_active_agents().await;
            }
        });
        *self.sync_task.lock().await = Some(handle);

        tracing::info!(
            instance_id = self.ctx.coordinator.instance_id(),
            workers = self.workers.len(),
            "worker manager started"
        );
        Ok(())
    }

    /// Start a worker for one agent if we can claim ownership.
    pub async fn start_agent(&self, agent_id: Uuid) -> bool {
        if self.workers.contains_key(&agent_id) {
            return true;
        }
        if !self.ctx.coordinator.try_acquire_ownership(agent_id).await {
            tracing::debug!(%agent_id, "agent owned by another instance, skipping");
            return false;
        }

        let agents = AgentRepository::new(self.ctx.pool.clone());
        let agent = match agents.get_by_id(agent_id).await {
            Ok(Some(agent)) if agent.status == AgentStatus::Active => agent,
            Ok(_) => {
                self.ctx.coordinator.release_ownership(agent_id).await;
                return false;
            }
            Err(e) => {
                tracing::error!(%agent_id, "failed to load agent: {e}");
                self.ctx.coordinator.release_ownership(agent_id).await;
                return false;
            }
        };

        match AgentWorker::start(agent, self.ctx.clone()).await {
            Ok(worker) => {
                self.workers.insert(agent_id, worker);
                true
            }
            Err(e) => {
                // A broken agent must not abort loading the others.
                tracing::error!(%agent_id, "failed to start worker: {e}");
                if let Err(status_err) = agents
                    .update_status(agent_id, AgentStatus::Error, Some(&e.to_string()))
                    .await
                {
                    tracing::error!(%agent_id, "failed to record startup error: {status_err}");
                }
                self.ctx
                    .events
                    .publish_strategy_status(agent_id, "error", Some(&e.to_string()))
                    .await;
                self.ctx.coordinator.release_ownership(agent_id).await;
                false
            }
        }
    }

    /// Stop a single agent's worker (e.g. on user pause).
    pub async fn stop_agent(&self, agent_id: Uuid) {
        if let Some((_, worker)) = self.workers.remove(&agent_id) {
            worker.stop().await;
        }
    }

    pub fn running_agents(&self) -> Vec<Uuid> {
        self.workers.iter().map(|entry| *entry.key()).collect()
    }

    /// Pick up agents whose previous owner crashed (their ownership key
    /// expired) and agents newly activated since the last sync.
    async fn load_active_agents(&self) {
        let agents = AgentRepository::new(self.ctx.pool.clone());
        let active = match agents.get_active().await {
            Ok(list) => list,
            Err(e) => {
                tracing::error!("failed to query active agents: {e}");
                return;
            }
        };
        for agent in active {
            if !self.workers.contains_key(&agent.id) {
                self.start_agent(agent.id).await;
            }
        }
    }

    /// Workers stop themselves on ownership loss or agent deactivation;
    /// collect their carcasses so a future sync can restart cleanly.
    async fn prune_stopped_workers(&self) {
        let stopped: Vec<Uuid> = self
            .workers
            .iter()
            .filter(|entry| !entry.value().is_running())
            .map(|entry| *entry.key())
            .collect();
        for agent_id in stopped {
            if let Some((_, worker)) = self.workers.remove(&agent_id) {
                tracing::info!(%agent_id, "collecting stopped worker");
                worker.stop().await;
            }
        }
    }

    /// Graceful shutdown: each worker releases its own ownership key.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.sync_task.lock().await.take() {
            handle.abort();
        }

        let ids: Vec<Uuid> = self.workers.iter().map(|entry| *entry.key()).collect();
        for agent_id in ids {
            if let Some((_, worker)) = self.workers.remove(&agent_id) {
                worker.stop().await;
            }
        }
        tracing::info!("worker manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::coordination::Coordinator;
    use crate::events::EventPublisher;
    use crate::providers::{EnvClientProvider, TraderProvider};
    use agent_core::{
        Agent, AgentStatus, ExecutionMode, GridConfig, QuantConfig, StrategyKind, StrategyTemplate,
    };
    use agent_store::StrategyRepository;
    use anyhow::Result;
    use async_trait::async_trait;
    use sqlx::any::AnyPoolOptions;
    use sqlx::AnyPool;
    use std::time::Duration;
    use trader_trait::{MockTrader, Trader};

    struct SeededTraderProvider;

    #[async_trait]
    impl TraderProvider for SeededTraderProvider {
        async fn create(&self, _agent: &Agent, symbols: &[String]) -> Result<Arc<dyn Trader>> {
            let trader = MockTrader::with_fees(10_000.0, 0.0, 0.0, 0.0);
            for symbol in symbols {
                trader.set_price(symbol, 100.0);
            }
            Ok(Arc::new(trader))
        }
    }

    async fn setup_pool() -> AnyPool {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory SQLite");
        agent_store::init_schema(&pool).await.unwrap();
        position_service::init_position_schema(&pool).await.unwrap();
        pool
    }

    fn test_ctx(pool: AnyPool) -> crate::worker::WorkerContext {
        crate::worker::WorkerContext {
            pool,
            redis: None,
            config: RuntimeConfig::default(),
            coordinator: Coordinator::new(None, "test-instance"),
            events: EventPublisher::new(None),
            trader_provider: Arc::new(SeededTraderProvider),
            clients: Arc::new(EnvClientProvider::default()),
        }
    }

    async fn seed_grid_agent(pool: &AnyPool) -> Agent {
        let strategies = StrategyRepository::new(pool.clone());
        let template = StrategyTemplate {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "btc grid".to_string(),
            symbol: Some("BTC".to_string()),
            kind: StrategyKind::Quant(QuantConfig::Grid(GridConfig {
                upper_price: 110.0,
                lower_price: 100.0,
                grid_count: 10,
                total_investment: 1000.0,
                leverage: 1,
            })),
            runtime_state: serde_json::json!({}),
        };
        strategies.insert(&template).await.unwrap();

        let agent = Agent {
            id: Uuid::new_v4(),
            user_id: template.user_id,
            account_id: None,
            strategy_id: template.id,
            status: AgentStatus::Active,
            execution_mode: ExecutionMode::Mock,
            execution_interval_minutes: 60,
            allocated_capital: None,
            allocated_capital_percent: None,
            auto_execute: true,
            ai_model: None,
            debate_enabled: false,
            debate_models: vec![],
            debate_consensus_mode: None,
            debate_min_participants: 2,
            worker_heartbeat_at: None,
            worker_instance_id: None,
            last_run_at: None,
            next_run_at: None,
            error_message: None,
            updated_at: None,
            total_pnl: 0.0,
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            max_drawdown: 0.0,
        };
        AgentRepository::new(pool.clone()).insert(&agent).await.unwrap();
        agent
    }

    #[tokio::test]
    async fn manager_runs_first_cycle_and_stops_cleanly() {
        let pool = setup_pool().await;
        let agent = seed_grid_agent(&pool).await;

        let manager = WorkerManager::new(test_ctx(pool.clone()));
        manager.start().await.unwrap();
        assert_eq!(manager.running_agents(), vec![agent.id]);

        // The first cycle runs immediately; poll until its effects land.
        let strategies = StrategyRepository::new(pool.clone());
        let agents = AgentRepository::new(pool.clone());
        let mut cycled = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let template = strategies.get_by_id(agent.strategy_id).await.unwrap().unwrap();
            if template.runtime_state.get("initialized").is_some() {
                cycled = true;
                break;
            }
        }
        assert!(cycled, "first grid cycle never ran");

        let template = strategies.get_by_id(agent.strategy_id).await.unwrap().unwrap();
        assert_eq!(template.runtime_state["filled_buys"], serde_json::json!(["0"]));

        let loaded = agents.get_by_id(agent.id).await.unwrap().unwrap();
        assert!(loaded.last_run_at.is_some());
        assert!(loaded.worker_heartbeat_at.is_some());
        assert_eq!(loaded.total_trades, 1);

        manager.stop().await;
        assert!(manager.running_agents().is_empty());

        // Graceful stop clears the heartbeat fields.
        let loaded = agents.get_by_id(agent.id).await.unwrap().unwrap();
        assert!(loaded.worker_heartbeat_at.is_none());
        assert!(loaded.worker_instance_id.is_none());
    }

    #[tokio::test]
    async fn startup_failure_marks_agent_errored_without_aborting_others() {
        struct FailingProvider;

        #[async_trait]
        impl TraderProvider for FailingProvider {
            async fn create(
                &self,
                _agent: &Agent,
                _symbols: &[String],
            ) -> Result<Arc<dyn Trader>> {
                anyhow::bail!("exchange credentials rejected")
            }
        }

        let pool = setup_pool().await;
        let agent = seed_grid_agent(&pool).await;

        let mut ctx = test_ctx(pool.clone());
        ctx.trader_provider = Arc::new(FailingProvider);
        let manager = WorkerManager::new(ctx);
        manager.start().await.unwrap();

        assert!(manager.running_agents().is_empty());
        let loaded = AgentRepository::new(pool.clone())
            .get_by_id(agent.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, AgentStatus::Error);
        assert!(loaded.error_message.unwrap().contains("credentials"));

        manager.stop().await;
    }
}
