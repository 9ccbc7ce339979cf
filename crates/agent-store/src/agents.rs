use agent_core::{format_ts, parse_ts, Agent, AgentStatus, ExecutionMode};
use anyhow::{anyhow, Result};
use chrono::Utc;
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Row};
use uuid::Uuid;

pub(crate) const AGENT_COLUMNS: &str = "id, user_id, account_id, strategy_id, status, execution_mode, \
     execution_interval_minutes, allocated_capital, allocated_capital_percent, auto_execute, \
     ai_model, debate_enabled, debate_models, debate_consensus_mode, debate_min_participants, \
     worker_heartbeat_at, worker_instance_id, last_run_at, next_run_at, error_message, \
     updated_at, total_pnl, total_trades, winning_trades, losing_trades, max_drawdown";

pub(crate) fn agent_from_row(row: &AnyRow) -> Result<Agent> {
    let parse_uuid = |raw: String| Uuid::parse_str(&raw).map_err(|e| anyhow!("bad uuid: {e}"));
    let status_raw: String = row.try_get("status")?;
    let mode_raw: String = row.try_get("execution_mode")?;

    Ok(Agent {
        id: parse_uuid(row.try_get("id")?)?,
        user_id: parse_uuid(row.try_get("user_id")?)?,
        account_id: row
            .try_get::<Option<String>, _>("account_id")?
            .map(|s| Uuid::parse_str(&s))
            .transpose()?,
        strategy_id: parse_uuid(row.try_get("strategy_id")?)?,
        status: AgentStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("unknown agent status: {status_raw}"))?,
        execution_mode: ExecutionMode::parse(&mode_raw)
            .ok_or_else(|| anyhow!("unknown execution mode: {mode_raw}"))?,
        execution_interval_minutes: row.try_get("execution_interval_minutes")?,
        allocated_capital: row.try_get("allocated_capital")?,
        allocated_capital_percent: row.try_get("allocated_capital_percent")?,
        auto_execute: row.try_get::<i64, _>("auto_execute")? != 0,
        ai_model: row.try_get("ai_model")?,
        debate_enabled: row.try_get::<i64, _>("debate_enabled")? != 0,
        debate_models: serde_json::from_str(&row.try_get::<String, _>("debate_models")?)
            .unwrap_or_default(),
        debate_consensus_mode: row.try_get("debate_consensus_mode")?,
        debate_min_participants: row.try_get("debate_min_participants")?,
        worker_heartbeat_at: row
            .try_get::<Option<String>, _>("worker_heartbeat_at")?
            .as_deref()
            .and_then(parse_ts),
        worker_instance_id: row.try_get("worker_instance_id")?,
        last_run_at: row
            .try_get::<Option<String>, _>("last_run_at")?
            .as_deref()
            .and_then(parse_ts),
        next_run_at: row
            .try_get::<Option<String>, _>("next_run_at")?
            .as_deref()
            .and_then(parse_ts),
        error_message: row.try_get("error_message")?,
        updated_at: row
            .try_get::<Option<String>, _>("updated_at")?
            .as_deref()
            .and_then(parse_ts),
        total_pnl: row.try_get("total_pnl")?,
        total_trades: row.try_get("total_trades")?,
        winning_trades: row.try_get("winning_trades")?,
        losing_trades: row.try_get("losing_trades")?,
        max_drawdown: row.try_get("max_drawdown")?,
    })
}

#[derive(Clone)]
pub struct AgentRepository {
    pool: AnyPool,
}

impl AgentRepository {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub async fn get_by_id(&self, agent_id: Uuid) -> Result<Option<Agent>> {
        let sql = format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(agent_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| agent_from_row(&r)).transpose()
    }

    pub async fn get_active(&self) -> Result<Vec<Agent>> {
        let sql = format!("SELECT {AGENT_COLUMNS} FROM agents WHERE status = 'active'");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(agent_from_row).collect()
    }

    pub async fn insert(&self, agent: &Agent) -> Result<()> {
        agent.validate()?;
        sqlx::query(
            "INSERT INTO agents (id, user_id, account_id, strategy_id, status, execution_mode, \
             execution_interval_minutes, allocated_capital, allocated_capital_percent, \
             auto_execute, ai_model, debate_enabled, debate_models, debate_consensus_mode, \
             debate_min_participants, updated_at, total_pnl, total_trades, winning_trades, \
             losing_trades, max_drawdown) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
             $17, $18, $19, $20, $21)",
        )
        .bind(agent.id.to_string())
        .bind(agent.user_id.to_string())
        .bind(agent.account_id.map(|id| id.to_string()))
        .bind(agent.strategy_id.to_string())
        .bind(agent.status.as_str())
        .bind(agent.execution_mode.as_str())
        .bind(agent.execution_interval_minutes)
        .bind(agent.allocated_capital)
        .bind(agent.allocated_capital_percent)
        .bind(agent.auto_execute as i64)
        .bind(agent.ai_model.clone())
        .bind(agent.debate_enabled as i64)
        .bind(serde_json::to_string(&agent.debate_models)?)
        .bind(agent.debate_consensus_mode.clone())
        .bind(agent.debate_min_participants)
        .bind(format_ts(Utc::now()))
        .bind(agent.total_pnl)
        .bind(agent.total_trades)
        .bind(agent.winning_trades)
        .bind(agent.losing_trades)
        .bind(agent.max_drawdown)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_status(
        &self,
        agent_id: Uuid,
        status: AgentStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE agents SET status = $1, error_message = $2, updated_at = $3 WHERE id = $4",
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(format_ts(Utc::now()))
        .bind(agent_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_run_times(&self, agent_id: Uuid, interval_minutes: i64) -> Result<()> {
        let now = Utc::now();
        let next = now + chrono::Duration::minutes(interval_minutes);
        sqlx::query("UPDATE agents SET last_run_at = $1, next_run_at = $2 WHERE id = $3")
            .bind(format_ts(now))
            .bind(format_ts(next))
            .bind(agent_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fold realized PnL into the performance counters.
    ///
    /// `max_drawdown` tracks the largest single realized loss.
    pub async fn update_performance(
        &self,
        agent_id: Uuid,
        pnl_change: f64,
        is_win: bool,
        trade_count: i64,
    ) -> Result<()> {
        let (wins, losses) = if is_win { (1i64, 0i64) } else { (0i64, 1i64) };
        sqlx::query(
            "UPDATE agents SET \
             total_pnl = total_pnl + $1, \
             total_trades = total_trades + $2, \
             winning_trades = winning_trades + $3, \
             losing_trades = losing_trades + $4, \
             max_drawdown = CASE WHEN $5 > max_drawdown THEN $5 ELSE max_drawdown END \
             WHERE id = $6",
        )
        .bind(pnl_change)
        .bind(trade_count)
        .bind(wins)
        .bind(losses)
        .bind(if pnl_change < 0.0 { -pnl_change } else { 0.0 })
        .bind(agent_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use sqlx::any::AnyPoolOptions;

    pub async fn memory_pool() -> AnyPool {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory SQLite");
        crate::schema::init_schema(&pool).await.unwrap();
        pool
    }

    pub fn sample_agent() -> Agent {
        Agent {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            account_id: Some(Uuid::new_v4()),
            strategy_id: Uuid::new_v4(),
            status: AgentStatus::Active,
            execution_mode: ExecutionMode::Live,
            execution_interval_minutes: 5,
            allocated_capital: None,
            allocated_capital_percent: None,
            auto_execute: true,
            ai_model: Some("openai:gpt-4o".to_string()),
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
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{memory_pool, sample_agent};
    use super::*;

    #[tokio::test]
    async fn round_trip_agent() {
        let pool = memory_pool().await;
        let repo = AgentRepository::new(pool);
        let agent = sample_agent();
        repo.insert(&agent).await.unwrap();

        let loaded = repo.get_by_id(agent.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, agent.id);
        assert_eq!(loaded.status, AgentStatus::Active);
        assert_eq!(loaded.ai_model.as_deref(), Some("openai:gpt-4o"));

        let active = repo.get_active().await.unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn performance_counters_accumulate() {
        let pool = memory_pool().await;
        let repo = AgentRepository::new(pool);
        let agent = sample_agent();
        repo.insert(&agent).await.unwrap();

        repo.update_performance(agent.id, 25.0, true, 1).await.unwrap();
        repo.update_performance(agent.id, -40.0, false, 1).await.unwrap();

        let loaded = repo.get_by_id(agent.id).await.unwrap().unwrap();
        assert!((loaded.total_pnl - -15.0).abs() < 1e-9);
        assert_eq!(loaded.total_trades, 2);
        assert_eq!(loaded.winning_trades, 1);
        assert_eq!(loaded.losing_trades, 1);
        assert!((loaded.max_drawdown - 40.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn status_and_run_times_update() {
        let pool = memory_pool().await;
        let repo = AgentRepository::new(pool);
        let agent = sample_agent();
        repo.insert(&agent).await.unwrap();

        repo.update_status(agent.id, AgentStatus::Error, Some("boom"))
            .await
            .unwrap();
        repo.update_run_times(agent.id, 5).await.unwrap();

        let loaded = repo.get_by_id(agent.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, AgentStatus::Error);
        assert_eq!(loaded.error_message.as_deref(), Some("boom"));
        let (last, next) = (loaded.last_run_at.unwrap(), loaded.next_run_at.unwrap());
        assert_eq!((next - last).num_minutes(), 5);
    }
}
