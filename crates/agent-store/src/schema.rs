use anyhow::Result;
use sqlx::AnyPool;

/// Create the agents / strategies / decisions tables and their indexes.
///
/// The partial index on active agents backs the stale-heartbeat scan.
pub async fn init_schema(pool: &AnyPool) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS strategies (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            name TEXT NOT NULL,
            strategy_type TEXT NOT NULL,
            symbol TEXT,
            config TEXT NOT NULL DEFAULT '{}',
            runtime_state TEXT NOT NULL DEFAULT '{}'
        )",
        "CREATE TABLE IF NOT EXISTS agents (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            account_id TEXT,
            strategy_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'draft',
            execution_mode TEXT NOT NULL DEFAULT 'mock',
            execution_interval_minutes INTEGER NOT NULL DEFAULT 5,
            allocated_capital REAL,
            allocated_capital_percent REAL,
            auto_execute INTEGER NOT NULL DEFAULT 1,
            ai_model TEXT,
            debate_enabled INTEGER NOT NULL DEFAULT 0,
            debate_models TEXT NOT NULL DEFAULT '[]',
            debate_consensus_mode TEXT,
            debate_min_participants INTEGER NOT NULL DEFAULT 2,
            worker_heartbeat_at TEXT,
            worker_instance_id TEXT,
            last_run_at TEXT,
            next_run_at TEXT,
            error_message TEXT,
            updated_at TEXT,
            total_pnl REAL NOT NULL DEFAULT 0,
            total_trades INTEGER NOT NULL DEFAULT 0,
            winning_trades INTEGER NOT NULL DEFAULT 0,
            losing_trades INTEGER NOT NULL DEFAULT 0,
            max_drawdown REAL NOT NULL DEFAULT 0
        )",
        "CREATE INDEX IF NOT EXISTS idx_agents_active_heartbeat
            ON agents (worker_heartbeat_at) WHERE status = 'active'",
        "CREATE TABLE IF NOT EXISTS decisions (
            id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            system_prompt TEXT NOT NULL DEFAULT '',
            user_prompt TEXT NOT NULL DEFAULT '',
            raw_response TEXT NOT NULL DEFAULT '',
            chain_of_thought TEXT NOT NULL DEFAULT '',
            market_assessment TEXT NOT NULL DEFAULT '',
            decisions TEXT NOT NULL DEFAULT '[]',
            overall_confidence INTEGER NOT NULL DEFAULT 0,
            executed INTEGER NOT NULL DEFAULT 0,
            execution_results TEXT NOT NULL DEFAULT '[]',
            error TEXT,
            ai_model TEXT NOT NULL DEFAULT '',
            tokens_used INTEGER NOT NULL DEFAULT 0,
            latency_ms INTEGER NOT NULL DEFAULT 0,
            is_debate INTEGER NOT NULL DEFAULT 0,
            debate_models TEXT,
            debate_responses TEXT,
            debate_consensus_mode TEXT,
            debate_agreement_score REAL,
            market_snapshot TEXT,
            account_snapshot TEXT
        )",
        "CREATE INDEX IF NOT EXISTS idx_decisions_agent_created
            ON decisions (agent_id, created_at)",
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
