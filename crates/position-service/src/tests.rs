use agent_core::{Agent, AgentStatus, ExecutionMode};
use chrono::Utc;
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use trader_trait::{Position, PositionSide};
use uuid::Uuid;

use crate::records::init_position_schema;
use crate::service::PositionService;
use crate::{PositionError, PositionStatus};

async fn setup() -> (AnyPool, PositionService) {
    sqlx::any::install_default_drivers();
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory SQLite");
    init_position_schema(&pool).await.unwrap();

    // Minimal agents table for the account-allocation query.
    sqlx::query(
        "CREATE TABLE agents (
            id TEXT PRIMARY KEY,
            account_id TEXT,
            status TEXT NOT NULL,
            allocated_capital REAL,
            allocated_capital_percent REAL
        )",
    )
    .execute(&pool)
    .await
    .unwrap();

    (pool.clone(), PositionService::new(pool, None))
}

fn agent_with_allocation(account_id: Uuid, capital: Option<f64>, percent: Option<f64>) -> Agent {
    Agent {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        account_id: Some(account_id),
        strategy_id: Uuid::new_v4(),
        status: AgentStatus::Active,
        execution_mode: ExecutionMode::Live,
        execution_interval_minutes: 5,
        allocated_capital: capital,
        allocated_capital_percent: percent,
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
    }
}

async fn register_agent(pool: &AnyPool, agent: &Agent) {
    sqlx::query(
        "INSERT INTO agents (id, account_id, status, allocated_capital, \
         allocated_capital_percent) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(agent.id.to_string())
    .bind(agent.account_id.map(|id| id.to_string()))
    .bind(agent.status.as_str())
    .bind(agent.allocated_capital)
    .bind(agent.allocated_capital_percent)
    .execute(pool)
    .await
    .unwrap();
}

fn exchange_position(symbol: &str, size: f64, entry: f64) -> Position {
    Position {
        symbol: symbol.to_string(),
        side: PositionSide::Long,
        size,
        size_usd: size * entry,
        entry_price: entry,
        mark_price: entry,
        leverage: 1,
        unrealized_pnl: 0.0,
        unrealized_pnl_percent: 0.0,
        liquidation_price: None,
        margin_used: size * entry,
    }
}

#[tokio::test]
async fn claim_then_confirm_lifecycle() {
    let (_pool, service) = setup().await;
    let agent_id = Uuid::new_v4();
    let account = Uuid::new_v4();

    let claim = service
        .claim_position(agent_id, "quant", Some(account), "btc", PositionSide::Long, 2)
        .await
        .unwrap();
    assert_eq!(claim.status, PositionStatus::Pending);
    assert_eq!(claim.symbol, "BTC");

    service
        .confirm_position(claim.id, 0.05, 5000.0, 100_000.0)
        .await
        .unwrap();
    let opened = service.get_by_id(claim.id).await.unwrap().unwrap();
    assert_eq!(opened.status, PositionStatus::Open);
    assert!((opened.size - 0.05).abs() < 1e-12);

    service
        .close_position_record(claim.id, 101_000.0, 50.0)
        .await
        .unwrap();
    let closed = service.get_by_id(claim.id).await.unwrap().unwrap();
    assert_eq!(closed.status, PositionStatus::Closed);
    assert!(closed.closed_at.is_some());
    assert_eq!(closed.realized_pnl, Some(50.0));
}

#[tokio::test]
async fn second_agent_claim_conflicts() {
    let (_pool, service) = setup().await;
    let account = Uuid::new_v4();
    let agent_a = Uuid::new_v4();
    let agent_b = Uuid::new_v4();

    let claim = service
        .claim_position(agent_a, "ai", Some(account), "BTC", PositionSide::Long, 1)
        .await
        .unwrap();

    let err = service
        .claim_position(agent_b, "ai", Some(account), "BTC", PositionSide::Long, 1)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PositionError::PositionConflict { ref symbol, owner_agent_id }
            if symbol == "BTC" && owner_agent_id == agent_a
    ));

    // Exactly one pending/open row exists for (account, BTC).
    let open = service.get_account_open_positions(account).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, claim.id);

    // Same agent re-claiming gets the existing record back.
    let again = service
        .claim_position(agent_a, "ai", Some(account), "BTC", PositionSide::Long, 1)
        .await
        .unwrap();
    assert_eq!(again.id, claim.id);

    assert!(!service
        .check_symbol_available(account, "BTC", None)
        .await
        .unwrap());
    assert!(service
        .check_symbol_available(account, "BTC", Some(agent_a))
        .await
        .unwrap());
    assert!(service
        .check_symbol_available(account, "ETH", None)
        .await
        .unwrap());
}

#[tokio::test]
async fn release_is_idempotent_and_never_deletes_open() {
    let (_pool, service) = setup().await;
    let agent_id = Uuid::new_v4();
    let account = Uuid::new_v4();

    let claim = service
        .claim_position(agent_id, "quant", Some(account), "ETH", PositionSide::Long, 1)
        .await
        .unwrap();
    service.release_claim(claim.id).await.unwrap();
    assert!(service.get_by_id(claim.id).await.unwrap().is_none());
    // Releasing again is a no-op.
    service.release_claim(claim.id).await.unwrap();

    let claim = service
        .claim_position(agent_id, "quant", Some(account), "ETH", PositionSide::Long, 1)
        .await
        .unwrap();
    service.confirm_position(claim.id, 1.0, 100.0, 100.0).await.unwrap();
    service.release_claim(claim.id).await.unwrap();
    let still_open = service.get_by_id(claim.id).await.unwrap().unwrap();
    assert_eq!(still_open.status, PositionStatus::Open);
}

#[tokio::test]
async fn accumulation_weighted_average_and_associativity() {
    let (_pool, service) = setup().await;
    let agent_id = Uuid::new_v4();
    let account = Uuid::new_v4();

    let claim = service
        .claim_position(agent_id, "quant", Some(account), "SOL", PositionSide::Long, 1)
        .await
        .unwrap();
    service.confirm_position(claim.id, 10.0, 1000.0, 100.0).await.unwrap();

    // Two successive accumulations...
    service
        .accumulate_position(claim.id, 5.0, 600.0, 120.0)
        .await
        .unwrap();
    service
        .accumulate_position(claim.id, 5.0, 700.0, 140.0)
        .await
        .unwrap();
    let split = service.get_by_id(claim.id).await.unwrap().unwrap();

    // ...equal one merged accumulation with the merged fill price.
    let claim2 = service
        .claim_position(agent_id, "quant", Some(account), "AVAX", PositionSide::Long, 1)
        .await
        .unwrap();
    service.confirm_position(claim2.id, 10.0, 1000.0, 100.0).await.unwrap();
    let merged_price = (5.0 * 120.0 + 5.0 * 140.0) / 10.0;
    service
        .accumulate_position(claim2.id, 10.0, 1300.0, merged_price)
        .await
        .unwrap();
    let merged = service.get_by_id(claim2.id).await.unwrap().unwrap();

    assert!((split.size - 20.0).abs() < 1e-9);
    assert!((split.size_usd - 2300.0).abs() < 1e-9);
    let expected_entry = (10.0 * 100.0 + 5.0 * 120.0 + 5.0 * 140.0) / 20.0;
    assert!((split.entry_price - expected_entry).abs() < 1e-6);
    assert!((split.entry_price - merged.entry_price).abs() < 1e-6);

    // Accumulating a pending record is a warned no-op.
    let pending = service
        .claim_position(agent_id, "quant", Some(account), "DOGE", PositionSide::Long, 1)
        .await
        .unwrap();
    service
        .accumulate_position(pending.id, 1.0, 100.0, 100.0)
        .await
        .unwrap();
    let untouched = service.get_by_id(pending.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, PositionStatus::Pending);
    assert_eq!(untouched.size, 0.0);
}

#[tokio::test]
async fn capital_cap_blocks_over_allocation() {
    let (pool, service) = setup().await;
    let account = Uuid::new_v4();
    let agent = agent_with_allocation(account, Some(200.0), None);
    register_agent(&pool, &agent).await;

    // Existing open position using $150 margin.
    let claim = service
        .claim_position(agent.id, "ai", Some(account), "BTC", PositionSide::Long, 1)
        .await
        .unwrap();
    service.confirm_position(claim.id, 1.5, 150.0, 100.0).await.unwrap();

    // $150 + $60 > $200 -> rejected.
    let err = service
        .claim_position_with_capital_check(
            &agent,
            "ai",
            Some(account),
            "ETH",
            PositionSide::Long,
            1,
            1000.0,
            60.0,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PositionError::CapitalExceeded(_)));

    // Boundary: requested margin just inside the budget passes...
    let check = service
        .check_capital_allocation(account, 1000.0, &agent, 200.0 - 150.0 - 0.01, 1)
        .await
        .unwrap();
    assert!(check.allowed, "{}", check.reason);
    // ...and just past it fails.
    let check = service
        .check_capital_allocation(account, 1000.0, &agent, 200.0 - 150.0 + 0.01, 1)
        .await
        .unwrap();
    assert!(!check.allowed);

    // Margin-based: same notional at 10x leverage is a tenth of the margin.
    let check = service
        .check_capital_allocation(account, 1000.0, &agent, 300.0, 10)
        .await
        .unwrap();
    assert!(check.allowed, "{}", check.reason);
}

#[tokio::test]
async fn account_ceiling_blocks_over_allocated_accounts() {
    let (pool, service) = setup().await;
    let account = Uuid::new_v4();

    let agent = agent_with_allocation(account, Some(500.0), None);
    register_agent(&pool, &agent).await;
    // A second strategy pushes total allocation past 95% of $1000 equity.
    let other = agent_with_allocation(account, Some(460.0), None);
    register_agent(&pool, &other).await;

    let check = service
        .check_capital_allocation(account, 1000.0, &agent, 10.0, 1)
        .await
        .unwrap();
    assert!(!check.allowed);
    assert!(check.reason.contains("over-allocated"));

    // Stopped strategies don't count toward the ceiling.
    sqlx::query("UPDATE agents SET status = 'stopped' WHERE id = $1")
        .bind(other.id.to_string())
        .execute(&pool)
        .await
        .unwrap();
    let check = service
        .check_capital_allocation(account, 1000.0, &agent, 10.0, 1)
        .await
        .unwrap();
    assert!(check.allowed, "{}", check.reason);
}

#[tokio::test]
async fn percent_allocation_resolves_against_equity() {
    let (pool, service) = setup().await;
    let account = Uuid::new_v4();
    let agent = agent_with_allocation(account, None, Some(20.0));
    register_agent(&pool, &agent).await;

    // 20% of $1000 = $200 budget.
    let check = service
        .check_capital_allocation(account, 1000.0, &agent, 199.0, 1)
        .await
        .unwrap();
    assert!(check.allowed);
    let check = service
        .check_capital_allocation(account, 1000.0, &agent, 201.0, 1)
        .await
        .unwrap();
    assert!(!check.allowed);
}

#[tokio::test]
async fn stale_pending_cleanup_frees_the_symbol() {
    let (pool, service) = setup().await;
    let agent_a = Uuid::new_v4();
    let agent_b = Uuid::new_v4();
    let account = Uuid::new_v4();

    let claim = service
        .claim_position(agent_a, "quant", Some(account), "BTC", PositionSide::Long, 1)
        .await
        .unwrap();

    // Fresh pending claims survive the GC.
    assert_eq!(service.cleanup_stale_pending(300).await.unwrap(), 0);

    // Simulate a crash 301 seconds ago.
    sqlx::query("UPDATE agent_positions SET opened_at = $1 WHERE id = $2")
        .bind(agent_core::format_ts(Utc::now() - chrono::Duration::seconds(301)))
        .bind(claim.id.to_string())
        .execute(&pool)
        .await
        .unwrap();
    assert_eq!(service.cleanup_stale_pending(300).await.unwrap(), 1);

    // The symbol is free again, for any agent.
    let reclaimed = service
        .claim_position(agent_b, "quant", Some(account), "BTC", PositionSide::Long, 1)
        .await
        .unwrap();
    assert_eq!(reclaimed.agent_id, agent_b);
}

#[tokio::test]
async fn reconcile_zombies_orphans_and_drift() {
    let (pool, service) = setup().await;
    let agent_id = Uuid::new_v4();
    let account = Uuid::new_v4();

    // Zombie candidate: open in DB, absent on exchange, past the grace
    // period.
    let zombie = service
        .claim_position(agent_id, "quant", Some(account), "BTC", PositionSide::Long, 1)
        .await
        .unwrap();
    service.confirm_position(zombie.id, 1.0, 100.0, 100.0).await.unwrap();
    sqlx::query("UPDATE agent_positions SET opened_at = $1 WHERE id = $2")
        .bind(agent_core::format_ts(Utc::now() - chrono::Duration::seconds(600)))
        .bind(zombie.id.to_string())
        .execute(&pool)
        .await
        .unwrap();

    // Recently opened record also missing on exchange: protected by grace.
    let recent = service
        .claim_position(agent_id, "quant", Some(account), "ETH", PositionSide::Long, 1)
        .await
        .unwrap();
    service.confirm_position(recent.id, 1.0, 100.0, 100.0).await.unwrap();

    // Drift candidate: sizes disagree beyond tolerance.
    let drift = service
        .claim_position(agent_id, "quant", Some(account), "SOL", PositionSide::Long, 1)
        .await
        .unwrap();
    service.confirm_position(drift.id, 2.0, 200.0, 100.0).await.unwrap();

    let exchange = vec![
        exchange_position("SOL", 3.0, 100.0),
        exchange_position("XRP", 5.0, 2.0),
    ];
    let summary = service.reconcile(account, &exchange).await.unwrap();

    assert_eq!(summary.zombies_closed, 1);
    assert_eq!(summary.orphans_found, 1);
    assert_eq!(summary.size_synced, 1);

    let zombie_row = service.get_by_id(zombie.id).await.unwrap().unwrap();
    assert_eq!(zombie_row.status, PositionStatus::Closed);

    let recent_row = service.get_by_id(recent.id).await.unwrap().unwrap();
    assert_eq!(recent_row.status, PositionStatus::Open);

    let drift_row = service.get_by_id(drift.id).await.unwrap().unwrap();
    assert!((drift_row.size - 3.0).abs() < 1e-12);

    let orphan = service.get_symbol_owner(account, "XRP").await.unwrap().unwrap();
    assert_eq!(orphan.agent_id, agent_core::UNOWNED_AGENT_ID);
    assert_eq!(orphan.agent_type, "unknown");
    assert_eq!(orphan.status, PositionStatus::Open);
}

#[tokio::test]
async fn mock_agents_without_account_are_isolated_per_agent() {
    let (_pool, service) = setup().await;
    let agent_a = Uuid::new_v4();
    let agent_b = Uuid::new_v4();

    let a = service
        .claim_position(agent_a, "quant", None, "BTC", PositionSide::Long, 1)
        .await
        .unwrap();
    // A different mock agent may hold the same symbol: no shared account.
    let b = service
        .claim_position(agent_b, "quant", None, "BTC", PositionSide::Long, 1)
        .await
        .unwrap();
    assert_ne!(a.id, b.id);

    // Re-claim by the same agent returns its own record.
    let again = service
        .claim_position(agent_a, "quant", None, "BTC", PositionSide::Long, 1)
        .await
        .unwrap();
    assert_eq!(again.id, a.id);
}
