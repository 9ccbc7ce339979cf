use std::sync::Arc;

use agent_core::{Agent, AgentStatus, DcaConfig, ExecutionMode, GridConfig, RsiConfig};
use chrono::Utc;
use position_service::{init_position_schema, PositionService, PositionStatus};
use serde_json::json;
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use trader_trait::{Kline, MockTrader, PositionSide, Trader};
use uuid::Uuid;

use crate::core::EngineCore;
use crate::dca::DcaEngine;
use crate::grid::GridEngine;
use crate::rsi::RsiEngine;
use crate::QuantEngine;

async fn setup_pool() -> AnyPool {
    sqlx::any::install_default_drivers();
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory SQLite");
    init_position_schema(&pool).await.unwrap();
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
    pool
}

fn test_agent(account_id: Option<Uuid>) -> Agent {
    Agent {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        account_id,
        strategy_id: Uuid::new_v4(),
        status: AgentStatus::Active,
        execution_mode: ExecutionMode::Live,
        execution_interval_minutes: 1,
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
    }
}

fn grid_config() -> GridConfig {
    GridConfig {
        upper_price: 110.0,
        lower_price: 100.0,
        grid_count: 10,
        total_investment: 1000.0,
        leverage: 1,
    }
}

fn frictionless_trader() -> Arc<MockTrader> {
    Arc::new(MockTrader::with_fees(100_000.0, 0.0, 0.0, 0.0))
}

fn klines_from(closes: &[f64]) -> Vec<Kline> {
    closes
        .iter()
        .map(|c| Kline {
            timestamp: Utc::now(),
            open: *c,
            high: c + 0.5,
            low: c - 0.5,
            close: *c,
            volume: 1.0,
        })
        .collect()
}

#[tokio::test]
async fn grid_single_tick_buys_bottom_level() {
    let pool = setup_pool().await;
    let trader = frictionless_trader();
    trader.set_price("BTC", 100.0);

    let account = Uuid::new_v4();
    let agent = test_agent(Some(account));
    let service = PositionService::new(pool.clone(), None);
    let core = EngineCore::new(agent.clone(), trader.clone(), "BTC", Some(service.clone()));
    let mut engine = GridEngine::new(core, grid_config(), json!({}));

    let outcome = engine.run_cycle().await;
    assert!(outcome.success, "{}", outcome.message);
    assert_eq!(outcome.trades_executed, 1);
    assert!((outcome.total_size_usd - 100.0).abs() < 1e-9);
    assert_eq!(outcome.updated_state["filled_buys"], json!(["0"]));
    assert_eq!(outcome.updated_state["filled_sells"], json!([]));

    // The claim was confirmed into an open record.
    let record = service
        .get_agent_position_for_symbol(agent.id, "BTC")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, PositionStatus::Open);
    assert!((record.size_usd - 100.0).abs() < 1e-9);
}

#[tokio::test]
async fn grid_oscillation_buy_sell_rebuy() {
    let pool = setup_pool().await;
    let trader = frictionless_trader();
    let account = Uuid::new_v4();
    let agent = test_agent(Some(account));
    let service = PositionService::new(pool.clone(), None);
    let core = EngineCore::new(agent.clone(), trader.clone(), "BTC", Some(service));
    let mut engine = GridEngine::new(core, grid_config(), json!({}));

    trader.set_price("BTC", 100.0);
    let first = engine.run_cycle().await;
    assert_eq!(first.trades_executed, 1);

    trader.set_price("BTC", 111.0);
    let second = engine.run_cycle().await;
    assert_eq!(second.trades_executed, 1);
    assert!(second.pnl_change > 0.0, "middle cycle realizes rung profit");

    trader.set_price("BTC", 100.0);
    let third = engine.run_cycle().await;
    assert_eq!(third.trades_executed, 1);

    assert_eq!(third.updated_state["filled_buys"], json!(["0"]));
    assert_eq!(third.updated_state["filled_sells"], json!(["0"]));
    let total: u32 = first.trades_executed + second.trades_executed + third.trades_executed;
    assert_eq!(total, 3);
}

#[tokio::test]
async fn grid_boundary_sell_and_next_buy_in_one_tick() {
    let pool = setup_pool().await;
    let trader = frictionless_trader();
    let account = Uuid::new_v4();
    let agent = test_agent(Some(account));
    let service = PositionService::new(pool.clone(), None);
    let core = EngineCore::new(agent.clone(), trader.clone(), "BTC", Some(service));
    let mut engine = GridEngine::new(core, grid_config(), json!({}));

    trader.set_price("BTC", 100.0);
    engine.run_cycle().await;

    // One step up: level-0 sell and level-1 buy both fire.
    trader.set_price("BTC", 101.0);
    let outcome = engine.run_cycle().await;
    assert_eq!(outcome.trades_executed, 2);
    assert_eq!(outcome.updated_state["filled_sells"], json!(["0"]));
    assert_eq!(outcome.updated_state["filled_buys"], json!(["1"]));
}

#[tokio::test]
async fn grid_reinitializes_on_config_change() {
    let pool = setup_pool().await;
    let trader = frictionless_trader();
    trader.set_price("BTC", 100.0);
    let agent = test_agent(Some(Uuid::new_v4()));
    let service = PositionService::new(pool.clone(), None);

    let core = EngineCore::new(agent.clone(), trader.clone(), "BTC", Some(service.clone()));
    let mut engine = GridEngine::new(core, grid_config(), json!({}));
    let outcome = engine.run_cycle().await;
    assert_eq!(outcome.updated_state["config_hash"], json!("110:100:10"));

    // Same state, edited bounds: state resets under the new hash.
    let mut widened = grid_config();
    widened.upper_price = 120.0;
    let core = EngineCore::new(agent.clone(), trader, "BTC", Some(service));
    let mut engine = GridEngine::new(core, widened, outcome.updated_state);
    let outcome = engine.run_cycle().await;
    assert_eq!(outcome.updated_state["config_hash"], json!("120:100:10"));
}

#[tokio::test]
async fn dca_take_profit_closes_everything() {
    let trader = frictionless_trader();
    trader.set_price("BTC", 95.0);
    trader.open_long("BTC", 300.0, 1, None, None).await.unwrap();
    trader.set_price("BTC", 100.0);

    let agent = test_agent(Some(Uuid::new_v4()));
    let core = EngineCore::new(agent, trader, "BTC", None);
    let config = DcaConfig {
        order_amount: 100.0,
        interval_minutes: 60,
        take_profit_percent: 5.0,
        total_budget: 0.0,
        max_orders: 0,
    };
    let state = json!({
        "initialized": true,
        "orders_placed": 3,
        "total_invested": 300.0,
        "total_quantity": 300.0 / 95.0,
        "avg_cost": 95.0,
        "last_order_time": Utc::now().to_rfc3339(),
    });
    let mut engine = DcaEngine::new(core, config, state);

    let outcome = engine.run_cycle().await;
    assert!(outcome.success, "{}", outcome.message);
    assert_eq!(outcome.trades_executed, 1);
    // pnl = quantity * price - invested = (300/95) * 100 - 300
    assert!((outcome.pnl_change - 15.789).abs() < 0.01, "pnl={}", outcome.pnl_change);

    assert_eq!(outcome.updated_state["total_invested"], json!(0.0));
    assert_eq!(outcome.updated_state["total_quantity"], json!(0.0));
    assert_eq!(outcome.updated_state["avg_cost"], json!(0.0));
}

#[tokio::test]
async fn dca_take_profit_boundary() {
    let config = DcaConfig {
        order_amount: 100.0,
        interval_minutes: 60,
        take_profit_percent: 5.0,
        total_budget: 0.0,
        max_orders: 0,
    };
    let state = json!({
        "initialized": true,
        "orders_placed": 1,
        "total_invested": 95.0,
        "total_quantity": 1.0,
        "avg_cost": 95.0,
        "last_order_time": Utc::now().to_rfc3339(),
    });

    // Just below the 5% threshold (95 * 1.05 = 99.75): no take-profit, and
    // the interval gate blocks a new buy.
    let trader = frictionless_trader();
    trader.set_price("BTC", 95.0);
    trader.open_long("BTC", 95.0, 1, None, None).await.unwrap();
    trader.set_price("BTC", 99.74);
    let core = EngineCore::new(test_agent(None), trader, "BTC", None);
    let mut engine = DcaEngine::new(core, config.clone(), state.clone());
    let outcome = engine.run_cycle().await;
    assert_eq!(outcome.trades_executed, 0);
    assert!(outcome.message.contains("Waiting for interval"));

    // Just above: the whole ladder exits.
    let trader = frictionless_trader();
    trader.set_price("BTC", 95.0);
    trader.open_long("BTC", 95.0, 1, None, None).await.unwrap();
    trader.set_price("BTC", 99.76);
    let core = EngineCore::new(test_agent(None), trader, "BTC", None);
    let mut engine = DcaEngine::new(core, config, state);
    let outcome = engine.run_cycle().await;
    assert_eq!(outcome.trades_executed, 1);
    assert!(outcome.message.starts_with("Take profit"));
}

#[tokio::test]
async fn dca_respects_budget_and_order_caps() {
    let trader = frictionless_trader();
    trader.set_price("BTC", 100.0);
    let core = EngineCore::new(test_agent(None), trader, "BTC", None);
    let config = DcaConfig {
        order_amount: 100.0,
        interval_minutes: 60,
        take_profit_percent: 5.0,
        total_budget: 300.0,
        max_orders: 0,
    };
    let state = json!({
        "initialized": true,
        "orders_placed": 3,
        "total_invested": 300.0,
        "total_quantity": 3.0,
        "avg_cost": 100.0,
    });
    let mut engine = DcaEngine::new(core, config, state);
    let outcome = engine.run_cycle().await;
    assert_eq!(outcome.trades_executed, 0);
    assert!(outcome.message.contains("Budget limit reached"));
}

#[tokio::test]
async fn dca_updates_weighted_average_cost() {
    let trader = frictionless_trader();
    trader.set_price("BTC", 100.0);
    let core = EngineCore::new(test_agent(None), trader.clone(), "BTC", None);
    let config = DcaConfig {
        order_amount: 100.0,
        interval_minutes: 60,
        take_profit_percent: 50.0,
        total_budget: 0.0,
        max_orders: 0,
    };
    let mut engine = DcaEngine::new(core, config, json!({}));

    let first = engine.run_cycle().await;
    assert_eq!(first.trades_executed, 1);
    assert!((first.updated_state["avg_cost"].as_f64().unwrap() - 100.0).abs() < 1e-9);

    // Second buy at a lower price pulls the average down. The interval
    // gate is bypassed by clearing last_order_time.
    trader.set_price("BTC", 80.0);
    let state = {
        let mut s = first.updated_state.clone();
        s["last_order_time"] = serde_json::Value::Null;
        s
    };
    let core = EngineCore::new(test_agent(None), trader, "BTC", None);
    let mut engine = DcaEngine::new(core, engine_config(), state);
    let second = engine.run_cycle().await;
    assert_eq!(second.trades_executed, 1);

    // 100 USD @ 100 (qty 1) + 100 USD @ 80 (qty 1.25) -> 200 / 2.25
    let avg = second.updated_state["avg_cost"].as_f64().unwrap();
    assert!((avg - 200.0 / 2.25).abs() < 1e-6, "avg={avg}");
}

fn engine_config() -> DcaConfig {
    DcaConfig {
        order_amount: 100.0,
        interval_minutes: 60,
        take_profit_percent: 50.0,
        total_budget: 0.0,
        max_orders: 0,
    }
}

#[tokio::test]
async fn rsi_buys_oversold_and_sells_overbought() {
    let trader = frictionless_trader();
    let agent = test_agent(None);
    let config = RsiConfig {
        rsi_period: 14,
        overbought_threshold: 70.0,
        oversold_threshold: 30.0,
        order_amount: 100.0,
        timeframe: "1h".to_string(),
        leverage: 1,
    };

    // Monotonically falling closes drive RSI to 0: buy.
    let falling: Vec<f64> = (0..30).map(|i| 200.0 - i as f64).collect();
    trader.set_klines("BTC", "1h", klines_from(&falling));
    trader.set_price("BTC", 171.0);

    let core = EngineCore::new(agent.clone(), trader.clone(), "BTC", None);
    let mut engine = RsiEngine::new(core, config.clone(), json!({}));
    let outcome = engine.run_cycle().await;
    assert_eq!(outcome.trades_executed, 1);
    assert_eq!(outcome.updated_state["has_position"], json!(true));
    assert_eq!(outcome.updated_state["last_signal"], json!("buy"));
    assert!(outcome.updated_state["last_rsi"].as_f64().unwrap() < 1.0);

    // Monotonically rising closes drive RSI to 100: sell at a profit.
    let rising: Vec<f64> = (0..30).map(|i| 171.0 + i as f64).collect();
    trader.set_klines("BTC", "1h", klines_from(&rising));
    trader.set_price("BTC", 200.0);

    let core = EngineCore::new(agent, trader, "BTC", None);
    let mut engine = RsiEngine::new(core, config, outcome.updated_state);
    let outcome = engine.run_cycle().await;
    assert_eq!(outcome.trades_executed, 1);
    assert_eq!(outcome.updated_state["has_position"], json!(false));
    assert_eq!(outcome.updated_state["last_signal"], json!("sell"));
    assert!(outcome.pnl_change > 0.0);
}

#[tokio::test]
async fn rsi_resets_state_when_exchange_has_no_position() {
    let trader = frictionless_trader();
    let config = RsiConfig {
        rsi_period: 14,
        overbought_threshold: 70.0,
        oversold_threshold: 30.0,
        order_amount: 100.0,
        timeframe: "1h".to_string(),
        leverage: 1,
    };
    // Neutral series keeps RSI mid-range so no trades fire.
    let flat: Vec<f64> = (0..30)
        .map(|i| 100.0 + if i % 2 == 0 { 1.0 } else { -1.0 })
        .collect();
    trader.set_klines("BTC", "1h", klines_from(&flat));
    trader.set_price("BTC", 100.0);

    // State claims a position the exchange does not have.
    let state = json!({
        "initialized": true,
        "has_position": true,
        "entry_price": 90.0,
        "position_size_usd": 100.0,
    });
    let core = EngineCore::new(test_agent(None), trader, "BTC", None);
    let mut engine = RsiEngine::new(core, config, state);
    let outcome = engine.run_cycle().await;
    assert_eq!(outcome.trades_executed, 0);
    assert_eq!(outcome.updated_state["has_position"], json!(false));
    assert_eq!(outcome.updated_state["entry_price"], json!(0.0));
}

#[tokio::test]
async fn capital_budget_rejects_engine_open() {
    let pool = setup_pool().await;
    let trader = frictionless_trader();
    trader.set_price("ETH", 100.0);

    let account = Uuid::new_v4();
    let mut agent = test_agent(Some(account));
    agent.allocated_capital = Some(50.0);
    sqlx::query(
        "INSERT INTO agents (id, account_id, status, allocated_capital) VALUES ($1, $2, $3, $4)",
    )
    .bind(agent.id.to_string())
    .bind(account.to_string())
    .bind("active")
    .bind(50.0)
    .execute(&pool)
    .await
    .unwrap();

    let service = PositionService::new(pool, None);
    let mut core = EngineCore::new(agent, trader, "ETH", Some(service.clone()));

    // Requested margin $100 > $50 budget: domain rejection, no claim left.
    let result = core
        .open_with_isolation(100.0, 1, PositionSide::Long)
        .await
        .unwrap();
    assert!(!result.success);
    assert!(result.error.unwrap().contains("capital"));
    assert!(service
        .get_account_open_positions(account)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn failed_order_releases_fresh_claim_only() {
    let pool = setup_pool().await;
    // No price set: the order errors with an invalid-price TradeError.
    let trader = frictionless_trader();

    let account = Uuid::new_v4();
    let agent = test_agent(Some(account));
    let service = PositionService::new(pool, None);
    let mut core = EngineCore::new(agent.clone(), trader.clone(), "BTC", Some(service.clone()));

    // Equity fetch works; the order itself fails.
    let err = core.open_with_isolation(100.0, 1, PositionSide::Long).await;
    assert!(err.is_err());
    // The pending claim was released.
    assert!(service
        .get_agent_position_for_symbol(agent.id, "BTC")
        .await
        .unwrap()
        .is_none());
}
