use agent_core::parse_ts;
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Row};
use trader_trait::PositionSide;
use uuid::Uuid;

use crate::error::PositionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Pending,
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Pending => "pending",
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(PositionStatus::Pending),
            "open" => Some(PositionStatus::Open),
            "closed" => Some(PositionStatus::Closed),
            _ => None,
        }
    }
}

/// One row per (agent, symbol) currently claimed, open, or closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPosition {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub agent_type: String,
    pub account_id: Option<Uuid>,
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub size_usd: f64,
    pub entry_price: f64,
    pub leverage: i64,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    pub close_price: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl AgentPosition {
    /// Margin consumed by this position.
    pub fn margin(&self) -> f64 {
        self.size_usd / self.leverage.max(1) as f64
    }
}

pub(crate) const POSITION_COLUMNS: &str = "id, agent_id, agent_type, account_id, symbol, side, \
     size, size_usd, entry_price, leverage, status, opened_at, close_price, realized_pnl, \
     closed_at";

pub(crate) fn position_from_row(row: &AnyRow) -> Result<AgentPosition, PositionError> {
    let bad = |what: &str, e: &dyn std::fmt::Display| {
        PositionError::Internal(anyhow!("corrupt position row ({what}): {e}").to_string())
    };
    let side_raw: String = row.try_get("side")?;
    let status_raw: String = row.try_get("status")?;
    let opened_raw: String = row.try_get("opened_at")?;

    Ok(AgentPosition {
        id: Uuid::parse_str(&row.try_get::<String, _>("id")?)
            .map_err(|e| bad("id", &e))?,
        agent_id: Uuid::parse_str(&row.try_get::<String, _>("agent_id")?)
            .map_err(|e| bad("agent_id", &e))?,
        agent_type: row.try_get("agent_type")?,
        account_id: row
            .try_get::<Option<String>, _>("account_id")?
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| bad("account_id", &e))?,
        symbol: row.try_get("symbol")?,
        side: PositionSide::parse(&side_raw)
            .ok_or_else(|| bad("side", &side_raw))?,
        size: row.try_get("size")?,
        size_usd: row.try_get("size_usd")?,
        entry_price: row.try_get("entry_price")?,
        leverage: row.try_get("leverage")?,
        status: PositionStatus::parse(&status_raw)
            .ok_or_else(|| bad("status", &status_raw))?,
        opened_at: parse_ts(&opened_raw).ok_or_else(|| bad("opened_at", &opened_raw))?,
        close_price: row.try_get("close_price")?,
        realized_pnl: row.try_get("realized_pnl")?,
        closed_at: row
            .try_get::<Option<String>, _>("closed_at")?
            .as_deref()
            .and_then(parse_ts),
    })
}

/// Create the agent_positions table.
///
/// The partial unique index is the second safety net behind the Redis
/// claim lock: at most one pending/open row per (account, symbol).
pub async fn init_position_schema(pool: &AnyPool) -> Result<(), sqlx::Error> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS agent_positions (
            id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            agent_type TEXT NOT NULL DEFAULT 'quant',
            account_id TEXT,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL,
            size REAL NOT NULL DEFAULT 0,
            size_usd REAL NOT NULL DEFAULT 0,
            entry_price REAL NOT NULL DEFAULT 0,
            leverage INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL DEFAULT 'pending',
            opened_at TEXT NOT NULL,
            close_price REAL,
            realized_pnl REAL,
            closed_at TEXT
        )",
        "CREATE UNIQUE INDEX IF NOT EXISTS uq_agent_positions_account_symbol
            ON agent_positions (account_id, symbol) WHERE status IN ('pending', 'open')",
        "CREATE INDEX IF NOT EXISTS idx_agent_positions_agent
            ON agent_positions (agent_id, status)",
    ];
    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
