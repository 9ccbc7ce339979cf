use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Draft,
    Active,
    Paused,
    Stopped,
    Error,
    Warning,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Draft => "draft",
            AgentStatus::Active => "active",
            AgentStatus::Paused => "paused",
            AgentStatus::Stopped => "stopped",
            AgentStatus::Error => "error",
            AgentStatus::Warning => "warning",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "draft" => Some(AgentStatus::Draft),
            "active" => Some(AgentStatus::Active),
            "paused" => Some(AgentStatus::Paused),
            "stopped" => Some(AgentStatus::Stopped),
            "error" => Some(AgentStatus::Error),
            "warning" => Some(AgentStatus::Warning),
            _ => None,
        }
    }

    /// Statuses whose capital allocation counts against the account cap.
    pub fn counts_toward_allocation(&self) -> bool {
        matches!(
            self,
            AgentStatus::Active | AgentStatus::Paused | AgentStatus::Warning
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Live,
    Mock,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Live => "live",
            ExecutionMode::Mock => "mock",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "live" => Some(ExecutionMode::Live),
            "mock" => Some(ExecutionMode::Mock),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AgentValidationError {
    #[error("allocated_capital and allocated_capital_percent are mutually exclusive")]
    ConflictingAllocation,
    #[error("active live agent requires an exchange account")]
    MissingAccount,
    #[error("execution_interval_minutes must be >= 1 (got {0})")]
    InvalidInterval(i64),
}

/// A runtime trading instance: strategy template + optional account +
/// execution mode + interval + (for AI strategies) an LLM configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub account_id: Option<Uuid>,
    pub strategy_id: Uuid,
    pub status: AgentStatus,
    pub execution_mode: ExecutionMode,
    pub execution_interval_minutes: i64,

    pub allocated_capital: Option<f64>,
    pub allocated_capital_percent: Option<f64>,

    // AI strategies only
    pub auto_execute: bool,
    pub ai_model: Option<String>,
    pub debate_enabled: bool,
    pub debate_models: Vec<String>,
    pub debate_consensus_mode: Option<String>,
    pub debate_min_participants: i64,

    // Worker liveness
    pub worker_heartbeat_at: Option<DateTime<Utc>>,
    pub worker_instance_id: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,

    // Performance counters
    pub total_pnl: f64,
    pub total_trades: i64,
    pub winning_trades: i64,
    pub losing_trades: i64,
    pub max_drawdown: f64,
}

impl Agent {
    /// Resolve the agent's capital budget. `None` means unlimited.
    pub fn effective_capital(&self, account_equity: f64) -> Option<f64> {
        if let Some(cap) = self.allocated_capital {
            return Some(cap);
        }
        self.allocated_capital_percent
            .map(|pct| account_equity * pct / 100.0)
    }

    pub fn validate(&self) -> Result<(), AgentValidationError> {
        if self.allocated_capital.is_some() && self.allocated_capital_percent.is_some() {
            return Err(AgentValidationError::ConflictingAllocation);
        }
        if self.status == AgentStatus::Active
            && self.execution_mode == ExecutionMode::Live
            && self.account_id.is_none()
        {
            return Err(AgentValidationError::MissingAccount);
        }
        if self.execution_interval_minutes < 1 {
            return Err(AgentValidationError::InvalidInterval(
                self.execution_interval_minutes,
            ));
        }
        Ok(())
    }
}
