//! Core domain model for the CoinPilot agent runtime.
//!
//! Shared by every other crate in the workspace: agents, strategy templates
//! with their per-type config schemas, AI decision/debate models, and the
//! timestamp helpers used for DB round-trips.

pub mod agent;
pub mod debate;
pub mod decision;
pub mod strategy;
pub mod time;

pub use agent::{Agent, AgentStatus, AgentValidationError, ExecutionMode};
pub use debate::{ConsensusMode, DebateConfig, DebateParticipant, DebateResult, DebateVote};
pub use decision::{
    decision_json_schema, ActionType, DecisionResponse, RiskControls, TradingDecision,
};
pub use strategy::{
    AiStrategyConfig, ConfigError, DcaConfig, GridConfig, Language, PromptSections, QuantConfig,
    RsiConfig, StrategyKind, StrategyTemplate, TradingMode,
};
pub use time::{format_ts, parse_ts, UNOWNED_AGENT_ID};
