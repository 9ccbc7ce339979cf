//! Persistent registry for agents, strategy templates and decision records,
//! plus the worker heartbeat service.
//!
//! Plain SQL over `sqlx::AnyPool`: Postgres in production, in-memory SQLite
//! in tests. Timestamps are stored as fixed-width UTC TEXT so lexicographic
//! comparison in SQL matches chronological order.

pub mod agents;
pub mod decisions;
pub mod heartbeat;
pub mod schema;
pub mod strategies;

pub use agents::AgentRepository;
pub use decisions::{DecisionRepository, NewDecisionRecord};
pub use heartbeat::{
    HeartbeatService, HEARTBEAT_INTERVAL_SECONDS, HEARTBEAT_TIMEOUT_SECONDS, STARTUP_GRACE_SECONDS,
};
pub use schema::init_schema;
pub use strategies::StrategyRepository;
