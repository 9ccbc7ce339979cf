//! Agent worker runtime: per-agent execution loops, the process-wide
//! worker manager, Redis leader election, and best-effort event publishing.
//!
//! One process instance claims ownership of each agent it runs via a Redis
//! key; a per-cycle execution lock guarantees that no two instances ever
//! run the same agent's cycle concurrently, even inside the ownership TTL
//! window.

pub mod config;
pub mod coordination;
pub mod events;
pub mod manager;
pub mod providers;
pub mod worker;

pub use config::RuntimeConfig;
pub use coordination::{instance_id, Coordinator};
pub use events::EventPublisher;
pub use manager::WorkerManager;
pub use providers::{EnvClientProvider, MockTraderProvider, TraderProvider};
pub use worker::AgentWorker;
