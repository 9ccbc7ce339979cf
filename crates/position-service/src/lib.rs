//! Strategy-level position isolation.
//!
//! The authoritative registry of which agent owns which symbol on which
//! account. Enforces symbol exclusivity via a Redis claim lock plus a
//! partial unique index, the claim-then-fill lifecycle
//! (`pending -> open -> closed`), capital allocation budgets, and
//! reconciliation against exchange-reported positions.

pub mod error;
pub mod locks;
pub mod records;
pub mod service;

#[cfg(test)]
mod tests;

pub use error::PositionError;
pub use records::{init_position_schema, AgentPosition, PositionStatus};
pub use service::{CapitalCheck, PositionService, ReconcileSummary};
