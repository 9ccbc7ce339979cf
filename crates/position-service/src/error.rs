use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PositionError {
    /// Another agent holds a pending/open record for this (account, symbol).
    #[error("symbol {symbol} is already occupied by agent {owner_agent_id}")]
    PositionConflict { symbol: String, owner_agent_id: Uuid },

    /// Opening would exceed the agent's or the account's capital budget,
    /// or the capital lock could not be acquired.
    #[error("capital allocation exceeded: {0}")]
    CapitalExceeded(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("{0}")]
    Internal(String),
}

impl PositionError {
    /// Domain outcomes the engines turn into skipped decisions; infra
    /// errors propagate as cycle errors instead.
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            PositionError::PositionConflict { .. } | PositionError::CapitalExceeded(_)
        )
    }
}
