//! Distributed coordination: worker ownership (leader election) and the
//! per-cycle execution lock.
//!
//! Ownership keys expire after 120 s and are refreshed every sync tick; a
//! crashed instance's agents become claimable within one TTL. The
//! execution lock is fail-closed: if Redis cannot confirm the lock, the
//! cycle is skipped rather than risk a double execution.

use std::sync::OnceLock;

use redis::aio::ConnectionManager;
use uuid::Uuid;

pub const OWNER_TTL_SECONDS: u64 = 120;
pub const EXEC_LOCK_TTL_SECONDS: u64 = 300;

const WORKER_OWNER_PREFIX: &str = "worker_owner:";
const EXEC_LOCK_PREFIX: &str = "exec_lock:agent:";

// Atomically compare owner and refresh TTL.
// 1 = refreshed, 0 = owned by someone else, -1 = key missing.
const REFRESH_LUA: &str = r#"
local cur = redis.call('GET', KEYS[1])
if cur == false then
    return -1
elseif cur == ARGV[1] then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
    return 1
else
    return 0
end
"#;

// Atomically compare owner and delete.
const RELEASE_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Unique identifier for this process instance: `{pid}:{8-hex-random}`.
pub fn instance_id() -> &'static str {
    static INSTANCE_ID: OnceLock<String> = OnceLock::new();
    INSTANCE_ID.get_or_init(|| {
        let suffix = &Uuid::new_v4().simple().to_string()[..8];
        format!("{}:{}", std::process::id(), suffix)
    })
}

/// Ownership + execution-lock operations over an optional Redis handle.
/// With no Redis configured (single-instance deployment) ownership always
/// succeeds and the execution lock degrades to a no-op.
#[derive(Clone)]
pub struct Coordinator {
    redis: Option<ConnectionManager>,
    instance_id: String,
}

impl Coordinator {
    pub fn new(redis: Option<ConnectionManager>, instance_id: impl Into<String>) -> Self {
        Self {
            redis,
            instance_id: instance_id.into(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn is_distributed(&self) -> bool {
        self.redis.is_some()
    }

    /// Claim ownership of an agent via SET NX. Redis failures claim
    /// nothing; the periodic sync retries within a minute.
    pub async fn try_acquire_ownership(&self, agent_id: Uuid) -> bool {
        let Some(conn) = &self.redis else { return true };
        let mut conn = conn.clone();
        let key = format!("{WORKER_OWNER_PREFIX}{agent_id}");
        let result: Result<Option<String>, _> = redis::cmd("SET")
            .arg(&key)
            .arg(&self.instance_id)
            .arg("NX")
            .arg("EX")
            .arg(OWNER_TTL_SECONDS)
            .query_async(&mut conn)
            .await;
        match result {
            Ok(claimed) => claimed.is_some(),
            Err(e) => {
                tracing::warn!(%agent_id, "ownership claim failed, will retry on next sync: {e}");
                false
            }
        }
    }

    /// Refresh the ownership TTL. An expired key is reclaimed atomically;
    /// Redis being down keeps the worker running because the execution
    /// lock still prevents duplicate cycles.
    pub async fn refresh_ownership(&self, agent_id: Uuid) -> bool {
        let Some(conn) = &self.redis else { return true };
        let mut conn = conn.clone();
        let key = format!("{WORKER_OWNER_PREFIX}{agent_id}");

        let script = redis::Script::new(REFRESH_LUA);
        let result: Result<i64, _> = script
            .key(&key)
            .arg(&self.instance_id)
            .arg(OWNER_TTL_SECONDS)
            .invoke_async(&mut conn)
            .await;

        match result {
            Ok(1) => true,
            Ok(-1) => self.try_acquire_ownership(agent_id).await,
            Ok(_) => false,
            Err(e) => {
                tracing::warn!(%agent_id, "ownership refresh failed, keeping worker: {e}");
                true
            }
        }
    }

    /// Release ownership only if we still hold it. Best-effort: the TTL
    /// cleans up after us regardless.
    pub async fn release_ownership(&self, agent_id: Uuid) {
        let Some(conn) = &self.redis else { return };
        let mut conn = conn.clone();
        let key = format!("{WORKER_OWNER_PREFIX}{agent_id}");
        let script = redis::Script::new(RELEASE_LUA);
        let result: Result<i64, _> = script
            .key(&key)
            .arg(&self.instance_id)
            .invoke_async(&mut conn)
            .await;
        if let Err(e) = result {
            tracing::debug!(%agent_id, "ownership release failed, TTL will clean up: {e}");
        }
    }

    /// Acquire the per-cycle execution lock. Fail-closed: any Redis error
    /// returns None and the caller skips this cycle.
    pub async fn acquire_execution_lock(&self, agent_id: Uuid) -> Option<String> {
        let Some(conn) = &self.redis else {
            return Some(String::new());
        };
        let mut conn = conn.clone();
        let key = format!("{EXEC_LOCK_PREFIX}{agent_id}");
        let result: Result<Option<String>, _> = redis::cmd("SET")
            .arg(&key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(EXEC_LOCK_TTL_SECONDS)
            .query_async(&mut conn)
            .await;
        match result {
            Ok(Some(_)) => Some(key),
            Ok(None) => {
                tracing::warn!(%agent_id, "cycle already executing elsewhere, skipping");
                None
            }
            Err(e) => {
                tracing::warn!(%agent_id, "execution lock unavailable, skipping cycle: {e}");
                None
            }
        }
    }

    pub async fn release_execution_lock(&self, lock_key: &str) {
        if lock_key.is_empty() {
            return;
        }
        let Some(conn) = &self.redis else { return };
        let mut conn = conn.clone();
        let result: Result<i64, _> = redis::cmd("DEL").arg(lock_key).query_async(&mut conn).await;
        if let Err(e) = result {
            tracing::debug!(lock_key, "exec lock release failed, TTL will clean up: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_is_stable_and_shaped() {
        let a = instance_id();
        let b = instance_id();
        assert_eq!(a, b);
        let (pid, suffix) = a.split_once(':').unwrap();
        assert_eq!(pid, std::process::id().to_string());
        assert_eq!(suffix.len(), 8);
    }

    #[tokio::test]
    async fn single_instance_mode_always_owns() {
        let coordinator = Coordinator::new(None, "test-instance");
        let agent_id = Uuid::new_v4();
        assert!(coordinator.try_acquire_ownership(agent_id).await);
        assert!(coordinator.refresh_ownership(agent_id).await);
        let lock = coordinator.acquire_execution_lock(agent_id).await;
        assert_eq!(lock.as_deref(), Some(""));
    }
}
