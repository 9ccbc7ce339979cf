//! Worker heartbeat service.
//!
//! Lifecycle: a worker clears any stale heartbeat at start, stamps
//! `worker_heartbeat_at` every interval, and clears it on graceful stop.
//! A crashed worker leaves a stale timestamp behind; the stale detector
//! turns those agents into `status = error` so operators see them.

use agent_core::{format_ts, Agent, AgentStatus};
use anyhow::Result;
use chrono::{Duration, Utc};
use sqlx::AnyPool;
use uuid::Uuid;

use crate::agents::{agent_from_row, AGENT_COLUMNS};

/// Workers stamp a heartbeat this often.
pub const HEARTBEAT_INTERVAL_SECONDS: u64 = 60;
/// Three missed beats mark an agent stale.
pub const HEARTBEAT_TIMEOUT_SECONDS: i64 = 180;
/// Window after activation during which a missing heartbeat is not stale.
pub const STARTUP_GRACE_SECONDS: i64 = 60;

#[derive(Clone)]
pub struct HeartbeatService {
    pool: AnyPool,
}

impl HeartbeatService {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    pub async fn update_heartbeat(&self, agent_id: Uuid, instance_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE agents SET worker_heartbeat_at = $1, worker_instance_id = $2 WHERE id = $3",
        )
        .bind(format_ts(Utc::now()))
        .bind(instance_id)
        .bind(agent_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_heartbeat(&self, agent_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE agents SET worker_heartbeat_at = NULL, worker_instance_id = NULL \
             WHERE id = $1",
        )
        .bind(agent_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fresh-start reset: wipe heartbeats for every active agent so a
    /// previous process's timestamps can't trip the stale detector.
    pub async fn clear_all_for_active(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE agents SET worker_heartbeat_at = NULL, worker_instance_id = NULL \
             WHERE status = 'active'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Active agents whose heartbeat (or, lacking one, last run) is older
    /// than the timeout. Agents with neither are freshly started and get a
    /// pass until their first cycle.
    pub async fn detect_stale(&self, timeout_seconds: i64) -> Result<Vec<Agent>> {
        let cutoff = format_ts(Utc::now() - Duration::seconds(timeout_seconds));
        let sql = format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE status = 'active' AND (\
             (worker_heartbeat_at IS NOT NULL AND worker_heartbeat_at < $1) OR \
             (worker_heartbeat_at IS NULL AND last_run_at IS NOT NULL AND last_run_at < $2))"
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff.clone())
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(agent_from_row).collect()
    }

    /// Transition every stale agent to `error` with a descriptive message
    /// and cleared heartbeat fields. Returns how many were marked.
    pub async fn mark_stale_as_error(&self, timeout_seconds: i64) -> Result<usize> {
        let stale = self.detect_stale(timeout_seconds).await?;
        if stale.is_empty() {
            return Ok(0);
        }

        let mut count = 0;
        for agent in &stale {
            let message = match agent.worker_heartbeat_at {
                Some(at) => format!(
                    "Worker heartbeat timeout - agent may have crashed \
                     (last heartbeat: {}, timeout: {}min)",
                    at.format("%Y-%m-%d %H:%M:%S UTC"),
                    timeout_seconds / 60
                ),
                None => {
                    let last_run = agent
                        .last_run_at
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                        .unwrap_or_else(|| "never".to_string());
                    format!(
                        "Worker startup incomplete - no heartbeat received (last run: {last_run})"
                    )
                }
            };

            sqlx::query(
                "UPDATE agents SET status = 'error', error_message = $1, \
                 worker_heartbeat_at = NULL, worker_instance_id = NULL WHERE id = $2",
            )
            .bind(&message)
            .bind(agent.id.to_string())
            .execute(&self.pool)
            .await?;
            count += 1;
            tracing::warn!(agent_id = %agent.id, "marked stale agent as error: {message}");
        }
        Ok(count)
    }

    /// Whether an agent's worker appears alive right now.
    pub fn is_running(agent: &Agent, timeout_seconds: i64, startup_grace_seconds: i64) -> bool {
        if agent.status != AgentStatus::Active {
            return false;
        }
        let now = Utc::now();
        match agent.worker_heartbeat_at {
            Some(beat) => beat > now - Duration::seconds(timeout_seconds),
            None => {
                // No heartbeat yet: allow the startup grace window, using
                // updated_at as the activation time.
                agent
                    .updated_at
                    .map(|t| t > now - Duration::seconds(startup_grace_seconds))
                    .unwrap_or(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::test_support::{memory_pool, sample_agent};
    use crate::agents::AgentRepository;

    async fn set_heartbeat_age(pool: &AnyPool, agent_id: Uuid, seconds_ago: i64) {
        sqlx::query("UPDATE agents SET worker_heartbeat_at = $1 WHERE id = $2")
            .bind(format_ts(Utc::now() - Duration::seconds(seconds_ago)))
            .bind(agent_id.to_string())
            .execute(pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stale_boundary_at_timeout() {
        let pool = memory_pool().await;
        let repo = AgentRepository::new(pool.clone());
        let service = HeartbeatService::new(pool.clone());

        let fresh = sample_agent();
        let stale = sample_agent();
        repo.insert(&fresh).await.unwrap();
        repo.insert(&stale).await.unwrap();

        set_heartbeat_age(&pool, fresh.id, 179).await;
        set_heartbeat_age(&pool, stale.id, 181).await;

        let detected = service.detect_stale(HEARTBEAT_TIMEOUT_SECONDS).await.unwrap();
        let ids: Vec<Uuid> = detected.iter().map(|a| a.id).collect();
        assert!(!ids.contains(&fresh.id), "179s-old heartbeat is not stale");
        assert!(ids.contains(&stale.id), "181s-old heartbeat is stale");
    }

    #[tokio::test]
    async fn fresh_worker_without_heartbeat_is_not_stale() {
        let pool = memory_pool().await;
        let repo = AgentRepository::new(pool.clone());
        let service = HeartbeatService::new(pool.clone());

        // No heartbeat and no last_run_at: brand-new worker, not stale.
        let agent = sample_agent();
        repo.insert(&agent).await.unwrap();
        assert!(service.detect_stale(180).await.unwrap().is_empty());

        // Old last_run_at without heartbeat: worker died before first beat.
        sqlx::query("UPDATE agents SET last_run_at = $1 WHERE id = $2")
            .bind(format_ts(Utc::now() - Duration::seconds(300)))
            .bind(agent.id.to_string())
            .execute(&pool)
            .await
            .unwrap();
        let detected = service.detect_stale(180).await.unwrap();
        assert_eq!(detected.len(), 1);
    }

    #[tokio::test]
    async fn mark_stale_transitions_to_error() {
        let pool = memory_pool().await;
        let repo = AgentRepository::new(pool.clone());
        let service = HeartbeatService::new(pool.clone());

        let agent = sample_agent();
        repo.insert(&agent).await.unwrap();
        set_heartbeat_age(&pool, agent.id, 400).await;

        let marked = service.mark_stale_as_error(180).await.unwrap();
        assert_eq!(marked, 1);

        let loaded = repo.get_by_id(agent.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, AgentStatus::Error);
        assert!(loaded
            .error_message
            .unwrap()
            .contains("heartbeat timeout"));
        assert!(loaded.worker_heartbeat_at.is_none());
    }

    #[tokio::test]
    async fn clear_all_resets_active_agents() {
        let pool = memory_pool().await;
        let repo = AgentRepository::new(pool.clone());
        let service = HeartbeatService::new(pool.clone());

        let agent = sample_agent();
        repo.insert(&agent).await.unwrap();
        service.update_heartbeat(agent.id, "inst-1").await.unwrap();

        let cleared = service.clear_all_for_active().await.unwrap();
        assert_eq!(cleared, 1);
        let loaded = repo.get_by_id(agent.id).await.unwrap().unwrap();
        assert!(loaded.worker_heartbeat_at.is_none());
        assert!(loaded.worker_instance_id.is_none());
    }

    #[test]
    fn is_running_honors_grace_period() {
        let mut agent = sample_agent();
        agent.updated_at = Some(Utc::now());
        assert!(HeartbeatService::is_running(&agent, 180, 60));

        agent.updated_at = Some(Utc::now() - Duration::seconds(120));
        assert!(!HeartbeatService::is_running(&agent, 180, 60));

        agent.worker_heartbeat_at = Some(Utc::now() - Duration::seconds(60));
        assert!(HeartbeatService::is_running(&agent, 180, 60));

        agent.status = AgentStatus::Paused;
        assert!(!HeartbeatService::is_running(&agent, 180, 60));
    }
}
