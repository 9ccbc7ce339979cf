//! Best-effort pub/sub events over Redis channels.
//!
//! Downstream consumers (WebSocket fan-out, notification bridges) subscribe
//! to `events:decision`, `events:position_update` and
//! `events:strategy_status`. Publish failures are logged and never fail a
//! cycle.

use chrono::Utc;
use redis::aio::ConnectionManager;
use serde_json::json;
use uuid::Uuid;

const CHANNEL_DECISION: &str = "events:decision";
const CHANNEL_POSITION_UPDATE: &str = "events:position_update";
const CHANNEL_STRATEGY_STATUS: &str = "events:strategy_status";

#[derive(Clone)]
pub struct EventPublisher {
    redis: Option<ConnectionManager>,
}

impl EventPublisher {
    pub fn new(redis: Option<ConnectionManager>) -> Self {
        Self { redis }
    }

    async fn publish(&self, channel: &str, payload: serde_json::Value) {
        let Some(conn) = &self.redis else { return };
        let mut conn = conn.clone();
        let message = payload.to_string();
        let result: Result<i64, _> = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(&message)
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            tracing::warn!(channel, "event publish failed: {e}");
        }
    }

    pub async fn publish_decision(
        &self,
        user_id: Uuid,
        agent_id: Uuid,
        decision_data: serde_json::Value,
    ) {
        self.publish(
            CHANNEL_DECISION,
            json!({
                "user_id": user_id,
                "agent_id": agent_id,
                "timestamp": Utc::now().to_rfc3339(),
                "decision": decision_data,
            }),
        )
        .await;
    }

    pub async fn publish_position_update(
        &self,
        user_id: Uuid,
        account_id: Option<Uuid>,
        positions: serde_json::Value,
    ) {
        self.publish(
            CHANNEL_POSITION_UPDATE,
            json!({
                "user_id": user_id,
                "account_id": account_id,
                "timestamp": Utc::now().to_rfc3339(),
                "positions": positions,
            }),
        )
        .await;
    }

    pub async fn publish_strategy_status(&self, agent_id: Uuid, status: &str, error: Option<&str>) {
        self.publish(
            CHANNEL_STRATEGY_STATUS,
            json!({
                "agent_id": agent_id,
                "status": status,
                "error": error,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        )
        .await;
    }
}
