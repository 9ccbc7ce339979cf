use agent_core::format_ts;
use anyhow::Result;
use chrono::Utc;
use sqlx::{AnyPool, Row};
use uuid::Uuid;

/// Audit row persisted every cycle, including skipped and failed cycles.
#[derive(Debug, Clone, Default)]
pub struct NewDecisionRecord {
    pub agent_id: Uuid,
    pub system_prompt: String,
    pub user_prompt: String,
    pub raw_response: String,
    pub chain_of_thought: String,
    pub market_assessment: String,
    pub decisions: serde_json::Value,
    pub overall_confidence: i64,
    pub executed: bool,
    pub execution_results: serde_json::Value,
    pub error: Option<String>,
    pub ai_model: String,
    pub tokens_used: i64,
    pub latency_ms: i64,
    pub is_debate: bool,
    pub debate_models: Option<serde_json::Value>,
    pub debate_responses: Option<serde_json::Value>,
    pub debate_consensus_mode: Option<String>,
    pub debate_agreement_score: Option<f64>,
    pub market_snapshot: Option<serde_json::Value>,
    pub account_snapshot: Option<serde_json::Value>,
}

#[derive(Clone)]
pub struct DecisionRepository {
    pool: AnyPool,
}

impl DecisionRepository {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, record: &NewDecisionRecord) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let to_text = |v: &Option<serde_json::Value>| -> Result<Option<String>> {
            v.as_ref()
                .map(|j| serde_json::to_string(j).map_err(Into::into))
                .transpose()
        };

        sqlx::query(
            "INSERT INTO decisions (id, agent_id, created_at, system_prompt, user_prompt, \
             raw_response, chain_of_thought, market_assessment, decisions, overall_confidence, \
             executed, execution_results, error, ai_model, tokens_used, latency_ms, is_debate, \
             debate_models, debate_responses, debate_consensus_mode, debate_agreement_score, \
             market_snapshot, account_snapshot) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
             $17, $18, $19, $20, $21, $22, $23)",
        )
        .bind(id.to_string())
        .bind(record.agent_id.to_string())
        .bind(format_ts(Utc::now()))
        .bind(&record.system_prompt)
        .bind(&record.user_prompt)
        .bind(&record.raw_response)
        .bind(&record.chain_of_thought)
        .bind(&record.market_assessment)
        .bind(serde_json::to_string(&record.decisions)?)
        .bind(record.overall_confidence)
        .bind(record.executed as i64)
        .bind(serde_json::to_string(&record.execution_results)?)
        .bind(record.error.clone())
        .bind(&record.ai_model)
        .bind(record.tokens_used)
        .bind(record.latency_ms)
        .bind(record.is_debate as i64)
        .bind(to_text(&record.debate_models)?)
        .bind(to_text(&record.debate_responses)?)
        .bind(record.debate_consensus_mode.clone())
        .bind(record.debate_agreement_score)
        .bind(to_text(&record.market_snapshot)?)
        .bind(to_text(&record.account_snapshot)?)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Recent executed trades for the prompt's trade-history section.
    /// Returns `(created_at, execution_results)` pairs, newest first.
    pub async fn recent_executed(
        &self,
        agent_id: Uuid,
        limit: i64,
    ) -> Result<Vec<(String, serde_json::Value)>> {
        let rows = sqlx::query(
            "SELECT created_at, execution_results FROM decisions \
             WHERE agent_id = $1 AND executed = 1 \
             ORDER BY created_at DESC LIMIT $2",
        )
        .bind(agent_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let created: String = row.try_get("created_at")?;
                let results: String = row.try_get("execution_results")?;
                Ok((created, serde_json::from_str(&results)?))
            })
            .collect()
    }

    pub async fn count_for_agent(&self, agent_id: Uuid) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM decisions WHERE agent_id = $1")
            .bind(agent_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::test_support::memory_pool;
    use serde_json::json;

    #[tokio::test]
    async fn create_and_query_decisions() {
        let pool = memory_pool().await;
        let repo = DecisionRepository::new(pool);
        let agent_id = Uuid::new_v4();

        let mut record = NewDecisionRecord {
            agent_id,
            raw_response: "{}".to_string(),
            ai_model: "openai:gpt-4o".to_string(),
            decisions: json!([]),
            execution_results: json!([]),
            ..Default::default()
        };
        repo.create(&record).await.unwrap();

        record.executed = true;
        record.execution_results = json!([{"symbol": "BTC", "executed": true}]);
        repo.create(&record).await.unwrap();

        assert_eq!(repo.count_for_agent(agent_id).await.unwrap(), 2);
        let executed = repo.recent_executed(agent_id, 10).await.unwrap();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].1[0]["symbol"], "BTC");
    }
}
