use agent_core::{AiStrategyConfig, QuantConfig, StrategyKind, StrategyTemplate};
use anyhow::{anyhow, Result};
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Row};
use uuid::Uuid;

fn template_from_row(row: &AnyRow) -> Result<StrategyTemplate> {
    let strategy_type: String = row.try_get("strategy_type")?;
    let config_raw: String = row.try_get("config")?;
    let config: serde_json::Value = serde_json::from_str(&config_raw)?;

    let kind = if strategy_type == "ai" {
        StrategyKind::Ai(serde_json::from_value::<AiStrategyConfig>(config)?)
    } else {
        StrategyKind::Quant(QuantConfig::from_parts(&strategy_type, config)?)
    };

    Ok(StrategyTemplate {
        id: Uuid::parse_str(&row.try_get::<String, _>("id")?)?,
        user_id: Uuid::parse_str(&row.try_get::<String, _>("user_id")?)?,
        name: row.try_get("name")?,
        symbol: row.try_get("symbol")?,
        kind,
        runtime_state: serde_json::from_str(&row.try_get::<String, _>("runtime_state")?)
            .unwrap_or(serde_json::Value::Null),
    })
}

#[derive(Clone)]
pub struct StrategyRepository {
    pool: AnyPool,
}

impl StrategyRepository {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, strategy_id: Uuid) -> Result<Option<StrategyTemplate>> {
        let row = sqlx::query(
            "SELECT id, user_id, name, strategy_type, symbol, config, runtime_state \
             FROM strategies WHERE id = $1",
        )
        .bind(strategy_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| template_from_row(&r)).transpose()
    }

    pub async fn insert(&self, template: &StrategyTemplate) -> Result<()> {
        let (strategy_type, config) = match &template.kind {
            StrategyKind::Ai(cfg) => ("ai".to_string(), serde_json::to_value(cfg)?),
            StrategyKind::Quant(cfg) => {
                cfg.validate()?;
                let tagged = serde_json::to_value(cfg)?;
                let config = tagged
                    .get("config")
                    .cloned()
                    .ok_or_else(|| anyhow!("quant config serialization missing payload"))?;
                (cfg.strategy_type().to_string(), config)
            }
        };

        sqlx::query(
            "INSERT INTO strategies (id, user_id, name, strategy_type, symbol, config, \
             runtime_state) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(template.id.to_string())
        .bind(template.user_id.to_string())
        .bind(template.name.clone())
        .bind(strategy_type)
        .bind(template.symbol.clone())
        .bind(serde_json::to_string(&config)?)
        .bind(serde_json::to_string(&template.runtime_state)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist the engine's updated runtime state after a cycle.
    pub async fn update_runtime_state(
        &self,
        strategy_id: Uuid,
        state: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query("UPDATE strategies SET runtime_state = $1 WHERE id = $2")
            .bind(serde_json::to_string(state)?)
            .bind(strategy_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::test_support::memory_pool;
    use agent_core::GridConfig;
    use serde_json::json;

    #[tokio::test]
    async fn quant_template_round_trip() {
        let pool = memory_pool().await;
        let repo = StrategyRepository::new(pool);

        let template = StrategyTemplate {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "btc grid".to_string(),
            symbol: Some("BTC".to_string()),
            kind: StrategyKind::Quant(QuantConfig::Grid(GridConfig {
                upper_price: 110.0,
                lower_price: 100.0,
                grid_count: 10,
                total_investment: 1000.0,
                leverage: 1,
            })),
            runtime_state: json!({}),
        };
        repo.insert(&template).await.unwrap();

        let loaded = repo.get_by_id(template.id).await.unwrap().unwrap();
        assert_eq!(loaded.strategy_type(), "grid");
        assert_eq!(loaded.symbol.as_deref(), Some("BTC"));

        repo.update_runtime_state(template.id, &json!({"filled_buys": ["0"]}))
            .await
            .unwrap();
        let loaded = repo.get_by_id(template.id).await.unwrap().unwrap();
        assert_eq!(loaded.runtime_state["filled_buys"][0], "0");
    }

    #[tokio::test]
    async fn ai_template_round_trip() {
        let pool = memory_pool().await;
        let repo = StrategyRepository::new(pool);

        let mut config = AiStrategyConfig::default();
        config.symbols = vec!["BTC".to_string(), "ETH".to_string()];
        let template = StrategyTemplate {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "ai swing".to_string(),
            symbol: None,
            kind: StrategyKind::Ai(config),
            runtime_state: serde_json::Value::Null,
        };
        repo.insert(&template).await.unwrap();

        let loaded = repo.get_by_id(template.id).await.unwrap().unwrap();
        assert_eq!(loaded.strategy_type(), "ai");
        assert_eq!(loaded.symbols(), vec!["BTC", "ETH"]);
    }
}
