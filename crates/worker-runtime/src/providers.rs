//! Capability providers: how the runtime obtains traders and AI clients.
//!
//! Live exchange adapters live outside this workspace; deployments register
//! their own [`TraderProvider`]. The built-in provider serves mock-mode
//! agents from the simulator and refuses live agents.

use std::sync::Arc;

use agent_core::{Agent, ExecutionMode};
use ai_client::{Credentials, ProviderRegistry};
use anyhow::{bail, Result};
use async_trait::async_trait;
use trader_trait::{MockTrader, Trader};

use crate::config::RuntimeConfig;

#[async_trait]
pub trait TraderProvider: Send + Sync {
    /// Build and initialize a trader for an agent. Called once at worker
    /// start and again after a trader reconnect.
    async fn create(&self, agent: &Agent, symbols: &[String]) -> Result<Arc<dyn Trader>>;
}

/// Simulator-backed provider: mock agents get a `MockTrader` with the
/// configured fees; live agents need a real provider registered by the
/// deployment.
pub struct MockTraderProvider {
    config: RuntimeConfig,
}

impl MockTraderProvider {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TraderProvider for MockTraderProvider {
    async fn create(&self, agent: &Agent, _symbols: &[String]) -> Result<Arc<dyn Trader>> {
        if agent.execution_mode == ExecutionMode::Live {
            bail!(
                "no live trader provider configured for agent {} - register one or switch the \
                 agent to mock mode",
                agent.id
            );
        }
        let trader = MockTrader::with_fees(
            self.config.mock_initial_balance,
            self.config.simulator_maker_fee,
            self.config.simulator_taker_fee,
            self.config.simulator_default_slippage,
        );
        trader.initialize().await?;
        Ok(Arc::new(trader))
    }
}

/// Resolves AI clients through the static provider registry with
/// environment credentials: `{PROVIDER}_API_KEY` / `{PROVIDER}_BASE_URL`.
pub struct EnvClientProvider {
    registry: ProviderRegistry,
}

impl EnvClientProvider {
    pub fn new(registry: ProviderRegistry) -> Self {
        Self { registry }
    }

    fn credentials_for(provider: &str) -> Credentials {
        let upper = provider.to_uppercase();
        Credentials {
            api_key: std::env::var(format!("{upper}_API_KEY")).unwrap_or_default(),
            base_url: std::env::var(format!("{upper}_BASE_URL")).ok(),
        }
    }

    pub fn client_for(&self, model_id: &str) -> Result<Arc<dyn ai_client::AIClient>> {
        let (provider, _) = ai_client::parse_model_id(model_id);
        let credentials = Self::credentials_for(&provider);
        Ok(self.registry.client_for(model_id, credentials)?)
    }

    /// Resolve every debate model; failures are skipped with a warning so
    /// one misconfigured provider doesn't kill the debate.
    pub fn debate_clients(&self, model_ids: &[String]) -> Vec<(String, Arc<dyn ai_client::AIClient>)> {
        let mut clients = Vec::new();
        for model_id in model_ids {
            match self.client_for(model_id) {
                Ok(client) => clients.push((model_id.clone(), client)),
                Err(e) => {
                    tracing::warn!(%model_id, "debate model unavailable: {e}");
                }
            }
        }
        clients
    }
}

impl Default for EnvClientProvider {
    fn default() -> Self {
        Self::new(ProviderRegistry::with_builtins())
    }
}
