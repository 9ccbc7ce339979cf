//! Static provider registry: `provider_id -> client constructor`.
//!
//! New providers are added by registration, not subclass discovery. The
//! built-in set routes every OpenAI-compatible endpoint through
//! [`OpenAiCompatClient`] with the provider's base URL.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::AIClientError;
use crate::http::{HttpClientConfig, OpenAiCompatClient};
use crate::AIClient;

/// Credentials resolved for a provider at client-build time.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub api_key: String,
    pub base_url: Option<String>,
}

type Constructor =
    dyn Fn(&str, Credentials) -> Result<Arc<dyn AIClient>, AIClientError> + Send + Sync;

pub struct ProviderRegistry {
    constructors: HashMap<String, Arc<Constructor>>,
}

/// Split a `provider:model` id. A bare model id defaults to "custom".
pub fn parse_model_id(model_id: &str) -> (String, String) {
    match model_id.split_once(':') {
        Some((provider, model)) => (provider.to_string(), model.to_string()),
        None => ("custom".to_string(), model_id.to_string()),
    }
}

fn openai_compat(provider: &'static str, default_base: &'static str) -> Arc<Constructor> {
    Arc::new(move |model: &str, creds: Credentials| {
        let base = creds
            .base_url
            .clone()
            .unwrap_or_else(|| default_base.to_string());
        let client = OpenAiCompatClient::new(HttpClientConfig::new(
            provider,
            creds.api_key,
            model,
            base,
        ))?;
        Ok(Arc::new(client) as Arc<dyn AIClient>)
    })
}

impl ProviderRegistry {
    /// Registry with the built-in OpenAI-compatible providers.
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            constructors: HashMap::new(),
        };
        registry.register("openai", openai_compat("openai", "https://api.openai.com/v1"));
        registry.register(
            "deepseek",
            openai_compat("deepseek", "https://api.deepseek.com/v1"),
        );
        registry.register(
            "kimi",
            openai_compat("kimi", "https://api.moonshot.cn/v1"),
        );
        registry.register(
            "zhipu",
            openai_compat("zhipu", "https://open.bigmodel.cn/api/paas/v4"),
        );
        registry.register(
            "grok",
            openai_compat("grok", "https://api.x.ai/v1"),
        );
        registry.register("custom", openai_compat("custom", "http://localhost:8000/v1"));
        registry
    }

    pub fn register(&mut self, provider: impl Into<String>, constructor: Arc<Constructor>) {
        self.constructors.insert(provider.into(), constructor);
    }

    pub fn providers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.constructors.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Build a client for a `provider:model` id.
    pub fn client_for(
        &self,
        model_id: &str,
        credentials: Credentials,
    ) -> Result<Arc<dyn AIClient>, AIClientError> {
        let (provider, model) = parse_model_id(model_id);
        let constructor =
            self.constructors
                .get(&provider)
                .ok_or_else(|| AIClientError::InvalidRequest {
                    provider: provider.clone(),
                    message: format!("unknown provider in model id '{model_id}'"),
                })?;
        constructor(&model, credentials)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_id_parsing() {
        assert_eq!(
            parse_model_id("openai:gpt-4o"),
            ("openai".to_string(), "gpt-4o".to_string())
        );
        assert_eq!(
            parse_model_id("my-local-model"),
            ("custom".to_string(), "my-local-model".to_string())
        );
    }

    #[test]
    fn registry_builds_known_providers() {
        let registry = ProviderRegistry::with_builtins();
        let creds = Credentials {
            api_key: "k".to_string(),
            base_url: None,
        };
        assert!(registry.client_for("openai:gpt-4o", creds.clone()).is_ok());
        assert!(registry.client_for("nope:model", creds).is_err());
    }

    #[test]
    fn registry_accepts_new_registrations() {
        let mut registry = ProviderRegistry::with_builtins();
        registry.register("local", openai_compat("local", "http://127.0.0.1:9000/v1"));
        let creds = Credentials {
            api_key: "k".to_string(),
            base_url: None,
        };
        assert!(registry.client_for("local:tiny", creds).is_ok());
    }
}
