//! LLM capability: the `AIClient` trait, its error taxonomy, and the
//! provider registry.
//!
//! The runtime never talks to a vendor SDK; it only sees this interface.
//! Model ids are `provider:model` strings (e.g. `openai:gpt-4o`,
//! `custom:my-model`), resolved through the registry.

pub mod error;
pub mod http;
pub mod registry;

pub use error::AIClientError;
pub use http::{HttpClientConfig, OpenAiCompatClient};
pub use registry::{parse_model_id, Credentials, ProviderRegistry};

use async_trait::async_trait;

/// Standardized response from an AI provider.
#[derive(Debug, Clone)]
pub struct AIResponse {
    pub content: String,
    pub model: String,
    pub tokens_used: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub stop_reason: String,
    pub latency_ms: i64,
}

/// Uniform LLM interface.
#[async_trait]
pub trait AIClient: Send + Sync {
    /// Provider id for logging (e.g. "openai", "custom").
    fn provider(&self) -> &str;

    /// Generate a completion. With `json_mode` the provider is asked to
    /// emit a JSON object.
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        json_mode: bool,
    ) -> Result<AIResponse, AIClientError>;

    /// Cheap connectivity probe.
    async fn test_connection(&self) -> bool;
}
