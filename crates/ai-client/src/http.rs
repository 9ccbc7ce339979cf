//! OpenAI-compatible chat-completions client.
//!
//! Covers every provider exposing the `/chat/completions` shape (OpenAI,
//! DeepSeek, Kimi, Zhipu, custom gateways); the provider id and base URL
//! come from the registry entry.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::AIClientError;
use crate::{AIClient, AIResponse};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub provider: String,
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub timeout: Duration,
}

impl HttpClientConfig {
    pub fn new(
        provider: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url.into(),
            max_tokens: 4096,
            temperature: 0.7,
            timeout: Duration::from_secs(120),
        }
    }
}

pub struct OpenAiCompatClient {
    config: HttpClientConfig,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
    #[serde(default)]
    total_tokens: i64,
}

impl OpenAiCompatClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, AIClientError> {
        if config.api_key.is_empty() && config.provider != "custom" {
            return Err(AIClientError::Authentication {
                provider: config.provider.clone(),
                message: "api key is required".to_string(),
            });
        }
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AIClientError::Other {
                provider: config.provider.clone(),
                message: e.to_string(),
            })?;
        Ok(Self { config, http })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl AIClient for OpenAiCompatClient {
    fn provider(&self) -> &str {
        &self.config.provider
    }

    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        json_mode: bool,
    ) -> Result<AIResponse, AIClientError> {
        let start = Instant::now();

        let mut body = json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
        });
        if json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    AIClientError::Connection {
                        provider: self.config.provider.clone(),
                        message: e.to_string(),
                    }
                } else {
                    AIClientError::Other {
                        provider: self.config.provider.clone(),
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AIClientError::from_status(
                &self.config.provider,
                status.as_u16(),
                body,
            ));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| AIClientError::Other {
            provider: self.config.provider.clone(),
            message: format!("malformed completion response: {e}"),
        })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AIClientError::Other {
                provider: self.config.provider.clone(),
                message: "completion response contained no choices".to_string(),
            })?;

        let usage = parsed.usage.unwrap_or_default();
        let latency_ms = start.elapsed().as_millis() as i64;
        tracing::debug!(
            provider = %self.config.provider,
            model = %self.config.model,
            tokens = usage.total_tokens,
            latency_ms,
            "completion generated"
        );

        Ok(AIResponse {
            content: choice.message.content,
            model: parsed.model.unwrap_or_else(|| self.config.model.clone()),
            tokens_used: usage.total_tokens,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            stop_reason: choice.finish_reason.unwrap_or_default(),
            latency_ms,
        })
    }

    async fn test_connection(&self) -> bool {
        self.generate("You are a connectivity probe.", "Reply with OK.", false)
            .await
            .is_ok()
    }
}
