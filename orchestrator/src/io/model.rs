//! Model capability: text generation behind a trait, plus the live
//! Anthropic messages API backend and a null backend for running without
//! credentials.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::io::config::{ModelConfig, ModelProvider};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Failure at the model boundary. Fatal to the calling subtask only.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("missing API key: environment variable {0} is not set")]
    MissingApiKey(String),
    #[error("model request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("model API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("malformed model response: {0}")]
    Malformed(String),
    #[error("no model provider configured for {0}")]
    NotConfigured(String),
}

/// Text generation capability used by every agent.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Identifier of the underlying model, for logs and usage tracking.
    fn model_name(&self) -> &str;

    async fn generate(
        &self,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, ProviderError>;
}

/// Client for `model` from the configured provider.
pub fn model_from_config(
    config: &ModelConfig,
    model: &str,
) -> Result<Arc<dyn ModelClient>, ProviderError> {
    Ok(match config.provider {
        ModelProvider::Anthropic => Arc::new(AnthropicModel::from_config(config, model)?),
        ModelProvider::Null => Arc::new(NullModel::new(model)),
    })
}

/// Backend that refuses every request.
pub struct NullModel {
    model: String,
}

impl NullModel {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl ModelClient for NullModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        _prompt: &str,
        _temperature: f32,
        _max_tokens: u32,
    ) -> Result<String, ProviderError> {
        Err(ProviderError::NotConfigured(self.model.clone()))
    }
}

/// Live client for the Anthropic messages API.
pub struct AnthropicModel {
    client: Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl AnthropicModel {
    /// Build a client for `model`, reading the key from the configured
    /// environment variable.
    pub fn from_config(config: &ModelConfig, model: &str) -> Result<Self, ProviderError> {
        let api_key = env::var(&config.api_key_env)
            .map_err(|_| ProviderError::MissingApiKey(config.api_key_env.clone()))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            api_key,
            model: model.to_string(),
        })
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<RequestMessage<'a>>,
}

#[derive(Serialize)]
struct RequestMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[async_trait]
impl ModelClient for AnthropicModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(model = %self.model, temperature, max_tokens))]
    async fn generate(
        &self,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, ProviderError> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens,
            temperature,
            messages: vec![RequestMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            let message = serde_json::from_str::<ApiErrorBody>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: MessagesResponse =
            serde_json::from_str(&text).map_err(|e| ProviderError::Malformed(e.to_string()))?;
        let output: String = parsed.content.into_iter().map(|block| block.text).collect();
        debug!(bytes = output.len(), "model response received");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_reported_by_variable_name() {
        let config = ModelConfig {
            api_key_env: "ORCHESTRATOR_TEST_UNSET_KEY_VAR".to_string(),
            ..ModelConfig::default()
        };
        let err = AnthropicModel::from_config(&config, "m")
            .err()
            .expect("missing key error");
        assert!(err.to_string().contains("ORCHESTRATOR_TEST_UNSET_KEY_VAR"));
    }

    #[tokio::test]
    async fn null_provider_needs_no_key_and_refuses_requests() {
        let config = ModelConfig {
            provider: ModelProvider::Null,
            api_key_env: "ORCHESTRATOR_TEST_UNSET_KEY_VAR".to_string(),
            ..ModelConfig::default()
        };
        let model = model_from_config(&config, "planner-model").expect("null model");
        assert_eq!(model.model_name(), "planner-model");
        let err = model.generate("plan", 0.2, 100).await.expect_err("refused");
        assert!(matches!(err, ProviderError::NotConfigured(_)));
        assert!(err.to_string().contains("planner-model"));
    }

    #[test]
    fn api_error_formats_status_and_message() {
        let err = ProviderError::Api {
            status: 429,
            message: "rate limited".to_string(),
        };
        assert_eq!(err.to_string(), "model API error (429): rate limited");
    }
}
