#![forbid(unsafe_code)]

//! LLM provider adapters. Agents depend on the [`LlmProvider`] contract;
//! concrete adapters cover an OpenAI-compatible chat endpoint, the
//! Anthropic messages endpoint, and a deterministic mock for tests and
//! offline runs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tape_kernel_domain::hash_bytes;
use thiserror::Error;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MAX_TOKENS: u64 = 1024;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider configuration error: {0}")]
    Config(String),
    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("provider returned status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
}

/// Provider binding as it appears in agent configuration. An inline
/// `api_key` wins when present; otherwise `api_key_env` (or the provider's
/// conventional variable) names the environment variable holding one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmConfig {
    /// Provider kind: `mock`, `openai`, `huggingface` or `anthropic`.
    pub provider_name: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
    /// Extra body fields merged verbatim into the completion request
    /// (`temperature`, `max_tokens`, ...).
    #[serde(default = "empty_params")]
    pub additional_params: Value,
}

fn empty_params() -> Value {
    Value::Object(Map::new())
}

impl LlmConfig {
    #[must_use]
    pub fn mock(model: impl Into<String>) -> Self {
        Self {
            provider_name: "mock".to_string(),
            model: model.into(),
            api_key: None,
            api_key_env: None,
            api_base: None,
            additional_params: empty_params(),
        }
    }

    fn resolve_api_key(&self, default_env: &str) -> Result<String, ProviderError> {
        if let Some(key) = &self.api_key {
            return Ok(key.clone());
        }
        let env = self.api_key_env.as_deref().unwrap_or(default_env);
        std::env::var(env).map_err(|_| {
            ProviderError::Config(format!(
                "provider '{}' requires an API key in environment variable {env}",
                self.provider_name
            ))
        })
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmResponse {
    pub text: String,
    pub model: String,
    #[serde(default)]
    pub usage: TokenUsage,
    /// Full provider payload, kept for inspection and export.
    #[serde(default)]
    pub raw_response: Value,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn provider_name(&self) -> &str;

    /// Produce a completion for the prompt.
    ///
    /// # Errors
    /// Returns a [`ProviderError`] on transport, API or decoding failure.
    async fn generate(&self, prompt: &str) -> Result<LlmResponse, ProviderError>;
}

/// Deterministic offline provider. With no script it answers every prompt
/// with a stable digest-tagged line, so repeated runs produce identical
/// tapes; with a script it replays the queued responses in order.
pub struct MockLlm {
    model: String,
    script: Mutex<VecDeque<String>>,
}

impl MockLlm {
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            script: Mutex::new(VecDeque::new()),
        }
    }

    #[must_use]
    pub fn scripted(model: impl Into<String>, responses: Vec<String>) -> Self {
        Self {
            model: model.into(),
            script: Mutex::new(responses.into()),
        }
    }
}

#[async_trait]
impl LlmProvider for MockLlm {
    fn provider_name(&self) -> &str {
        "mock"
    }

    async fn generate(&self, prompt: &str) -> Result<LlmResponse, ProviderError> {
        let scripted = {
            let mut script = self.script.lock().map_err(|_| {
                ProviderError::MalformedResponse("mock script poisoned".to_string())
            })?;
            script.pop_front()
        };
        let digest = hash_bytes(format!("{}:{prompt}", self.model).as_bytes());
        let text = scripted.unwrap_or_else(|| format!("mock({}): {prompt}", &digest[..12]));
        let prompt_tokens = prompt.split_whitespace().count() as u64;
        let completion_tokens = text.split_whitespace().count() as u64;
        Ok(LlmResponse {
            text,
            model: self.model.clone(),
            usage: TokenUsage {
                prompt_tokens,
                completion_tokens,
            },
            raw_response: json!({ "digest": digest }),
        })
    }
}

/// Adapter for any endpoint speaking the OpenAI chat-completions shape
/// (OpenAI itself, HuggingFace inference routers, local servers).
pub struct OpenAiCompatibleLlm {
    client: reqwest::Client,
    api_base: String,
    model: String,
    api_key: String,
    additional_params: Value,
}

impl OpenAiCompatibleLlm {
    /// # Errors
    /// Returns [`ProviderError::Config`] when no API key can be resolved.
    pub fn from_config(config: &LlmConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            client: reqwest::Client::new(),
            api_base: config
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            model: config.model.clone(),
            api_key: config.resolve_api_key("OPENAI_API_KEY")?,
            additional_params: config.additional_params.clone(),
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleLlm {
    fn provider_name(&self) -> &str {
        "openai"
    }

    async fn generate(&self, prompt: &str) -> Result<LlmResponse, ProviderError> {
        let mut body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
        });
        merge_params(&mut body, &self.additional_params);

        tracing::debug!(model = %self.model, "openai completion request");
        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let payload = decode_response(response).await?;

        let text = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                ProviderError::MalformedResponse("missing choices[0].message.content".to_string())
            })?
            .to_string();
        let usage = TokenUsage {
            prompt_tokens: payload["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            completion_tokens: payload["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        };
        Ok(LlmResponse {
            text,
            model: self.model.clone(),
            usage,
            raw_response: payload,
        })
    }
}

/// Adapter for the Anthropic messages endpoint.
pub struct AnthropicLlm {
    client: reqwest::Client,
    api_base: String,
    model: String,
    api_key: String,
    additional_params: Value,
}

impl AnthropicLlm {
    /// # Errors
    /// Returns [`ProviderError::Config`] when no API key can be resolved.
    pub fn from_config(config: &LlmConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            client: reqwest::Client::new(),
            api_base: config
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_ANTHROPIC_BASE_URL.to_string()),
            model: config.model.clone(),
            api_key: config.resolve_api_key("ANTHROPIC_API_KEY")?,
            additional_params: config.additional_params.clone(),
        })
    }
}

#[async_trait]
impl LlmProvider for AnthropicLlm {
    fn provider_name(&self) -> &str {
        "anthropic"
    }

    async fn generate(&self, prompt: &str) -> Result<LlmResponse, ProviderError> {
        // max_tokens is mandatory on this endpoint; additional_params may
        // override the default.
        let mut body = json!({
            "model": self.model,
            "max_tokens": DEFAULT_MAX_TOKENS,
            "messages": [{ "role": "user", "content": prompt }],
        });
        merge_params(&mut body, &self.additional_params);

        tracing::debug!(model = %self.model, "anthropic completion request");
        let response = self
            .client
            .post(format!("{}/v1/messages", self.api_base))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;
        let payload = decode_response(response).await?;

        let text = payload["content"][0]["text"]
            .as_str()
            .ok_or_else(|| {
                ProviderError::MalformedResponse("missing content[0].text".to_string())
            })?
            .to_string();
        let usage = TokenUsage {
            prompt_tokens: payload["usage"]["input_tokens"].as_u64().unwrap_or(0),
            completion_tokens: payload["usage"]["output_tokens"].as_u64().unwrap_or(0),
        };
        Ok(LlmResponse {
            text,
            model: self.model.clone(),
            usage,
            raw_response: payload,
        })
    }
}

/// Build the provider named by the config. `huggingface` rides the
/// OpenAI-compatible route.
///
/// # Errors
/// Returns [`ProviderError::Config`] for unknown kinds or missing keys.
pub fn provider_from_config(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, ProviderError> {
    match config.provider_name.as_str() {
        "mock" => Ok(Arc::new(MockLlm::new(config.model.clone()))),
        "openai" | "huggingface" => Ok(Arc::new(OpenAiCompatibleLlm::from_config(config)?)),
        "anthropic" => Ok(Arc::new(AnthropicLlm::from_config(config)?)),
        other => Err(ProviderError::Config(format!(
            "unknown provider kind '{other}'"
        ))),
    }
}

fn merge_params(body: &mut Value, params: &Value) {
    if let (Some(body_map), Some(params_map)) = (body.as_object_mut(), params.as_object()) {
        for (key, value) in params_map {
            body_map.insert(key.clone(), value.clone());
        }
    }
}

async fn decode_response(response: reqwest::Response) -> Result<Value, ProviderError> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(ProviderError::Api {
            status: status.as_u16(),
            message,
        });
    }
    Ok(response.json::<Value>().await?)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        provider_from_config, AnthropicLlm, LlmConfig, LlmProvider, MockLlm, ProviderError,
    };

    #[tokio::test]
    async fn mock_is_deterministic_per_prompt() {
        let provider = MockLlm::new("test-model");
        let first = provider
            .generate("summarize the tape")
            .await
            .unwrap_or_else(|err| panic!("generate: {err}"));
        let second = provider
            .generate("summarize the tape")
            .await
            .unwrap_or_else(|err| panic!("generate: {err}"));
        assert_eq!(first, second);
        assert_eq!(first.model, "test-model");
        assert!(first.text.contains("summarize the tape"));

        let other = provider
            .generate("something else")
            .await
            .unwrap_or_else(|err| panic!("generate: {err}"));
        assert_ne!(other.text, first.text);
    }

    #[tokio::test]
    async fn scripted_mock_replays_in_order_then_falls_back() {
        let provider = MockLlm::scripted(
            "test-model",
            vec!["first".to_string(), "second".to_string()],
        );
        let mut replies = Vec::new();
        for _ in 0..2 {
            let response = provider
                .generate("anything")
                .await
                .unwrap_or_else(|err| panic!("generate: {err}"));
            replies.push(response.text);
        }
        assert_eq!(replies, vec!["first", "second"]);

        let fallback = provider
            .generate("anything")
            .await
            .unwrap_or_else(|err| panic!("generate: {err}"));
        assert!(fallback.text.starts_with("mock("));
    }

    #[test]
    fn factory_builds_mock_and_rejects_unknown_kinds() {
        let provider = provider_from_config(&LlmConfig::mock("m"))
            .unwrap_or_else(|err| panic!("factory: {err}"));
        assert_eq!(provider.provider_name(), "mock");

        let mut config = LlmConfig::mock("m");
        config.provider_name = "telepathy".to_string();
        match provider_from_config(&config) {
            Err(ProviderError::Config(message)) => assert!(message.contains("telepathy")),
            other => panic!(
                "expected config error, got {:?}",
                other.map(|p| p.provider_name().to_string())
            ),
        }
    }

    #[test]
    fn inline_api_key_beats_environment_lookup() {
        let mut config = LlmConfig::mock("m");
        config.provider_name = "anthropic".to_string();
        config.api_key = Some("sk-test".to_string());
        let provider = AnthropicLlm::from_config(&config);
        assert!(provider.is_ok());
    }

    #[test]
    fn missing_api_key_is_a_named_error() {
        let mut config = LlmConfig::mock("m");
        config.provider_name = "anthropic".to_string();
        config.api_key_env = Some("TAPE_KERNEL_TEST_KEY_THAT_IS_NEVER_SET".to_string());
        match provider_from_config(&config) {
            Err(ProviderError::Config(message)) => {
                assert!(message.contains("TAPE_KERNEL_TEST_KEY_THAT_IS_NEVER_SET"));
            }
            other => panic!(
                "expected config error, got {:?}",
                other.map(|p| p.provider_name().to_string())
            ),
        }
    }

    #[test]
    fn config_defaults_apply_on_deserialize() {
        let config: LlmConfig = serde_json::from_value(json!({
            "provider_name": "mock",
            "model": "m",
        }))
        .unwrap_or_else(|err| panic!("deserialize: {err}"));
        assert!(config.api_key.is_none());
        assert!(config.api_base.is_none());
        assert_eq!(config.additional_params, json!({}));
    }
}
