//! HTTP facades over the LLM and embedding backends.
//!
//! One request shape per provider, decoded into a common outcome. Transport
//! failures and 5xx are transient; 4xx means the request itself is wrong and
//! is surfaced as terminal.

use crate::config::{EmbeddingConfig, EmbeddingProvider, LlmConfig, LlmProvider};
use crate::error::{MediatorError, MediatorResult};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::debug;

const ANTHROPIC_DEFAULT_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OPENAI_DEFAULT_URL: &str = "https://api.openai.com";
const VOYAGE_DEFAULT_URL: &str = "https://api.voyageai.com";
const COHERE_DEFAULT_URL: &str = "https://api.cohere.ai";

/// Token and latency accounting for one completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct LlmUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency_ms: u64,
}

impl LlmUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// A completed chat call.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub text: String,
    pub usage: LlmUsage,
}

/// Chat-completion client for the negotiation and verification prompts.
pub struct ChatClient {
    http: reqwest::Client,
    provider: LlmProvider,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    timeout: Duration,
}

impl ChatClient {
    pub fn new(config: &LlmConfig) -> MediatorResult<Self> {
        let default = match config.provider {
            LlmProvider::Anthropic => ANTHROPIC_DEFAULT_URL,
            LlmProvider::Openai => OPENAI_DEFAULT_URL,
        };
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| default.to_string());
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| MediatorError::Config(format!("building llm client: {e}")))?;
        Ok(Self {
            http,
            provider: config.provider,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            timeout: Duration::from_millis(config.request_timeout_ms),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// One-shot completion of a single user prompt.
    pub async fn complete(&self, prompt: &str) -> MediatorResult<ChatOutcome> {
        let started = Instant::now();
        let outcome = match self.provider {
            LlmProvider::Anthropic => self.complete_anthropic(prompt).await,
            LlmProvider::Openai => self.complete_openai(prompt).await,
        };
        outcome.map(|(text, input_tokens, output_tokens)| {
            let usage = LlmUsage {
                input_tokens,
                output_tokens,
                latency_ms: started.elapsed().as_millis() as u64,
            };
            debug!(
                tokens = usage.total_tokens(),
                latency_ms = usage.latency_ms,
                "chat completion finished"
            );
            ChatOutcome { text, usage }
        })
    }

    async fn complete_anthropic(&self, prompt: &str) -> MediatorResult<(String, u64, u64)> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [{"role": "user", "content": prompt}],
        });
        let response = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;
        let value = decode_llm_response(response).await?;

        let text = value
            .pointer("/content/0/text")
            .and_then(Value::as_str)
            .ok_or_else(|| MediatorError::Llm("anthropic response missing content".into()))?
            .to_string();
        let input_tokens = value
            .pointer("/usage/input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let output_tokens = value
            .pointer("/usage/output_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        Ok((text, input_tokens, output_tokens))
    }

    async fn complete_openai(&self, prompt: &str) -> MediatorResult<(String, u64, u64)> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [{"role": "user", "content": prompt}],
        });
        let response = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;
        let value = decode_llm_response(response).await?;

        let text = value
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| MediatorError::Llm("openai response missing content".into()))?
            .to_string();
        let input_tokens = value
            .pointer("/usage/prompt_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let output_tokens = value
            .pointer("/usage/completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        Ok((text, input_tokens, output_tokens))
    }
}

/// Embedding client for the remote providers; the deterministic fallback
/// lives in the embedder itself.
pub struct EmbeddingClient {
    http: reqwest::Client,
    provider: EmbeddingProvider,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl EmbeddingClient {
    pub fn new(config: &EmbeddingConfig) -> MediatorResult<Self> {
        let default = match config.provider {
            EmbeddingProvider::Openai => OPENAI_DEFAULT_URL,
            EmbeddingProvider::Voyage => VOYAGE_DEFAULT_URL,
            EmbeddingProvider::Cohere => COHERE_DEFAULT_URL,
            EmbeddingProvider::Fallback => {
                return Err(MediatorError::Config(
                    "fallback embeddings do not use an HTTP client".into(),
                ))
            }
        };
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| default.to_string());
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| MediatorError::Config(format!("building embedding client: {e}")))?;
        Ok(Self {
            http,
            provider: config.provider,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            timeout: Duration::from_millis(config.request_timeout_ms),
        })
    }

    /// Embed one canonicalised text.
    pub async fn embed(&self, text: &str) -> MediatorResult<Vec<f32>> {
        let (url, body, pointer) = match self.provider {
            EmbeddingProvider::Openai => (
                format!("{}/v1/embeddings", self.base_url),
                json!({"model": self.model, "input": [text]}),
                "/data/0/embedding",
            ),
            EmbeddingProvider::Voyage => (
                format!("{}/v1/embeddings", self.base_url),
                json!({"model": self.model, "input": [text]}),
                "/data/0/embedding",
            ),
            EmbeddingProvider::Cohere => (
                format!("{}/v1/embed", self.base_url),
                json!({"model": self.model, "texts": [text], "input_type": "search_document"}),
                "/embeddings/0",
            ),
            EmbeddingProvider::Fallback => {
                return Err(MediatorError::Internal(
                    "fallback embeddings handled by the embedder".into(),
                ))
            }
        };

        let response = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;
        let value = decode_llm_response(response).await?;

        let vector = value
            .pointer(pointer)
            .and_then(Value::as_array)
            .ok_or_else(|| MediatorError::Llm("embedding response missing vector".into()))?;
        vector
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| MediatorError::Llm("non-numeric embedding component".into()))
            })
            .collect()
    }
}

fn classify_transport(err: reqwest::Error) -> MediatorError {
    if err.is_timeout() {
        MediatorError::LlmUnavailable(format!("timeout: {err}"))
    } else {
        MediatorError::LlmUnavailable(format!("connection: {err}"))
    }
}

async fn decode_llm_response(response: reqwest::Response) -> MediatorResult<Value> {
    let status = response.status();
    if status.is_success() {
        response
            .json::<Value>()
            .await
            .map_err(|e| MediatorError::Llm(format!("decoding response: {e}")))
    } else if status.is_server_error() {
        Err(MediatorError::LlmUnavailable(format!("HTTP {status}")))
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(MediatorError::Llm(format!(
            "HTTP {}: {}",
            status.as_u16(),
            body.chars().take(200).collect::<String>()
        )))
    }
}
