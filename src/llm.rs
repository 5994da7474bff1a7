//! Generator HTTP boundary
//!
//! The pipeline consumes the text generator through the `SqlGenerator`
//! trait: one call with a system instruction and a user instruction,
//! answered by free text. `OllamaClient` is the production implementation;
//! tests script responses through the same trait.

use crate::config::LlmConfig;
use crate::error::{QueryError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

#[async_trait]
pub trait SqlGenerator: Send + Sync {
    /// One generation call. The response is raw text; the pipeline assumes
    /// nothing about its shape beyond "is text".
    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;
}

/// Envelope of the Ollama /api/generate response.
#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// Client for an Ollama-compatible generation endpoint.
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f64,
    top_p: f64,
    max_tokens: u32,
}

impl OllamaClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connection_timeout())
            .timeout(config.inference_timeout())
            .build()
            .map_err(|e| QueryError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl SqlGenerator for OllamaClient {
    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": format!("{}\n\n{}", system_prompt, user_prompt),
            "stream": false,
            "options": {
                "temperature": self.temperature,
                "top_p": self.top_p,
                "num_predict": self.max_tokens,
            }
        });

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    QueryError::Timeout(format!("generator call timed out: {}", e))
                } else if e.is_connect() {
                    QueryError::GeneratorUnreachable(format!("connection failed: {}", e))
                } else {
                    QueryError::GeneratorUnreachable(format!("request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QueryError::MalformedResponse(format!(
                "generator returned HTTP {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| QueryError::MalformedResponse(format!("invalid JSON envelope: {}", e)))?;

        let text = parsed.response.trim().to_string();
        if text.is_empty() {
            return Err(QueryError::MalformedResponse(
                "generator returned an empty response".to_string(),
            ));
        }

        debug!(response_len = text.len(), "generator responded");
        Ok(text)
    }
}
