//! Embedding provider implementations.
//!
//! The [`EmbeddingProvider`] trait lives in `codesync-core`; this module
//! supplies the HTTP backends and [`create_provider`]:
//! - **[`DisabledProvider`]**: every call fails; used when `embedding.provider = "disabled"`.
//! - **[`OpenAIProvider`]**: `POST {url}/v1/embeddings`.
//! - **[`OllamaProvider`]**: `POST {url}/api/embed` on a local Ollama instance.
//!
//! Each provider performs exactly one HTTP request per `embed` call. Retry
//! and backoff belong to [`crate::embedder::Embedder`]; providers only
//! classify what went wrong:
//! - HTTP 429 and 5xx → [`ProviderError::Transient`]
//! - Network errors and timeouts → [`ProviderError::Transient`]
//! - Any other 4xx, or a malformed body → [`ProviderError::Permanent`]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use codesync_core::embedding::EmbeddingProvider;
use codesync_core::error::ProviderError;

use crate::config::EmbeddingConfig;

// ============ Disabled Provider ============

/// Used when embeddings are not configured. Any embed call fails.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Err(ProviderError::Permanent(
            "embedding provider is disabled; set [embedding] provider in config".to_string(),
        ))
    }
}

/// Turn a non-success HTTP response into a classified provider error.
async fn classify_status(vendor: &str, response: reqwest::Response) -> ProviderError {
    let status = response.status();
    let body_text = response.text().await.unwrap_or_default();
    let message = format!("{} API error {}: {}", vendor, status, body_text);
    if status.as_u16() == 429 || status.is_server_error() {
        ProviderError::Transient(message)
    } else {
        ProviderError::Permanent(message)
    }
}

fn parse_vector(value: &serde_json::Value, vendor: &str) -> Result<Vec<f32>, ProviderError> {
    value
        .as_array()
        .ok_or_else(|| {
            ProviderError::Permanent(format!("Invalid {} response: embedding is not an array", vendor))
        })
        .map(|arr| arr.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API (or any compatible gateway).
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    batch_size: usize,
    max_input_chars: usize,
    client: reqwest::Client,
}

impl OpenAIProvider {
    /// # Errors
    ///
    /// Returns an error if `model` or `dims` is not set, or if the API key
    /// environment variable is missing.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = match std::env::var(&config.api_key_env) {
            Ok(key) => key,
            Err(_) => bail!("{} environment variable not set", config.api_key_env),
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            api_key,
            batch_size: config.batch_size,
            max_input_chars: config.max_input_chars,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn max_batch_size(&self) -> usize {
        self.batch_size
    }
    fn max_input_chars(&self) -> usize {
        self.max_input_chars
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("OpenAI request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(classify_status("OpenAI", response).await);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("OpenAI response read failed: {}", e)))?;
        parse_openai_response(&json)
    }
}

/// Extract `data[].embedding`, ordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let data = json.get("data").and_then(|d| d.as_array()).ok_or_else(|| {
        ProviderError::Permanent("Invalid OpenAI response: missing data array".to_string())
    })?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item.get("embedding").ok_or_else(|| {
            ProviderError::Permanent("Invalid OpenAI response: missing embedding".to_string())
        })?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, parse_vector(embedding, "OpenAI")?));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance
/// (default `http://localhost:11434`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    batch_size: usize,
    max_input_chars: usize,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            batch_size: config.batch_size,
            max_input_chars: config.max_input_chars,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn max_batch_size(&self) -> usize {
        self.batch_size
    }
    fn max_input_chars(&self) -> usize {
        self.max_input_chars
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ProviderError::Transient(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url, e
                ))
            })?;

        if !response.status().is_success() {
            return Err(classify_status("Ollama", response).await);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("Ollama response read failed: {}", e)))?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            ProviderError::Permanent("Invalid Ollama response: missing embeddings array".to_string())
        })?
        .iter()
        .map(|e| parse_vector(e, "Ollama"))
        .collect()
}

/// Instantiate the provider named by `config.provider`.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_response_is_reordered_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]},
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn malformed_responses_are_permanent() {
        let err = parse_openai_response(&serde_json::json!({"object": "list"})).unwrap_err();
        assert!(matches!(err, ProviderError::Permanent(_)));
        let err = parse_ollama_response(&serde_json::json!({"embeddings": [1.0]})).unwrap_err();
        assert!(matches!(err, ProviderError::Permanent(_)));
    }

    #[tokio::test]
    async fn disabled_provider_refuses() {
        let provider = create_provider(&EmbeddingConfig::default()).unwrap();
        assert_eq!(provider.model_name(), "disabled");
        let err = provider.embed(&["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, ProviderError::Permanent(_)));
    }
}
