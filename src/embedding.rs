//! Embedding provider implementations.
//!
//! Concrete [`EmbeddingProvider`] backends selected by `embedding.provider`:
//! - **[`OpenAIProvider`]**: `POST /v1/embeddings` on the OpenAI API (or a
//!   compatible gateway given by `embedding.url`).
//! - **[`OllamaProvider`]**: `POST /api/embed` on a local Ollama instance.
//! - **`LocalProvider`**: fastembed models run in-process (cargo feature
//!   `local-embeddings-fastembed`).
//! - **[`HashEmbedder`]**: deterministic feature hashing, fully offline.
//!
//! # Retry Strategy
//!
//! Providers make a single attempt and classify failures. The caller
//! retries transient ones through [`embed_with_retry`]:
//! - HTTP 429 (rate limited) and 5xx (server error) → transient
//! - HTTP 4xx (client error, not 429) → permanent
//! - Network errors and timeouts → transient
//! - Backoff: `retry_base_ms`, ×2 per retry, exponent capped at 5

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use reqwest::RequestBuilder;

use knowledge_rag_core::embedding::{check_batch, EmbeddingProvider, HashEmbedder};
use knowledge_rag_core::error::{RagError, Result};

use crate::config::EmbeddingConfig;

const OPENAI_URL: &str = "https://api.openai.com";
const OLLAMA_URL: &str = "http://localhost:11434";

/// Create the configured [`EmbeddingProvider`].
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
/// | `"local"` | `LocalProvider` (requires `local-embeddings-fastembed`) |
/// | `"hash"` | [`HashEmbedder`] |
pub fn create_provider(config: &EmbeddingConfig) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!(
            "Local embedding provider requires --features local-embeddings-fastembed"
        ),
        "hash" => Ok(Arc::new(HashEmbedder::new(config.dims))),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Backoff settings for transient provider failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_ms: config.retry_base_ms,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(5);
        Duration::from_millis(self.base_ms.saturating_mul(1 << exp))
    }
}

/// Embed `texts`, retrying transient failures with exponential backoff.
///
/// Permanent failures and exhausted retries return the last error.
pub async fn embed_with_retry(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    policy: RetryPolicy,
) -> Result<Vec<Vec<f32>>> {
    let mut retry = 0;
    loop {
        match provider.embed_batch(texts).await {
            Ok(vectors) => {
                check_batch(texts.len(), provider.dims(), &vectors)?;
                return Ok(vectors);
            }
            Err(e) if e.is_transient() && retry < policy.max_retries => {
                retry += 1;
                let delay = policy.delay(retry);
                tracing::warn!(
                    attempt = retry,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient embedding failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn http_client(timeout_secs: u64) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

/// Send a JSON request once and classify the failure modes.
async fn send_json(request: RequestBuilder, service: &str) -> Result<serde_json::Value> {
    let response = request
        .send()
        .await
        .map_err(|e| RagError::transient(format!("{} request failed: {}", service, e)))?;

    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| RagError::permanent(format!("{} returned invalid JSON: {}", service, e)));
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("{} API error {}: {}", service, status, body);
    if status.as_u16() == 429 || status.is_server_error() {
        Err(RagError::transient(message))
    } else {
        Err(RagError::permanent(message))
    }
}

fn json_vector(value: &serde_json::Value, service: &str) -> Result<Vec<f32>> {
    let items = value
        .as_array()
        .ok_or_else(|| RagError::permanent(format!("{} response: embedding is not an array", service)))?;
    items
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| RagError::permanent(format!("{} response: non-numeric value", service)))
        })
        .collect()
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIProvider {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    dims: usize,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(key) => key,
            Err(_) => bail!("OPENAI_API_KEY environment variable not set"),
        };
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &EmbeddingConfig, api_key: String) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| OPENAI_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: config.model.clone(),
            dims: config.dims,
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

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let request = self
            .client
            .post(format!("{}/v1/embeddings", self.url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body);

        let json = send_json(request, "OpenAI").await?;
        let vectors = parse_openai_response(&json)?;
        check_batch(texts.len(), self.dims, &vectors)?;
        Ok(vectors)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| RagError::permanent("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| RagError::permanent("Invalid OpenAI response: missing embedding"))?;
        indexed.push((index, json_vector(embedding, "OpenAI")?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Requires Ollama to be running with the embedding model pulled
/// (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaProvider {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| OLLAMA_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone(),
            dims: config.dims,
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

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let request = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body);

        let json = send_json(request, "Ollama").await?;
        let embeddings = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| RagError::permanent("Invalid Ollama response: missing embeddings array"))?;
        let vectors = embeddings
            .iter()
            .map(|e| json_vector(e, "Ollama"))
            .collect::<Result<Vec<_>>>()?;
        check_batch(texts.len(), self.dims, &vectors)?;
        Ok(vectors)
    }
}

// ============ Local Provider (fastembed) ============

/// Embedding provider running a fastembed model in-process.
///
/// The model is downloaded from Hugging Face on first use and cached;
/// afterwards embedding runs offline.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalProvider {
    model_name: String,
    dims: usize,
    model: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model_name = config.model.clone();
        let dims = local_model_dims(&model_name)?;
        if dims != config.dims {
            bail!(
                "embedding.dims = {} but local model '{}' produces {} dimensions",
                config.dims,
                model_name,
                dims
            );
        }
        Ok(Self {
            model_name,
            dims,
            model: Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn local_model_dims(name: &str) -> anyhow::Result<usize> {
    Ok(match name {
        "all-minilm-l6-v2" | "bge-small-en-v1.5" | "multilingual-e5-small" => 384,
        "bge-base-en-v1.5" | "nomic-embed-text-v1" | "nomic-embed-text-v1.5"
        | "multilingual-e5-base" => 768,
        "bge-large-en-v1.5" | "multilingual-e5-large" => 1024,
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1, nomic-embed-text-v1.5, \
             multilingual-e5-small, multilingual-e5-base, multilingual-e5-large",
            other
        ),
    })
}

#[cfg(feature = "local-embeddings-fastembed")]
fn fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    use fastembed::EmbeddingModel as M;
    Ok(match name {
        "all-minilm-l6-v2" => M::AllMiniLML6V2,
        "bge-small-en-v1.5" => M::BGESmallENV15,
        "bge-base-en-v1.5" => M::BGEBaseENV15,
        "bge-large-en-v1.5" => M::BGELargeENV15,
        "nomic-embed-text-v1" => M::NomicEmbedTextV1,
        "nomic-embed-text-v1.5" => M::NomicEmbedTextV15,
        "multilingual-e5-small" => M::MultilingualE5Small,
        "multilingual-e5-base" => M::MultilingualE5Base,
        "multilingual-e5-large" => M::MultilingualE5Large,
        other => return Err(RagError::Config(format!("unknown local model '{}'", other))),
    })
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let texts = texts.to_vec();
        let name = self.model_name.clone();
        let slot = Arc::clone(&self.model);

        tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| RagError::permanent("local embedding model lock poisoned"))?;
            if guard.is_none() {
                let model = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(fastembed_model(&name)?)
                        .with_show_download_progress(true),
                )
                .map_err(|e| {
                    RagError::permanent(format!("Failed to initialize local embedding model: {}", e))
                })?;
                *guard = Some(model);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| RagError::permanent("local embedding model unavailable"))?;
            model
                .embed(texts, None)
                .map_err(|e| RagError::permanent(format!("Local embedding failed: {}", e)))
        })
        .await
        .map_err(|e| RagError::permanent(format!("local embedding task failed: {}", e)))?
    }
}
