//! Embedding provider abstraction and the batching/retry client.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]**: returns errors; used when embeddings are not configured.
//! - **[`OpenAIProvider`]**: calls an OpenAI-compatible `/v1/embeddings` endpoint.
//! - **[`OllamaProvider`]**: calls a local Ollama instance's `/api/embed` endpoint.
//! - **[`CohereProvider`]**: calls the Cohere `/v1/embed` endpoint.
//! - **`LocalProvider`**: runs models locally via fastembed (feature `local-embeddings`).
//!
//! Providers make exactly one request per call. Batching, retry, and the
//! zero-vector fallback live in [`EmbeddingClient`], which is what the rest
//! of the crate talks to.
//!
//! # Retry Strategy
//!
//! Every batch is attempted once plus up to `max_retries` more times, with
//! exponential backoff between attempts: `backoff_ms`, ×2, ×4, ... capped at
//! ×32. Any provider error counts as a batch failure: network errors,
//! non-success statuses, malformed bodies, and a wrong number of vectors.
//! A batch that still fails is replaced by zero vectors of the configured
//! dimension, so `embed` always returns one vector per input, in order.
//!
//! A vector of the wrong length is different: it means the provider and
//! the index disagree on dimension, which is a configuration error and is
//! returned immediately as [`RagError::DimensionMismatch`].

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{EmbeddingConfig, IndexConfig};
use crate::error::{RagError, Result};

/// Text used to discover the embedding dimension when it is not configured.
const DIMENSION_PROBE: &str = "dimension probe";

/// Trait for embedding providers.
///
/// One call is one request to the backend; implementations must return
/// vectors in input order.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Returns the configured vector dimensionality, if known up front.
    fn dims(&self) -> Option<usize>;

    /// Embed one batch of texts.
    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}

// ============ Embedding Client ============

/// Batching, retrying front-end to an [`EmbeddingProvider`].
///
/// Constructed through [`EmbeddingClient::connect`], which pins the vector
/// dimension for the lifetime of the client.
#[derive(Clone)]
pub struct EmbeddingClient {
    provider: Arc<dyn EmbeddingProvider>,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
    backoff: Duration,
}

impl std::fmt::Debug for EmbeddingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingClient")
            .field("model", &self.provider.model_name())
            .field("dims", &self.dims)
            .field("batch_size", &self.batch_size)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl EmbeddingClient {
    /// Resolve the provider's dimension and build a client.
    ///
    /// When the dimension is not configured it is probed with a real
    /// request. The probe is attempted `init.init_retries` times with a
    /// fixed delay; if it never succeeds the client cannot be built and the
    /// caller gets [`RagError::IndexUninitialized`].
    pub async fn connect(
        provider: Arc<dyn EmbeddingProvider>,
        config: &EmbeddingConfig,
        init: &IndexConfig,
    ) -> Result<Self> {
        let attempts = init.init_retries.max(1);
        let delay = Duration::from_millis(init.init_retry_delay_ms);
        let mut last_err = String::new();

        for attempt in 1..=attempts {
            match resolve_dims(provider.as_ref()).await {
                Ok(dims) => {
                    info!(model = provider.model_name(), dims, "embedding client ready");
                    return Ok(Self {
                        provider,
                        dims,
                        batch_size: config.batch_size.max(1),
                        max_retries: config.max_retries,
                        backoff: Duration::from_millis(config.backoff_ms),
                    });
                }
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "could not determine embedding dimension");
                    last_err = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(RagError::IndexUninitialized(format!(
            "embedding dimension unavailable after {} attempts: {}",
            attempts, last_err
        )))
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Embed texts in batches. Output length always equals input length.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        let batches = texts.len().div_ceil(self.batch_size);

        for (batch, chunk) in texts.chunks(self.batch_size).enumerate() {
            debug!(batch, batches, size = chunk.len(), "embedding batch");
            match self.embed_batch_with_retry(batch, chunk).await {
                Ok(batch_vectors) => vectors.extend(batch_vectors),
                Err(e @ RagError::DimensionMismatch { .. }) => return Err(e),
                Err(e) => {
                    warn!(batch, size = chunk.len(), error = %e, "substituting zero vectors for failed batch");
                    vectors.extend(std::iter::repeat(vec![0.0f32; self.dims]).take(chunk.len()));
                }
            }
        }

        Ok(vectors)
    }

    /// Embed a single query text.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(&[text.to_string()]).await?;
        Ok(vectors.pop().unwrap_or_else(|| vec![0.0; self.dims]))
    }

    async fn embed_batch_with_retry(&self, batch: usize, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let attempts = self.max_retries + 1;
        let mut last_err = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = self.backoff * (1u32 << (attempt - 2).min(5));
                tokio::time::sleep(delay).await;
            }

            match self.provider.embed_batch(texts).await {
                Ok(vectors) if vectors.len() == texts.len() => {
                    if let Some(bad) = vectors.iter().find(|v| v.len() != self.dims) {
                        return Err(RagError::DimensionMismatch {
                            expected: self.dims,
                            actual: bad.len(),
                        });
                    }
                    return Ok(vectors);
                }
                Ok(vectors) => {
                    last_err = format!(
                        "provider returned {} vectors for {} texts",
                        vectors.len(),
                        texts.len()
                    );
                }
                Err(e) => last_err = e.to_string(),
            }
            warn!(batch, attempt, attempts, error = %last_err, "embedding batch attempt failed");
        }

        Err(RagError::EmbeddingBatchFailed {
            batch,
            attempts,
            reason: last_err,
        })
    }
}

async fn resolve_dims(provider: &dyn EmbeddingProvider) -> anyhow::Result<usize> {
    if let Some(dims) = provider.dims() {
        return Ok(dims);
    }
    let probe = provider.embed_batch(&[DIMENSION_PROBE.to_string()]).await?;
    match probe.first() {
        Some(v) if !v.is_empty() => Ok(v.len()),
        _ => bail!("provider returned no vector for the dimension probe"),
    }
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns errors.
///
/// Used when `embedding.provider = "disabled"`. Its dimension is unknown,
/// so a knowledge base built on it never becomes usable.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> Option<usize> {
        None
    }
    async fn embed_batch(&self, _texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled")
    }
}

// ============ OpenAI Provider ============

/// Embedding provider for OpenAI-compatible APIs.
///
/// Calls `POST {url}/v1/embeddings` (default `https://api.openai.com`).
/// Reads the bearer token from `OPENAI_API_KEY`; without it every request
/// fails and the client falls back to zero vectors.
pub struct OpenAIProvider {
    client: reqwest::Client,
    model: String,
    dims: Option<usize>,
    url: String,
    api_key: Option<String>,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY").ok();
        if api_key.is_none() {
            warn!("OPENAI_API_KEY not set; embeddings will degrade to zero vectors");
        }

        Ok(Self {
            client: http_client(config.timeout_secs)?,
            model,
            dims: config.dims,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            api_key,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> Option<usize> {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| anyhow!("OPENAI_API_KEY not set"))?;

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.url.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await?;

        let json = success_json(response, "OpenAI").await?;
        parse_openai_response(&json)
    }
}

/// Parse the OpenAI embeddings API response JSON.
///
/// Extracts the `data[].embedding` arrays, ordered by their `index` field.
fn parse_openai_response(json: &serde_json::Value) -> anyhow::Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());

    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);

        indexed.push((index, json_floats(embedding)?));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default: `http://localhost:11434`).
pub struct OllamaProvider {
    client: reqwest::Client,
    model: String,
    dims: Option<usize>,
    url: String,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for Ollama provider"))?;

        Ok(Self {
            client: http_client(config.timeout_secs)?,
            model,
            dims: config.dims,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> Option<usize> {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
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
            .with_context(|| format!("Ollama connection error (is Ollama running at {}?)", self.url))?;

        let json = success_json(response, "Ollama").await?;
        parse_embeddings_array(&json, "Ollama")
    }
}

// ============ Cohere Provider ============

/// Embedding provider for the Cohere API.
///
/// Calls `POST {url}/v1/embed` (default `https://api.cohere.ai`) with
/// `input_type = "search_document"`. Reads `COHERE_API_KEY`.
pub struct CohereProvider {
    client: reqwest::Client,
    model: String,
    dims: Option<usize>,
    url: String,
    api_key: Option<String>,
}

impl CohereProvider {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for Cohere provider"))?;
        let api_key = std::env::var("COHERE_API_KEY").ok();
        if api_key.is_none() {
            warn!("COHERE_API_KEY not set; embeddings will degrade to zero vectors");
        }

        Ok(Self {
            client: http_client(config.timeout_secs)?,
            model,
            dims: config.dims,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.cohere.ai".to_string()),
            api_key,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for CohereProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> Option<usize> {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| anyhow!("COHERE_API_KEY not set"))?;

        let body = serde_json::json!({
            "model": self.model,
            "texts": texts,
            "input_type": "search_document",
        });

        let response = self
            .client
            .post(format!("{}/v1/embed", self.url.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await?;

        let json = success_json(response, "Cohere").await?;
        parse_embeddings_array(&json, "Cohere")
    }
}

/// Parse `{"embeddings": [[...], ...]}`, the shape Ollama and Cohere share.
fn parse_embeddings_array(json: &serde_json::Value, api: &str) -> anyhow::Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("Invalid {} response: missing embeddings array", api))?;

    embeddings
        .iter()
        .map(|embedding| {
            let values = embedding
                .as_array()
                .ok_or_else(|| anyhow!("Invalid {} response: embedding is not an array", api))?;
            json_floats(values)
        })
        .collect()
}

fn json_floats(values: &[serde_json::Value]) -> anyhow::Result<Vec<f32>> {
    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| anyhow!("embedding contains a non-numeric value"))
        })
        .collect()
}

pub(crate) fn http_client(timeout_secs: u64) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

/// Return the JSON body of a 2xx response, or an error carrying status and body.
pub(crate) async fn success_json(response: reqwest::Response, api: &str) -> anyhow::Result<serde_json::Value> {
    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        bail!("{} API error {}: {}", api, status, body_text);
    }
    response
        .json()
        .await
        .with_context(|| format!("Invalid {} response body", api))
}

// ============ Local Provider (fastembed) ============

/// Embedding provider for local inference through fastembed.
///
/// The model is downloaded on first use and kept loaded afterwards.
#[cfg(feature = "local-embeddings")]
pub struct LocalProvider {
    model_name: String,
    dims: usize,
    model: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings")]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        local_model(&model_name)?;
        let dims = config.dims.unwrap_or(match model_name.as_str() {
            "bge-base-en-v1.5" | "multilingual-e5-base" => 768,
            "bge-large-en-v1.5" | "multilingual-e5-large" => 1024,
            _ => 384,
        });
        Ok(Self {
            model_name,
            dims,
            model: Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings")]
fn local_model(name: &str) -> anyhow::Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => bail!("Unknown local embedding model: '{}'", other),
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> Option<usize> {
        Some(self.dims)
    }

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let model = self.model.clone();
        let kind = local_model(&self.model_name)?;
        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut guard = model
                .lock()
                .map_err(|_| anyhow!("local embedding model lock poisoned"))?;
            if guard.is_none() {
                let loaded = fastembed::TextEmbedding::try_new(fastembed::InitOptions::new(kind))
                    .map_err(|e| anyhow!("Failed to initialize local embedding model: {}", e))?;
                *guard = Some(loaded);
            }
            let embedder = guard
                .as_mut()
                .ok_or_else(|| anyhow!("local embedding model not loaded"))?;
            embedder
                .embed(texts, None)
                .map_err(|e| anyhow!("Local embedding failed: {}", e))
        })
        .await?
    }
}

/// Create the [`EmbeddingProvider`] named by `embedding.provider`.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
/// | `"cohere"` | [`CohereProvider`] |
/// | `"local"` | `LocalProvider` (feature `local-embeddings`) |
pub fn create_provider(config: &EmbeddingConfig) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        "cohere" => Ok(Arc::new(CohereProvider::new(config)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Arc::new(LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}
