//! Embedding service abstraction and implementations.
//!
//! Defines the [`EmbeddingService`] trait and concrete implementations:
//! - **[`DisabledService`]**: returns errors; used when embeddings are not configured.
//! - **[`OpenAIService`]**: calls the OpenAI embeddings API.
//! - **[`OllamaService`]**: calls a local Ollama instance's `/api/embed` endpoint.
//! - **`LocalService`**: runs models locally via fastembed (feature
//!   `local-embeddings-fastembed`); no network calls after model download.
//!
//! Also provides vector utilities:
//! - [`Metric`]: configurable similarity measure (cosine by default)
//! - [`cosine_similarity`]: compute similarity between two embedding vectors
//! - [`vec_to_blob`]: encode a `Vec<f32>` as little-endian bytes for SQLite BLOB storage
//! - [`blob_to_vec`]: decode a SQLite BLOB back into a `Vec<f32>`
//!
//! # Error Classification
//!
//! Services make one attempt per call; the batcher owns retries.
//! - HTTP 408, 429 and 5xx, timeouts, connection errors → transient
//! - Other HTTP 4xx, unparseable responses → permanent
//!
//! # Service Selection
//!
//! ```rust,no_run
//! # use maintenance_intel::config::EmbeddingConfig;
//! # use maintenance_intel::embedding::create_service;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! let service = create_service(&config).unwrap();
//! assert_eq!(service.model_name(), "disabled");
//! ```

#[cfg(feature = "local-embeddings-fastembed")]
mod local;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::EmbeddingConfig;
use crate::error::ServiceError;

#[cfg(feature = "local-embeddings-fastembed")]
pub use local::LocalService;

/// Response to one batch call.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbedResponse {
    /// One entry per input text, in input order. An `Err` rejects only
    /// that item.
    pub vectors: Vec<Result<Vec<f32>, String>>,
    /// Tokens billed for the call, when the service reports them.
    pub tokens: Option<u64>,
}

/// An external service that turns texts into vectors.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;

    async fn embed(&self, texts: &[String]) -> Result<EmbedResponse, ServiceError>;
}

// ============ Disabled Service ============

/// A no-op embedding service that always returns errors.
///
/// Used when `embedding.provider = "disabled"` in the configuration.
pub struct DisabledService;

#[async_trait]
impl EmbeddingService for DisabledService {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<EmbedResponse, ServiceError> {
        Err(ServiceError::permanent("Embedding provider is disabled"))
    }
}

// ============ OpenAI Service ============

/// Embedding service using the OpenAI API.
///
/// Calls the `POST /v1/embeddings` endpoint with the configured model.
/// Requires the `OPENAI_API_KEY` environment variable to be set.
pub struct OpenAIService {
    client: reqwest::Client,
    api_key: String,
    /// Model name (e.g. `"text-embedding-3-small"`).
    model: String,
    /// Vector dimensionality (e.g. `1536`).
    dims: usize,
}

impl OpenAIService {
    /// Create a new OpenAI service from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `model` or `dims` is not set in config,
    /// or if `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            model,
            dims,
        })
    }
}

#[async_trait]
impl EmbeddingService for OpenAIService {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<EmbedResponse, ServiceError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ServiceError::from_status(status.as_u16(), &body_text));
        }

        let json: serde_json::Value = response.json().await?;
        parse_openai_response(&json, texts.len())
    }
}

/// Parse the OpenAI embeddings API response JSON.
///
/// Places each `data[].embedding` at its `index`; inputs the response
/// does not cover come back as per-item errors.
fn parse_openai_response(
    json: &serde_json::Value,
    expected: usize,
) -> Result<EmbedResponse, ServiceError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ServiceError::permanent("Invalid OpenAI response: missing data array"))?;

    let mut vectors: Vec<Result<Vec<f32>, String>> =
        vec![Err("missing from response".to_string()); expected];

    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        if index >= expected {
            continue;
        }
        vectors[index] = match item.get("embedding").and_then(|e| e.as_array()) {
            Some(values) => Ok(values
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect()),
            None => Err("missing embedding".to_string()),
        };
    }

    let tokens = json
        .get("usage")
        .and_then(|u| u.get("total_tokens"))
        .and_then(|t| t.as_u64());

    Ok(EmbedResponse { vectors, tokens })
}

// ============ Ollama Service ============

/// Embedding service using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured Ollama URL (default: `http://localhost:11434`).
/// Requires Ollama to be running with an embedding model pulled (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaService {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
}

impl OllamaService {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            model,
            dims,
            url,
        })
    }
}

#[async_trait]
impl EmbeddingService for OllamaService {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<EmbedResponse, ServiceError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ServiceError::transient(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url, e
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ServiceError::from_status(status.as_u16(), &body_text));
        }

        let json: serde_json::Value = response.json().await?;
        parse_ollama_response(&json, texts.len())
    }
}

fn parse_ollama_response(
    json: &serde_json::Value,
    expected: usize,
) -> Result<EmbedResponse, ServiceError> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            ServiceError::permanent("Invalid Ollama response: missing embeddings array")
        })?;

    let mut vectors: Vec<Result<Vec<f32>, String>> = embeddings
        .iter()
        .take(expected)
        .map(|embedding| match embedding.as_array() {
            Some(values) => Ok(values
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect()),
            None => Err("embedding is not an array".to_string()),
        })
        .collect();
    vectors.resize(expected, Err("missing from response".to_string()));

    let tokens = json.get("prompt_eval_count").and_then(|t| t.as_u64());

    Ok(EmbedResponse { vectors, tokens })
}

/// Create the appropriate [`EmbeddingService`] based on configuration.
///
/// # Supported Providers
///
/// | Config Value | Service |
/// |-------------|---------|
/// | `"disabled"` | [`DisabledService`] |
/// | `"openai"` | [`OpenAIService`] |
/// | `"ollama"` | [`OllamaService`] |
/// | `"local"` | `LocalService` (requires `local-embeddings-fastembed`) |
pub fn create_service(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingService>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledService)),
        "openai" => Ok(Box::new(OpenAIService::new(config)?)),
        "ollama" => Ok(Box::new(OllamaService::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Box::new(LocalService::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Vector utilities ============

/// Similarity measure used by the index. Higher scores are always more
/// similar, so thresholds read the same way for every metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Metric {
    #[default]
    Cosine,
    Dot,
    /// Scored as `1 / (1 + distance)`, in `(0, 1]`.
    Euclidean,
}

impl Metric {
    pub fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Cosine => cosine_similarity(a, b),
            Metric::Dot => {
                if a.len() != b.len() {
                    return 0.0;
                }
                a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
            }
            Metric::Euclidean => {
                if a.len() != b.len() || a.is_empty() {
                    return 0.0;
                }
                let d: f32 = a
                    .iter()
                    .zip(b.iter())
                    .map(|(x, y)| (x - y) * (x - y))
                    .sum::<f32>()
                    .sqrt();
                1.0 / (1.0 + d)
            }
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Metric::Cosine => "cosine",
            Metric::Dot => "dot",
            Metric::Euclidean => "euclidean",
        })
    }
}

impl FromStr for Metric {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cosine" => Ok(Metric::Cosine),
            "dot" => Ok(Metric::Dot),
            "euclidean" => Ok(Metric::Euclidean),
            other => bail!("Unknown metric: {}", other),
        }
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use maintenance_intel::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors or
/// vectors of different lengths.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
