use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub patterns: PatternConfig,
    #[serde(default)]
    pub costs: CostConfig,
}

impl Config {
    /// Configuration with every section at its default, pointed at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            extraction: ExtractionConfig::default(),
            embedding: EmbeddingConfig::default(),
            index: IndexConfig::default(),
            patterns: PatternConfig::default(),
            costs: CostConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default = "default_extraction_model")]
    pub model: String,
    #[serde(default = "default_extraction_max_tokens")]
    pub max_tokens: u32,
    /// Bumping this invalidates every cached extraction.
    #[serde(default = "default_extractor_version")]
    pub extractor_version: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_extraction_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_document_bytes")]
    pub max_document_bytes: usize,
    #[serde(default)]
    pub cache_ttl_days: Option<u64>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: default_extraction_model(),
            max_tokens: default_extraction_max_tokens(),
            extractor_version: default_extractor_version(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            timeout_secs: default_extraction_timeout_secs(),
            concurrency: default_concurrency(),
            max_document_bytes: default_max_document_bytes(),
            cache_ttl_days: None,
        }
    }
}

impl ExtractionConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_extraction_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}
fn default_extraction_max_tokens() -> u32 {
    4096
}
fn default_extractor_version() -> String {
    "v1".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_extraction_timeout_secs() -> u64 {
    60
}
fn default_concurrency() -> usize {
    5
}
fn default_max_document_bytes() -> usize {
    50 * 1024 * 1024
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the `ollama` provider.
    #[serde(default)]
    pub url: Option<String>,
    /// Texts shorter than this (in chars) are filtered, never embedded.
    #[serde(default = "default_min_text_length")]
    pub min_text_length: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_recent_window_secs")]
    pub recent_window_secs: u64,
    #[serde(default = "default_recent_capacity")]
    pub recent_capacity: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            url: None,
            min_text_length: default_min_text_length(),
            batch_size: default_batch_size(),
            max_in_flight: default_max_in_flight(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            timeout_secs: default_embedding_timeout_secs(),
            recent_window_secs: default_recent_window_secs(),
            recent_capacity: default_recent_capacity(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_min_text_length() -> usize {
    50
}
fn default_batch_size() -> usize {
    100
}
fn default_max_in_flight() -> usize {
    4
}
fn default_embedding_timeout_secs() -> u64 {
    30
}
fn default_recent_window_secs() -> u64 {
    600
}
fn default_recent_capacity() -> usize {
    10_000
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_metric")]
    pub metric: String,
    /// Hits scoring below this are dropped from query results.
    #[serde(default)]
    pub min_score: Option<f32>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            metric: default_metric(),
            min_score: None,
        }
    }
}

fn default_metric() -> String {
    "cosine".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PatternConfig {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_min_cluster_size")]
    pub min_cluster_size: usize,
    #[serde(default = "default_window_days")]
    pub window_days: i64,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            min_cluster_size: default_min_cluster_size(),
            window_days: default_window_days(),
            interval_secs: default_interval_secs(),
        }
    }
}

fn default_similarity_threshold() -> f32 {
    0.85
}
fn default_min_cluster_size() -> usize {
    3
}
fn default_window_days() -> i64 {
    90
}
fn default_interval_secs() -> u64 {
    3600
}

/// Per-1k-token prices (USD) and optional spend budgets.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CostConfig {
    #[serde(default = "default_extraction_input_per_1k")]
    pub extraction_input_per_1k: f64,
    #[serde(default = "default_extraction_output_per_1k")]
    pub extraction_output_per_1k: f64,
    #[serde(default = "default_embedding_per_1k")]
    pub embedding_per_1k: f64,
    /// Above this spend the batcher dispatches one batch at a time.
    #[serde(default)]
    pub soft_budget_usd: Option<f64>,
    /// Above this spend no new external calls are made.
    #[serde(default)]
    pub hard_budget_usd: Option<f64>,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            extraction_input_per_1k: default_extraction_input_per_1k(),
            extraction_output_per_1k: default_extraction_output_per_1k(),
            embedding_per_1k: default_embedding_per_1k(),
            soft_budget_usd: None,
            hard_budget_usd: None,
        }
    }
}

fn default_extraction_input_per_1k() -> f64 {
    0.003
}
fn default_extraction_output_per_1k() -> f64 {
    0.015
}
fn default_embedding_per_1k() -> f64 {
    0.0001
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Extraction
    match config.extraction.provider.as_str() {
        "disabled" | "anthropic" => {}
        other => anyhow::bail!(
            "Unknown extraction provider: '{}'. Must be disabled or anthropic.",
            other
        ),
    }
    if config.extraction.extractor_version.trim().is_empty() {
        anyhow::bail!("extraction.extractor_version must not be empty");
    }
    if config.extraction.concurrency == 0 {
        anyhow::bail!("extraction.concurrency must be > 0");
    }
    if config.extraction.timeout_secs == 0 {
        anyhow::bail!("extraction.timeout_secs must be > 0");
    }

    // Embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.max_in_flight == 0 {
        anyhow::bail!("embedding.max_in_flight must be > 0");
    }
    if config.embedding.timeout_secs == 0 {
        anyhow::bail!("embedding.timeout_secs must be > 0");
    }
    if matches!(config.embedding.provider.as_str(), "openai" | "ollama") {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    // Index
    match config.index.metric.as_str() {
        "cosine" | "dot" | "euclidean" => {}
        other => anyhow::bail!(
            "Unknown index metric: '{}'. Must be cosine, dot, or euclidean.",
            other
        ),
    }

    // Patterns
    if config.index.metric == "cosine"
        && !(-1.0..=1.0).contains(&config.patterns.similarity_threshold)
    {
        anyhow::bail!("patterns.similarity_threshold must be in [-1.0, 1.0] for cosine");
    }
    if config.patterns.min_cluster_size < 2 {
        anyhow::bail!("patterns.min_cluster_size must be >= 2");
    }
    if config.patterns.window_days < 1 {
        anyhow::bail!("patterns.window_days must be >= 1");
    }
    if config.patterns.interval_secs == 0 {
        anyhow::bail!("patterns.interval_secs must be > 0");
    }

    // Costs
    if let (Some(soft), Some(hard)) = (config.costs.soft_budget_usd, config.costs.hard_budget_usd) {
        if soft > hard {
            anyhow::bail!("costs.soft_budget_usd must not exceed costs.hard_budget_usd");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse("[db]\npath = \"./data/mintel.sqlite\"\n").unwrap();
        assert_eq!(config.embedding.min_text_length, 50);
        assert_eq!(config.embedding.batch_size, 100);
        assert_eq!(config.extraction.extractor_version, "v1");
        assert_eq!(config.index.metric, "cosine");
        assert_eq!(config.patterns.min_cluster_size, 3);
        assert!(!config.extraction.is_enabled());
        assert!(!config.embedding.is_enabled());
    }

    #[test]
    fn test_overrides_apply() {
        let config = parse(
            r#"
[db]
path = "x.sqlite"

[embedding]
provider = "openai"
model = "text-embedding-3-small"
dims = 1536
batch_size = 32

[patterns]
similarity_threshold = 0.9
min_cluster_size = 4
"#,
        )
        .unwrap();
        assert_eq!(config.embedding.batch_size, 32);
        assert_eq!(config.patterns.min_cluster_size, 4);
        assert!((config.patterns.similarity_threshold - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let err = parse("[db]\npath = \"x\"\n[extraction]\nprovider = \"gpt\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown extraction provider"));
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        assert!(parse("[db]\npath = \"x\"\n[embedding]\nbatch_size = 0\n").is_err());
    }

    #[test]
    fn test_rejects_zero_timeouts() {
        let err = parse("[db]\npath = \"x\"\n[extraction]\ntimeout_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("extraction.timeout_secs"));
        let err = parse("[db]\npath = \"x\"\n[embedding]\ntimeout_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("embedding.timeout_secs"));
    }

    #[test]
    fn test_rejects_openai_without_dims() {
        let err = parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"openai\"\nmodel = \"m\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("dims"));
    }

    #[test]
    fn test_rejects_tiny_clusters() {
        assert!(parse("[db]\npath = \"x\"\n[patterns]\nmin_cluster_size = 1\n").is_err());
    }

    #[test]
    fn test_rejects_inverted_budgets() {
        assert!(
            parse("[db]\npath = \"x\"\n[costs]\nsoft_budget_usd = 10.0\nhard_budget_usd = 5.0\n")
                .is_err()
        );
    }

    #[test]
    fn test_rejects_unknown_metric() {
        assert!(parse("[db]\npath = \"x\"\n[index]\nmetric = \"manhattan\"\n").is_err());
    }
}
