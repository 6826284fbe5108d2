//! TOML configuration.
//!
//! Every section except `[db]` is optional; missing keys fall back to the
//! `default_*` functions below. [`load_config`] parses and validates the
//! file and is the only way the binary builds a [`Config`].

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rag_harness_core::chunk::{ChunkParams, ChunkUnit};
use rag_harness_core::search::MergeStrategy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
    #[serde(default)]
    pub unit: ChunkUnit,
    #[serde(default)]
    pub boundary_window: Option<usize>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
            unit: ChunkUnit::Chars,
            boundary_window: None,
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> ChunkParams {
        ChunkParams {
            size: self.chunk_size,
            overlap: self.overlap,
            unit: self.unit,
            boundary_window: self.boundary_window,
        }
    }
}

fn default_chunk_size() -> usize {
    500
}
fn default_overlap() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL of the provider API.
    #[serde(default)]
    pub url: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    /// Per-call timeout, independent of the retry budget.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            api_key_env: default_api_key_env(),
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    20
}
fn default_max_concurrency() -> usize {
    4
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    1000
}
fn default_retry_max_ms() -> u64 {
    30_000
}
fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
    /// Weight of the semantic score in hybrid mode.
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    /// Candidates fetched from each channel before a hybrid merge.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    /// Results scoring below this are dropped.
    #[serde(default)]
    pub min_score: Option<f64>,
    /// How hybrid mode combines its two channels.
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    /// Word-overlap similarity at which deduplication treats two results
    /// as the same text.
    #[serde(default = "default_dedupe_threshold")]
    pub dedupe_threshold: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: default_top_k(),
            max_top_k: default_max_top_k(),
            hybrid_alpha: default_hybrid_alpha(),
            candidate_k: default_candidate_k(),
            min_score: None,
            merge_strategy: MergeStrategy::default(),
            dedupe_threshold: default_dedupe_threshold(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_max_top_k() -> usize {
    100
}
fn default_hybrid_alpha() -> f64 {
    0.6
}
fn default_candidate_k() -> usize {
    80
}
fn default_dedupe_threshold() -> f64 {
    0.95
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Index whatever a partially failed extraction recovered.
    #[serde(default = "default_true")]
    pub accept_partial: bool,
    #[serde(default = "default_max_document_bytes")]
    pub max_document_bytes: u64,
    #[serde(default = "default_max_concurrent_documents")]
    pub max_concurrent_documents: usize,
    /// Deadline for a whole document, from load to final status.
    #[serde(default = "default_ingest_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            accept_partial: true,
            max_document_bytes: default_max_document_bytes(),
            max_concurrent_documents: default_max_concurrent_documents(),
            timeout_secs: default_ingest_timeout_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_document_bytes() -> u64 {
    50 * 1024 * 1024
}
fn default_max_concurrent_documents() -> usize {
    4
}
fn default_ingest_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Defaults everywhere, with the database at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            ingest: IngestConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    config
        .chunking
        .params()
        .validate()
        .map_err(|e| anyhow::anyhow!("chunking: {}", e))?;

    if config.retrieval.default_top_k == 0 {
        bail!("retrieval.default_top_k must be >= 1");
    }
    if config.retrieval.max_top_k < config.retrieval.default_top_k {
        bail!("retrieval.max_top_k must be >= retrieval.default_top_k");
    }
    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.retrieval.dedupe_threshold) {
        bail!("retrieval.dedupe_threshold must be in [0.0, 1.0]");
    }

    let emb = &config.embedding;
    if emb.batch_size == 0 {
        bail!("embedding.batch_size must be >= 1");
    }
    if emb.max_concurrency == 0 {
        bail!("embedding.max_concurrency must be >= 1");
    }
    if emb.timeout_secs == 0 {
        bail!("embedding.timeout_secs must be >= 1");
    }

    match emb.provider.as_str() {
        "disabled" | "hash" | "fastembed" => {}
        "openai" | "ollama" => {
            if emb.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    emb.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, hash, or fastembed.",
            other
        ),
    }
    if emb.is_enabled() && emb.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }
    if matches!(emb.provider.as_str(), "openai" | "ollama") && emb.dims.is_none() {
        bail!(
            "embedding.dims must be specified when provider is '{}'",
            emb.provider
        );
    }

    if config.ingest.max_concurrent_documents == 0 {
        bail!("ingest.max_concurrent_documents must be >= 1");
    }
    if config.ingest.timeout_secs == 0 {
        bail!("ingest.timeout_secs must be >= 1");
    }

    Ok(())
}
