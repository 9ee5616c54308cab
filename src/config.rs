//! TOML configuration and directory resolution.
//!
//! The host application decides when to load configuration; this module
//! fixes the format and the environment override names so every consumer
//! resolves the same paths:
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `GNOSIS_CONFIG_DIR` | configuration directory |
//! | `GNOSIS_DATA_DIR` | database and index directory |
//! | `GNOSIS_MODEL_CACHE_DIR` | model artifact cache |
//!
//! Each override must be an absolute path.

use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{Error, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub fts: FtsConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FtsConfig {
    #[serde(default = "default_tokenizer")]
    pub tokenizer: String,
}

impl Default for FtsConfig {
    fn default() -> Self {
        Self {
            tokenizer: default_tokenizer(),
        }
    }
}

fn default_tokenizer() -> String {
    "unicode61".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Soft chunk size in bytes of canonical markdown.
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: default_max_chunk_bytes(),
        }
    }
}

fn default_max_chunk_bytes() -> usize {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// RRF constant.
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    /// Cross-encoder blend weight: `final = α·rerank + (1-α)·rrf_norm`.
    #[serde(default = "default_rerank_alpha")]
    pub rerank_alpha: f64,
    /// Candidates fetched per retrieval list.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    /// Fused candidates passed to the reranker.
    #[serde(default = "default_rerank_top_n")]
    pub rerank_top_n: usize,
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    /// Minimum similarity for vector results.
    #[serde(default = "default_threshold")]
    pub similarity_threshold: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            rerank_alpha: default_rerank_alpha(),
            candidate_k: default_candidate_k(),
            rerank_top_n: default_rerank_top_n(),
            final_limit: default_final_limit(),
            similarity_threshold: default_threshold(),
        }
    }
}

fn default_rrf_k() -> f64 {
    60.0
}
fn default_rerank_alpha() -> f64 {
    0.7
}
fn default_candidate_k() -> usize {
    80
}
fn default_rerank_top_n() -> usize {
    20
}
fn default_final_limit() -> usize {
    10
}
fn default_threshold() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    /// Base URL of an OpenAI-compatible endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Environment variable holding the API key, if the endpoint needs one.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub embed_model: Option<String>,
    #[serde(default)]
    pub embed_dimensions: Option<usize>,
    #[serde(default)]
    pub rerank_model: Option<String>,
    #[serde(default)]
    pub generate_model: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key_env: None,
            embed_model: None,
            embed_dimensions: None,
            rerank_model: None,
            generate_model: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_endpoint() -> String {
    "http://127.0.0.1:8080/v1".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct LimitsConfig {
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_max_bytes() -> u64 {
    64 * 1024 * 1024
}
fn default_timeout_ms() -> u64 {
    30_000
}

impl Config {
    /// Parse a TOML config file.
    pub fn load(path: &std::path::Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| Error::validation(format!("config parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.retrieval.rerank_alpha) {
            return Err(Error::validation("retrieval.rerank_alpha must be in [0, 1]"));
        }
        if self.retrieval.rrf_k <= 0.0 {
            return Err(Error::validation("retrieval.rrf_k must be positive"));
        }
        crate::store::validate_tokenizer(&self.fts.tokenizer)?;
        Ok(())
    }
}

fn env_dir(var: &str) -> Option<PathBuf> {
    std::env::var_os(var).map(PathBuf::from)
}

/// Configuration directory, honoring `GNOSIS_CONFIG_DIR`.
pub fn config_dir() -> PathBuf {
    env_dir("GNOSIS_CONFIG_DIR").unwrap_or_else(|| PathBuf::from("./config"))
}

/// Data directory, honoring `GNOSIS_DATA_DIR`.
pub fn data_dir() -> PathBuf {
    env_dir("GNOSIS_DATA_DIR").unwrap_or_else(|| PathBuf::from("./data"))
}

/// Model cache directory, honoring `GNOSIS_MODEL_CACHE_DIR`.
pub fn model_cache_dir() -> PathBuf {
    env_dir("GNOSIS_MODEL_CACHE_DIR").unwrap_or_else(|| data_dir().join("models"))
}
