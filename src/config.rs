use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Tokenizer id accepted by [`ChunkConfig::tokenizer_id`].
///
/// Chunk boundaries must be bit-for-bit reproducible across runs and
/// deployments, so the tokenizer is pinned by name and validated at load.
pub const TOKENIZER_WHITESPACE_V1: &str = "whitespace/v1";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub chunk: ChunkConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub rate: RateConfig,
    #[serde(default)]
    pub index_cache: IndexCacheConfig,
    #[serde(default)]
    pub confidence: ConfidenceConfig,
    #[serde(default)]
    pub reranker: RerankerConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default = "default_greetings")]
    pub greetings: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// Pool size. Writers serialize inside SQLite anyway; this bounds the
    /// number of concurrent readers plus queued writers.
    #[serde(default = "default_db_connections")]
    pub max_connections: u32,
}

fn default_db_connections() -> u32 {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct ObjectStoreConfig {
    /// Root directory for persisted index blobs (`indexes/{tenant}/...`).
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkConfig {
    #[serde(default = "default_target_tokens")]
    pub target_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
    #[serde(default = "default_min_tokens")]
    pub min_tokens: usize,
    #[serde(default = "default_tokenizer_id")]
    pub tokenizer_id: String,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            target_tokens: default_target_tokens(),
            overlap_tokens: default_overlap_tokens(),
            min_tokens: default_min_tokens(),
            tokenizer_id: default_tokenizer_id(),
        }
    }
}

fn default_target_tokens() -> usize {
    450
}
fn default_overlap_tokens() -> usize {
    80
}
fn default_min_tokens() -> usize {
    100
}
fn default_tokenizer_id() -> String {
    TOKENIZER_WHITESPACE_V1.to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k_retrieval")]
    pub k_retrieval: usize,
    #[serde(default = "default_k_fused")]
    pub k_fused: usize,
    #[serde(default = "default_k_rrf")]
    pub k_rrf: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k_retrieval: default_k_retrieval(),
            k_fused: default_k_fused(),
            k_rrf: default_k_rrf(),
        }
    }
}

fn default_k_retrieval() -> usize {
    20
}
fn default_k_fused() -> usize {
    10
}
fn default_k_rrf() -> usize {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContextConfig {
    #[serde(default = "default_budget_tokens")]
    pub budget_tokens: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            budget_tokens: default_budget_tokens(),
        }
    }
}

fn default_budget_tokens() -> usize {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
    #[serde(default)]
    pub enable_persist: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
            enable_persist: false,
        }
    }
}

fn default_ttl_seconds() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct QuotaConfig {
    #[serde(default = "default_max_documents")]
    pub max_documents: i64,
    #[serde(default = "default_max_storage_bytes")]
    pub max_storage_bytes: i64,
    #[serde(default = "default_daily_queries")]
    pub daily_queries: i64,
    #[serde(default = "default_daily_tokens")]
    pub daily_tokens: i64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_documents: default_max_documents(),
            max_storage_bytes: default_max_storage_bytes(),
            daily_queries: default_daily_queries(),
            daily_tokens: default_daily_tokens(),
        }
    }
}

fn default_max_documents() -> i64 {
    100
}
fn default_max_storage_bytes() -> i64 {
    500 * 1024 * 1024
}
fn default_daily_queries() -> i64 {
    500
}
fn default_daily_tokens() -> i64 {
    500_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateConfig {
    #[serde(default = "default_rpm")]
    pub rpm: u32,
    #[serde(default = "default_tpm")]
    pub tpm: u32,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            rpm: default_rpm(),
            tpm: default_tpm(),
        }
    }
}

fn default_rpm() -> u32 {
    30
}
fn default_tpm() -> u32 {
    6000
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexCacheConfig {
    #[serde(default = "default_index_cache_size")]
    pub size: usize,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

impl Default for IndexCacheConfig {
    fn default() -> Self {
        Self {
            size: default_index_cache_size(),
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

fn default_index_cache_size() -> usize {
    10
}
fn default_flush_interval_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConfidenceConfig {
    #[serde(default)]
    pub thresholds: ConfidenceThresholds,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConfidenceThresholds {
    #[serde(default = "default_high")]
    pub high: f32,
    #[serde(default = "default_medium")]
    pub medium: f32,
    #[serde(default = "default_low")]
    pub low: f32,
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self {
            high: default_high(),
            medium: default_medium(),
            low: default_low(),
        }
    }
}

fn default_high() -> f32 {
    0.75
}
fn default_medium() -> f32 {
    0.5
}
fn default_low() -> f32 {
    0.25
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Cross-encoder model id for the HTTP reranker; when unset, the
    /// built-in lexical-overlap scorer is used.
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model_id: None,
            api_base: None,
            timeout_secs: default_provider_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"null"` (deterministic, offline) or `"http"` (OpenAI-compatible).
    #[serde(default = "default_null_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Upper bound on the summed token estimate of one batch.
    #[serde(default = "default_max_batch_tokens")]
    pub max_batch_tokens: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub api_base: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_null_provider(),
            model: None,
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_batch_tokens: default_max_batch_tokens(),
            max_retries: default_max_retries(),
            timeout_secs: default_provider_timeout(),
            api_base: None,
            api_key_env: default_api_key_env(),
        }
    }
}

fn default_null_provider() -> String {
    "null".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_batch_size() -> usize {
    64
}
fn default_max_batch_tokens() -> usize {
    8000
}
fn default_max_retries() -> u32 {
    5
}
fn default_provider_timeout() -> u64 {
    30
}
fn default_api_key_env() -> String {
    "RAGLINE_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// `"null"` (deterministic, offline) or `"http"` (chat-completions style).
    #[serde(default = "default_null_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_null_provider(),
            model: None,
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            max_retries: default_llm_retries(),
            timeout_secs: default_llm_timeout(),
            api_base: None,
            api_key_env: default_api_key_env(),
        }
    }
}

fn default_temperature() -> f32 {
    0.1
}
fn default_max_output_tokens() -> u32 {
    512
}
fn default_llm_retries() -> u32 {
    3
}
fn default_llm_timeout() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_greetings() -> Vec<String> {
    [
        "hi",
        "hello",
        "hey",
        "howdy",
        "greetings",
        "good morning",
        "good afternoon",
        "good evening",
        "thanks",
        "thank you",
        "bye",
        "goodbye",
        "ok",
        "okay",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Config> {
        let config: Config =
            toml::from_str(content).map_err(|e| Error::Config(format!("parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.db.max_connections == 0 {
            return Err(Error::Config("db.max_connections must be >= 1".into()));
        }
        if self.chunk.target_tokens == 0 {
            return Err(Error::Config("chunk.target_tokens must be > 0".into()));
        }
        if self.chunk.overlap_tokens >= self.chunk.target_tokens {
            return Err(Error::Config(
                "chunk.overlap_tokens must be < chunk.target_tokens".into(),
            ));
        }
        if self.chunk.min_tokens > self.chunk.target_tokens {
            return Err(Error::Config(
                "chunk.min_tokens must be <= chunk.target_tokens".into(),
            ));
        }
        if self.chunk.tokenizer_id != TOKENIZER_WHITESPACE_V1 {
            return Err(Error::Config(format!(
                "unknown chunk.tokenizer_id: '{}' (only '{}' is available)",
                self.chunk.tokenizer_id, TOKENIZER_WHITESPACE_V1
            )));
        }
        if self.retrieval.k_retrieval == 0 || self.retrieval.k_fused == 0 {
            return Err(Error::Config(
                "retrieval.k_retrieval and retrieval.k_fused must be >= 1".into(),
            ));
        }
        if self.context.budget_tokens == 0 {
            return Err(Error::Config("context.budget_tokens must be > 0".into()));
        }
        if self.rate.rpm == 0 || self.rate.tpm == 0 {
            return Err(Error::Config("rate.rpm and rate.tpm must be > 0".into()));
        }
        if self.index_cache.size == 0 {
            return Err(Error::Config("index_cache.size must be >= 1".into()));
        }
        let t = &self.confidence.thresholds;
        if !(t.low < t.medium && t.medium < t.high && t.high <= 1.0 && t.low > 0.0) {
            return Err(Error::Config(
                "confidence.thresholds must satisfy 0 < low < medium < high <= 1".into(),
            ));
        }
        if self.embedding.dims == 0 {
            return Err(Error::Config("embedding.dims must be > 0".into()));
        }
        match self.embedding.provider.as_str() {
            "null" | "http" => {}
            other => {
                return Err(Error::Config(format!(
                    "unknown embedding provider: '{}' (null or http)",
                    other
                )))
            }
        }
        if self.embedding.provider == "http"
            && (self.embedding.model.is_none() || self.embedding.api_base.is_none())
        {
            return Err(Error::Config(
                "embedding.model and embedding.api_base are required for the http provider".into(),
            ));
        }
        match self.llm.provider.as_str() {
            "null" | "http" => {}
            other => {
                return Err(Error::Config(format!(
                    "unknown llm provider: '{}' (null or http)",
                    other
                )))
            }
        }
        if self.llm.provider == "http" && (self.llm.model.is_none() || self.llm.api_base.is_none())
        {
            return Err(Error::Config(
                "llm.model and llm.api_base are required for the http provider".into(),
            ));
        }
        Ok(())
    }
}
