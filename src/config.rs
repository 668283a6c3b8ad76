//! Configuration loading.
//!
//! Settings come from an optional TOML file, then `KB_*` environment
//! overrides, then CLI flags applied by the binary. Every section and field
//! has a default, so an empty file (or no file) is a valid configuration.
//! The resulting [`Config`] is loaded once and passed to each stage.
//!
//! ```toml
//! [store]
//! path = "data/kb.sqlite"
//!
//! [documents]
//! root = "docs"
//!
//! [chunking]
//! max_chars = 2000
//! overlap_chars = 200
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [generation]
//! provider = "openai"
//! model = "gpt-3.5-turbo"
//!
//! [retrieval]
//! top_k = 5
//! max_context_chars = 6000
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use knowledge_rag_core::chunk::ChunkingParams;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub documents: DocumentsConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/kb.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct DocumentsConfig {
    #[serde(default = "default_docs_root")]
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            root: default_docs_root(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_docs_root() -> PathBuf {
    PathBuf::from("docs")
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
    #[serde(default)]
    pub min_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap_chars: default_overlap_chars(),
            min_chars: 0,
        }
    }
}

fn default_max_chars() -> usize {
    2000
}
fn default_overlap_chars() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Base URL override (Ollama host, OpenAI-compatible gateway).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum embedding requests in flight across all workers.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dims: default_dims(),
            url: None,
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "openai".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_dims() -> usize {
    1536
}
fn default_batch_size() -> usize {
    64
}
fn default_concurrency() -> usize {
    4
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_base_ms() -> u64 {
    1000
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: default_generation_model(),
            url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

fn default_generation_provider() -> String {
    "openai".to_string()
}
fn default_generation_model() -> String {
    "gpt-3.5-turbo".to_string()
}
fn default_temperature() -> f32 {
    0.3
}
fn default_max_tokens() -> u32 {
    1000
}
fn default_generation_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: i64,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_context_chars: default_max_context_chars(),
        }
    }
}

fn default_top_k() -> i64 {
    5
}
fn default_max_context_chars() -> usize {
    6000
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Documents processed concurrently.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Remove records of documents no longer on disk.
    #[serde(default = "default_prune_missing")]
    pub prune_missing: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            prune_missing: true,
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_prune_missing() -> bool {
    true
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
    "0.0.0.0:8000".to_string()
}

impl Config {
    pub fn chunking_params(&self) -> ChunkingParams {
        ChunkingParams {
            max_chars: self.chunking.max_chars,
            overlap_chars: self.chunking.overlap_chars,
            min_chars: self.chunking.min_chars,
        }
    }

    /// Apply `KB_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("KB_DOCS_DIR") {
            self.documents.root = PathBuf::from(v);
        }
        if let Some(v) = lookup("KB_STORE_PATH") {
            self.store.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("KB_EMBEDDING_MODEL") {
            self.embedding.model = v;
        }
        if let Some(v) = lookup("KB_GENERATION_MODEL") {
            self.generation.model = v;
        }
        if let Some(v) = lookup("KB_TOP_K") {
            self.retrieval.top_k = parse_var("KB_TOP_K", &v)?;
        }
        if let Some(v) = lookup("KB_MAX_CONTEXT_CHARS") {
            self.retrieval.max_context_chars = parse_var("KB_MAX_CONTEXT_CHARS", &v)?;
        }
        if let Some(v) = lookup("KB_MAX_CHUNK_CHARS") {
            self.chunking.max_chars = parse_var("KB_MAX_CHUNK_CHARS", &v)?;
        }
        if let Some(v) = lookup("KB_CHUNK_OVERLAP_CHARS") {
            self.chunking.overlap_chars = parse_var("KB_CHUNK_OVERLAP_CHARS", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.chunking_params()
            .validate()
            .map_err(|e| anyhow::anyhow!("{}", e))?;

        match self.embedding.provider.as_str() {
            "openai" | "ollama" | "local" | "hash" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be openai, ollama, local, or hash.",
                other
            ),
        }
        if self.embedding.dims == 0 {
            bail!("embedding.dims must be > 0");
        }
        if self.embedding.model.trim().is_empty() {
            bail!("embedding.model must not be empty");
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }
        if self.embedding.concurrency == 0 {
            bail!("embedding.concurrency must be > 0");
        }

        match self.generation.provider.as_str() {
            "openai" | "ollama" | "extractive" => {}
            other => bail!(
                "Unknown generation provider: '{}'. Must be openai, ollama, or extractive.",
                other
            ),
        }
        if !(0.0..=2.0).contains(&self.generation.temperature) {
            bail!("generation.temperature must be in [0.0, 2.0]");
        }

        if self.retrieval.top_k < 1 {
            bail!("retrieval.top_k must be >= 1");
        }
        if self.retrieval.max_context_chars == 0 {
            bail!("retrieval.max_context_chars must be > 0");
        }
        if self.ingest.workers == 0 {
            bail!("ingest.workers must be >= 1");
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("{} has an invalid value: '{}'", name, value))
}

/// Parse and validate a config file, applying environment overrides.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.apply_overrides(|k| std::env::var(k).ok())?;
    config.validate()?;
    Ok(config)
}

/// Load `path` if it exists, otherwise fall back to defaults.
///
/// A missing file is only an error when the caller named it explicitly.
pub fn load_or_default(path: &Path, explicit: bool) -> Result<Config> {
    if explicit || path.exists() {
        return load_config(path);
    }
    let mut config = Config::default();
    config.apply_overrides(|k| std::env::var(k).ok())?;
    config.validate()?;
    Ok(config)
}
