//! Configuration loading.
//!
//! codesync reads one TOML file (default `./config/codesync.toml`). Secrets
//! never live in the file; it names the environment variables that hold them.
//!
//! ```toml
//! [db]
//! path = "./data/codesync.sqlite"
//!
//! [server]
//! bind = "127.0.0.1:7341"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [index]
//! provider = "pinecone"
//! name = "codesync"
//!
//! [[repositories]]
//! id = "acme-api"
//! kind = "github"
//! full_name = "acme/api"
//! default_branch = "main"
//! webhook_secret_env = "ACME_API_WEBHOOK_SECRET"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use codesync_core::chunk::ChunkerConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Externally reachable base URL, used when registering webhooks.
    #[serde(default)]
    pub public_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            public_url: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chunk_lines")]
    pub max_chunk_lines: usize,
    #[serde(default = "default_window_lines")]
    pub window_lines: usize,
    #[serde(default = "default_overlap_lines")]
    pub overlap_lines: usize,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_lines: default_max_chunk_lines(),
            window_lines: default_window_lines(),
            overlap_lines: default_overlap_lines(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

impl ChunkingConfig {
    pub fn chunker_config(&self) -> ChunkerConfig {
        ChunkerConfig {
            max_chunk_lines: self.max_chunk_lines,
            window_lines: self.window_lines,
            overlap_lines: self.overlap_lines,
            max_file_bytes: self.max_file_bytes,
        }
    }
}

fn default_max_chunk_lines() -> usize {
    150
}
fn default_window_lines() -> usize {
    60
}
fn default_overlap_lines() -> usize {
    10
}
fn default_max_file_bytes() -> usize {
    1_000_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (Ollama, or an OpenAI-compatible gateway).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Total attempts per batch, first try included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Batches in flight at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            concurrency: default_concurrency(),
            max_input_chars: default_max_input_chars(),
            timeout_secs: default_timeout_secs(),
            api_key_env: default_openai_key_env(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    1000
}
fn default_concurrency() -> usize {
    2
}
fn default_max_input_chars() -> usize {
    8000
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// `memory` or `pinecone`.
    #[serde(default = "default_index_provider")]
    pub provider: String,
    #[serde(default = "default_index_name")]
    pub name: String,
    #[serde(default = "default_metric")]
    pub metric: String,
    #[serde(default = "default_cloud")]
    pub cloud: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_control_url")]
    pub control_url: String,
    #[serde(default = "default_pinecone_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_upsert_batch_size")]
    pub upsert_batch_size: usize,
    #[serde(default = "default_upsert_delay_ms")]
    pub upsert_delay_ms: u64,
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
    #[serde(default = "default_ready_poll_ms")]
    pub ready_poll_ms: u64,
    /// Page size for metadata-only id resolution queries.
    #[serde(default = "default_query_top_k")]
    pub query_top_k: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            provider: default_index_provider(),
            name: default_index_name(),
            metric: default_metric(),
            cloud: default_cloud(),
            region: default_region(),
            control_url: default_control_url(),
            api_key_env: default_pinecone_key_env(),
            upsert_batch_size: default_upsert_batch_size(),
            upsert_delay_ms: default_upsert_delay_ms(),
            ready_timeout_secs: default_ready_timeout_secs(),
            ready_poll_ms: default_ready_poll_ms(),
            query_top_k: default_query_top_k(),
        }
    }
}

fn default_index_provider() -> String {
    "memory".to_string()
}
fn default_index_name() -> String {
    "codesync".to_string()
}
fn default_metric() -> String {
    "cosine".to_string()
}
fn default_cloud() -> String {
    "aws".to_string()
}
fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_control_url() -> String {
    "https://api.pinecone.io".to_string()
}
fn default_pinecone_key_env() -> String {
    "PINECONE_API_KEY".to_string()
}
fn default_upsert_batch_size() -> usize {
    100
}
fn default_upsert_delay_ms() -> u64 {
    100
}
fn default_ready_timeout_secs() -> u64 {
    60
}
fn default_ready_poll_ms() -> u64 {
    1000
}
fn default_query_top_k() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Seconds a finished job stays pollable.
    #[serde(default = "default_job_retention_secs")]
    pub job_retention_secs: u64,
    #[serde(default = "default_janitor_interval_secs")]
    pub janitor_interval_secs: u64,
    /// Blob downloads in flight at once.
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            job_retention_secs: default_job_retention_secs(),
            janitor_interval_secs: default_janitor_interval_secs(),
            fetch_concurrency: default_fetch_concurrency(),
        }
    }
}

impl SyncConfig {
    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }
}

fn default_job_retention_secs() -> u64 {
    3600
}
fn default_janitor_interval_secs() -> u64 {
    60
}
fn default_fetch_concurrency() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct RepositoryConfig {
    /// Codebase id: scopes every vector and the sync record.
    pub id: String,
    /// `git` (local clone, driven through the git CLI) or `github` (REST API).
    pub kind: String,
    /// Working tree for `git` repositories.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// `owner/name` for `github` repositories.
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub webhook_secret_env: Option<String>,
    #[serde(default = "default_github_token_env")]
    pub token_env: String,
    #[serde(default = "default_github_api_url")]
    pub api_url: String,
}

fn default_branch() -> String {
    "main".to_string()
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}
fn default_github_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}
fn default_github_api_url() -> String {
    "https://api.github.com".to_string()
}

impl Config {
    pub fn repository(&self, id: &str) -> Option<&RepositoryConfig> {
        self.repositories.iter().find(|r| r.id == id)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate TOML config text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let chunking = &config.chunking;
    if chunking.max_chunk_lines == 0 || chunking.window_lines == 0 {
        bail!("chunking.max_chunk_lines and chunking.window_lines must be > 0");
    }
    if chunking.overlap_lines >= chunking.window_lines {
        bail!("chunking.overlap_lines must be smaller than chunking.window_lines");
    }

    let embedding = &config.embedding;
    match embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if embedding.is_enabled() {
        if embedding.dims.unwrap_or(0) == 0 {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                embedding.provider
            );
        }
        if embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                embedding.provider
            );
        }
    }
    if embedding.batch_size == 0 || embedding.concurrency == 0 || embedding.max_attempts == 0 {
        bail!("embedding.batch_size, embedding.concurrency and embedding.max_attempts must be > 0");
    }

    match config.index.provider.as_str() {
        "memory" | "pinecone" => {}
        other => bail!("Unknown index provider: '{}'. Must be memory or pinecone.", other),
    }
    if config.index.upsert_batch_size == 0 || config.index.query_top_k == 0 {
        bail!("index.upsert_batch_size and index.query_top_k must be > 0");
    }

    let mut seen = HashSet::new();
    for repo in &config.repositories {
        if repo.id.trim().is_empty() {
            bail!("repositories[].id must not be empty");
        }
        if !seen.insert(repo.id.as_str()) {
            bail!("duplicate repository id '{}'", repo.id);
        }
        match repo.kind.as_str() {
            "git" if repo.path.is_none() => {
                bail!("repository '{}': kind 'git' requires path", repo.id)
            }
            "github" if repo.full_name.is_none() => {
                bail!("repository '{}': kind 'github' requires full_name", repo.id)
            }
            "git" | "github" => {}
            other => bail!(
                "repository '{}': unknown kind '{}'. Must be git or github.",
                repo.id,
                other
            ),
        }
    }
    Ok(())
}
