//! Configuration parsing and validation.
//!
//! Task Harness is configured via a TOML file (default: `config/taskh.toml`).
//! Only `[db]` is required; every other section falls back to defaults.
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/taskh.sqlite"
//!
//! [source]
//! provider = "todoist"
//! token_env = "TODOIST_API_TOKEN"
//!
//! [enrichment]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//! analysis_model = "gpt-4o-mini"
//!
//! [ingest]
//! max_retries = 3
//! workers = 4
//! ```
//!
//! Secrets never live in the file. The Todoist token is read from the
//! variable named by `source.token_env`; the OpenAI key from
//! `OPENAI_API_KEY`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
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

/// Where tasks come from.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_source_provider")]
    pub provider: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// JSON export read by the `file` provider.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            provider: default_source_provider(),
            base_url: default_base_url(),
            token_env: default_token_env(),
            page_size: default_page_size(),
            path: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_source_provider() -> String {
    "todoist".to_string()
}
fn default_base_url() -> String {
    "https://api.todoist.com/api/v1".to_string()
}
fn default_token_env() -> String {
    "TODOIST_API_TOKEN".to_string()
}
fn default_page_size() -> usize {
    200
}
fn default_timeout_secs() -> u64 {
    30
}

/// Embedding and analysis backend.
#[derive(Debug, Deserialize, Clone)]
pub struct EnrichmentConfig {
    #[serde(default = "default_enrichment_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Chat model used for task analysis. OpenAI only; unset disables
    /// analysis.
    #[serde(default)]
    pub analysis_model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            provider: default_enrichment_provider(),
            model: None,
            dims: None,
            analysis_model: None,
            url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_enrichment_provider() -> String {
    "hash".to_string()
}

impl EnrichmentConfig {
    /// Embedding dimensionality, defaulting for the offline hash provider.
    pub fn dims_or_default(&self) -> usize {
        self.dims.unwrap_or(256)
    }
}

/// Retry, timeout, and concurrency knobs for ingestion runs.
#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            workers: default_workers(),
            call_timeout_secs: default_call_timeout_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_workers() -> usize {
    4
}
fn default_call_timeout_secs() -> u64 {
    60
}
fn default_fetch_timeout_secs() -> u64 {
    120
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
    "127.0.0.1:7340".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

/// Parse a config from TOML text and validate it.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

fn validate(config: &Config) -> Result<()> {
    match config.source.provider.as_str() {
        "todoist" => {
            if config.source.page_size == 0 {
                anyhow::bail!("source.page_size must be > 0");
            }
        }
        "file" => {
            if config.source.path.is_none() {
                anyhow::bail!("source.path must be specified when provider is 'file'");
            }
        }
        other => anyhow::bail!(
            "Unknown source provider: '{}'. Must be todoist or file.",
            other
        ),
    }

    let enrichment = &config.enrichment;
    match enrichment.provider.as_str() {
        "openai" | "ollama" => {
            if enrichment.dims.is_none() || enrichment.dims == Some(0) {
                anyhow::bail!(
                    "enrichment.dims must be > 0 when provider is '{}'",
                    enrichment.provider
                );
            }
            if enrichment.model.is_none() {
                anyhow::bail!(
                    "enrichment.model must be specified when provider is '{}'",
                    enrichment.provider
                );
            }
        }
        "hash" => {
            if enrichment.dims == Some(0) {
                anyhow::bail!("enrichment.dims must be > 0");
            }
        }
        other => anyhow::bail!(
            "Unknown enrichment provider: '{}'. Must be openai, ollama, or hash.",
            other
        ),
    }

    if config.ingest.workers == 0 {
        anyhow::bail!("ingest.workers must be >= 1");
    }
    if config.ingest.backoff_base_ms > config.ingest.backoff_max_ms {
        anyhow::bail!("ingest.backoff_base_ms must be <= ingest.backoff_max_ms");
    }
    if config.ingest.call_timeout_secs == 0 || config.ingest.fetch_timeout_secs == 0 {
        anyhow::bail!("ingest timeouts must be > 0");
    }

    match config.logging.format.as_str() {
        "pretty" | "json" => {}
        other => anyhow::bail!(
            "Unknown logging format: '{}'. Must be pretty or json.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse_config("[db]\npath = \"./data/taskh.sqlite\"\n").unwrap();
        assert_eq!(config.source.provider, "todoist");
        assert_eq!(config.source.base_url, "https://api.todoist.com/api/v1");
        assert_eq!(config.source.page_size, 200);
        assert_eq!(config.enrichment.provider, "hash");
        assert_eq!(config.enrichment.dims_or_default(), 256);
        assert_eq!(config.ingest.max_retries, 3);
        assert_eq!(config.ingest.workers, 4);
        assert_eq!(config.server.bind, "127.0.0.1:7340");
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_file_source_requires_path() {
        let err = parse_config("[db]\npath = \"x\"\n[source]\nprovider = \"file\"\n").unwrap_err();
        assert!(err.to_string().contains("source.path"));
    }

    #[test]
    fn test_network_provider_requires_model_and_dims() {
        let toml = "[db]\npath = \"x\"\n[enrichment]\nprovider = \"openai\"\ndims = 1536\n";
        let err = parse_config(toml).unwrap_err();
        assert!(err.to_string().contains("enrichment.model"));

        let toml = "[db]\npath = \"x\"\n[enrichment]\nprovider = \"ollama\"\nmodel = \"nomic\"\n";
        let err = parse_config(toml).unwrap_err();
        assert!(err.to_string().contains("enrichment.dims"));
    }

    #[test]
    fn test_rejects_unknown_providers_and_zero_workers() {
        assert!(parse_config("[db]\npath = \"x\"\n[source]\nprovider = \"jira\"\n").is_err());
        assert!(parse_config("[db]\npath = \"x\"\n[enrichment]\nprovider = \"local\"\n").is_err());
        assert!(parse_config("[db]\npath = \"x\"\n[ingest]\nworkers = 0\n").is_err());
        assert!(parse_config("[db]\npath = \"x\"\n[logging]\nformat = \"xml\"\n").is_err());
    }
}
