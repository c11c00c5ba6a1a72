//! Configuration module for askbase.
//!
//! Handles loading, validating, and providing default configuration values.
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "config.json";

// ── Default value functions ──────────────────────────────────────────

fn default_db_path() -> String {
    "./knowledge.db".to_string()
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}

fn default_embedding_model() -> String {
    "openai/text-embedding-3-small".to_string()
}

fn default_dimensions() -> usize {
    1536
}

fn default_embedding_timeout() -> u64 {
    30
}

fn default_generation_model() -> String {
    "openai/gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_generation_timeout() -> u64 {
    60
}

fn default_stream_idle_timeout() -> u64 {
    30
}

fn default_top_k() -> usize {
    3
}

/// Upper bound on `topK` any request may ask for.
pub const TOP_K_LIMIT: usize = 10;

fn default_max_top_k() -> usize {
    TOP_K_LIMIT
}

fn default_history_turns() -> usize {
    5
}

fn default_store_timeout() -> u64 {
    10
}

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}

// ── Config structs ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Vector length produced by `model`. Fixed for the lifetime of a store.
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_generation_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Upper bound for a blocking completion and for opening a stream.
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,

    /// Longest silence tolerated between two streamed fragments.
    #[serde(default = "default_stream_idle_timeout")]
    pub stream_idle_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,

    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,

    /// How many trailing conversation messages are forwarded to generation.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,

    #[serde(default = "default_store_timeout")]
    pub store_timeout_secs: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context_chars: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

// ── Default impls ────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            retrieval: RetrievalConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_embedding_model(),
            dimensions: default_dimensions(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_embedding_timeout(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_generation_model(),
            temperature: default_temperature(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_generation_timeout(),
            stream_idle_timeout_secs: default_stream_idle_timeout(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: default_top_k(),
            max_top_k: default_max_top_k(),
            history_turns: default_history_turns(),
            store_timeout_secs: default_store_timeout(),
            max_context_chars: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

// ── Config implementation ────────────────────────────────────────────

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// If `config_path` is empty, defaults to `"config.json"`.
    /// If the file does not exist, returns a default config and, for the
    /// default path only, writes a template next to the binary's cwd.
    pub fn load(config_path: &str) -> Result<Self> {
        let path = if config_path.is_empty() {
            DEFAULT_CONFIG_PATH
        } else {
            config_path
        };

        if !Path::new(path).exists() {
            info!("{path} not found, using defaults");
            let cfg = Self::default();

            if path == DEFAULT_CONFIG_PATH {
                match cfg.save(path) {
                    Ok(()) => info!("Generated config template: {path}"),
                    Err(e) => warn!("Failed to generate config template: {e}"),
                }
            }

            return Ok(cfg);
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;

        let cfg: Config = match serde_json::from_str(&data) {
            Ok(c) => c,
            Err(e) => {
                warn!("Invalid JSON in {path}: {e}");
                warn!("Using default configuration");
                return Ok(Self::default());
            }
        };

        info!("Loaded configuration from {path}");
        Ok(cfg)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &str) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to marshal config")?;
        std::fs::write(path, data).with_context(|| format!("failed to write config: {path}"))?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.db_path.is_empty(), "db_path must not be empty");
        anyhow::ensure!(
            self.embedding.dimensions > 0,
            "embedding.dimensions must be positive"
        );
        anyhow::ensure!(
            !self.embedding.base_url.is_empty(),
            "embedding.base_url must not be empty"
        );
        anyhow::ensure!(
            !self.generation.base_url.is_empty(),
            "generation.base_url must not be empty"
        );
        anyhow::ensure!(
            (0.0..=2.0).contains(&self.generation.temperature),
            "generation.temperature must be within 0.0..=2.0"
        );
        anyhow::ensure!(
            (1..=TOP_K_LIMIT).contains(&self.retrieval.max_top_k),
            "retrieval.max_top_k must be within 1..={TOP_K_LIMIT}"
        );
        anyhow::ensure!(
            (1..=self.retrieval.max_top_k).contains(&self.retrieval.default_top_k),
            "retrieval.default_top_k must be within 1..={}",
            self.retrieval.max_top_k
        );
        anyhow::ensure!(
            self.retrieval.history_turns > 0,
            "retrieval.history_turns must be positive"
        );
        anyhow::ensure!(
            self.embedding.timeout_secs > 0
                && self.generation.timeout_secs > 0
                && self.generation.stream_idle_timeout_secs > 0
                && self.retrieval.store_timeout_secs > 0,
            "timeouts must be positive"
        );
        Ok(())
    }
}

impl EmbeddingConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// API key read from the configured environment variable, if set.
    #[must_use]
    pub fn api_key(&self) -> Option<String> {
        read_key(&self.api_key_env)
    }
}

impl GenerationConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    #[must_use]
    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }

    #[must_use]
    pub fn api_key(&self) -> Option<String> {
        read_key(&self.api_key_env)
    }
}

impl RetrievalConfig {
    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }
}

fn read_key(var: &str) -> Option<String> {
    if var.is_empty() {
        return None;
    }
    std::env::var(var).ok().filter(|k| !k.trim().is_empty())
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.db_path, "./knowledge.db");
        assert_eq!(config.embedding.dimensions, 1536);
        assert_eq!(config.embedding.model, "openai/text-embedding-3-small");
        assert_eq!(config.generation.model, "openai/gpt-4o-mini");
        assert!((config.generation.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(config.retrieval.default_top_k, 3);
        assert_eq!(config.retrieval.max_top_k, 10);
        assert_eq!(config.retrieval.history_turns, 5);
        assert!(config.retrieval.max_context_chars.is_none());
    }

    #[test]
    fn test_load_from_json() {
        let json = r#"{"db_path": "./test.db", "retrieval": {"default_top_k": 5}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.db_path, "./test.db");
        assert_eq!(config.retrieval.default_top_k, 5);
        // Other fields should have defaults
        assert_eq!(config.retrieval.max_top_k, 10);
        assert_eq!(config.embedding.dimensions, 1536);
        assert_eq!(config.server.bind, "127.0.0.1:3000");
    }

    #[test]
    fn test_validate_ok() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_top_k_out_of_bounds() {
        let mut config = Config::default();
        config.retrieval.default_top_k = 11;
        assert!(config.validate().is_err());

        config.retrieval.default_top_k = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_max_top_k_capped() {
        let mut config = Config::default();
        config.retrieval.max_top_k = TOP_K_LIMIT;
        assert!(config.validate().is_ok());

        config.retrieval.max_top_k = 50;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_top_k"));

        config.retrieval.max_top_k = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bad_dimensions() {
        let mut config = Config::default();
        config.embedding.dimensions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bad_temperature() {
        let mut config = Config::default();
        config.generation.temperature = 3.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_timeout() {
        let mut config = Config::default();
        config.retrieval.store_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.retrieval.default_top_k, 3);
        // Templates are only generated for the default path
        assert!(!path.exists());
    }

    #[test]
    fn test_invalid_json_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.db_path, "./knowledge.db");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let path = path.to_str().unwrap();

        let mut config = Config::default();
        config.retrieval.max_context_chars = Some(4000);
        config.embedding.dimensions = 768;
        config.save(path).unwrap();

        let loaded = Config::load(path).unwrap();
        assert_eq!(loaded.retrieval.max_context_chars, Some(4000));
        assert_eq!(loaded.embedding.dimensions, 768);
    }

    #[test]
    fn test_empty_key_env_reads_nothing() {
        let mut config = EmbeddingConfig::default();
        config.api_key_env = String::new();
        assert!(config.api_key().is_none());
    }
}
