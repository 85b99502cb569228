//! Static configuration: engines, domains, concurrency limits, and model
//! locations. Loaded from YAML/TOML at startup; never mutated afterward
//! except through the in-memory overrides `PolicyEngine` derives from it.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::DomainCategory;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub name: String,
    pub qps: f64,
    pub weight: f64,
    pub categories: Vec<String>,
    pub daily_limit: u32,
    pub concurrency: u32,
    pub pagination_type: PaginationType,
    #[serde(default)]
    pub operator_mapping: HashMap<String, OperatorSupport>,
    /// Eligible for the "last-mile" set PolicyEngine offers once a task's
    /// harvest rate reaches 90%, gated by `daily_limit` as a separate
    /// per-engine counter rather than the general candidate-selection path.
    #[serde(default)]
    pub last_mile: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationType {
    Offset,
    Cursor,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorSupport {
    Native,
    /// The operator is rewritten to an engine-specific equivalent.
    Transformed,
    /// The operator has no equivalent on this engine and is dropped.
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    pub domain: String,
    pub category: DomainCategory,
    pub qps: f64,
    pub max_requests_per_day: u32,
    pub max_pages_per_day: u32,
    pub tor_usage_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub decrease_step: u32,
    #[serde(with = "humantime_serde")]
    pub recovery_stable: std::time::Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            decrease_step: 1,
            recovery_stable: std::time::Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub num_workers: u32,
    pub max_tabs: u32,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            max_tabs: 8,
            backoff: BackoffConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub llm_path: Option<String>,
    pub embedding_model: Option<String>,
    pub reranker_model: Option<String>,
    pub nli_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorConfig {
    pub max_usage_ratio: f64,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            max_usage_ratio: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "lyra.sqlite3".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Compact,
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engines: Vec<EngineConfig>,
    #[serde(default)]
    pub domains: Vec<DomainConfig>,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub tor: TorConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engines: Vec::new(),
            domains: Vec::new(),
            concurrency: ConcurrencyConfig::default(),
            models: ModelsConfig::default(),
            tor: TorConfig::default(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path.display().to_string()))?;
        Self::parse(&raw, path.extension().and_then(|e| e.to_str()).unwrap_or("yaml"))
    }

    fn parse(raw: &str, ext: &str) -> Result<Self, ConfigError> {
        match ext {
            "json" => serde_json::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string())),
            "toml" => toml_from_str(raw),
            _ => serde_yaml::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string())),
        }
    }

    pub fn engine(&self, name: &str) -> Option<&EngineConfig> {
        self.engines.iter().find(|e| e.name == name)
    }

    pub fn domain(&self, domain: &str) -> Option<&DomainConfig> {
        self.domains.iter().find(|d| d.domain == domain)
    }
}

/// Minimal TOML bridge: the engine is shipped with a YAML-first config
/// story, but accepts TOML for parity with the CLI's own config file.
fn toml_from_str(raw: &str) -> Result<Config, ConfigError> {
    let value: toml::Value = raw.parse().map_err(|e: toml::de::Error| ConfigError::ParseError(e.to_string()))?;
    value.try_into().map_err(|e: toml::de::Error| ConfigError::ParseError(e.to_string()))
}
