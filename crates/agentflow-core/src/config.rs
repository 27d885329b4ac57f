use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Top-level agentflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Used when a flow does not set `retry_on_failure`.
    #[serde(default)]
    pub default_retry_on_failure: bool,
    /// Used when a flow does not set `retry_count`.
    #[serde(default)]
    pub default_retry_count: u32,
    /// Length of one backoff unit; attempt `k` waits `2^k` units.
    #[serde(default = "default_backoff_unit_ms")]
    pub backoff_unit_ms: u64,
    /// Maximum dispatches of a single node within one execution.
    #[serde(default = "default_max_node_visits")]
    pub max_node_visits: usize,
    /// Reject cyclic graphs when they are loaded.
    #[serde(default)]
    pub reject_cycles: bool,
    /// Timeout for flows that do not declare one (0 = unlimited).
    #[serde(default)]
    pub default_timeout_secs: u64,
    #[serde(default = "default_rule_entity_type")]
    pub rule_entity_type: String,
    #[serde(default = "default_rule_trigger")]
    pub rule_trigger: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_retry_on_failure: false,
            default_retry_count: 0,
            backoff_unit_ms: default_backoff_unit_ms(),
            max_node_visits: default_max_node_visits(),
            reject_cycles: false,
            default_timeout_secs: 0,
            rule_entity_type: default_rule_entity_type(),
            rule_trigger: default_rule_trigger(),
        }
    }
}

impl EngineConfig {
    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_ms)
    }
}

fn default_backoff_unit_ms() -> u64 { 1000 }
fn default_max_node_visits() -> usize { 5 }
fn default_rule_entity_type() -> String { "agentic_flow".to_string() }
fn default_rule_trigger() -> String { "flow_started".to_string() }

/// Which `FlowStore` backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// SQLite database file. Supports a leading `~/`.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

impl StoreConfig {
    pub fn resolved_path(&self) -> PathBuf {
        expand_home(&self.path)
    }
}

fn default_store_path() -> String { "~/.agentflow/agentflow.db".to_string() }

/// Tracing and JSONL run-log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Write per-execution JSONL run logs.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_dir: default_log_dir(),
            filter: default_log_filter(),
        }
    }
}

impl LogConfig {
    pub fn resolved_log_dir(&self) -> PathBuf {
        expand_home(&self.log_dir)
    }
}

fn default_log_dir() -> String { "~/.agentflow/logs".to_string() }
fn default_log_filter() -> String { "agentflow=info,warn".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.engine.max_node_visits == 0 {
            return Err(FlowError::Config(
                "engine.max_node_visits must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
