//! Settings loading
//!
//! YAML settings file with serde defaults, plus environment overrides for
//! the values that differ between deployments. `.env` loading happens in the
//! binary before `Settings::load` runs.

use crate::error::{QueryError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Connection timeout in seconds.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
    /// Inference timeout in seconds.
    #[serde(default = "default_inference_timeout")]
    pub inference_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("defaults are valid")
    }
}

impl LlmConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Hard cap on returned rows per query.
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Bounded query-result cache size (entries).
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    /// SQLite busy timeout in seconds.
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("defaults are valid")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_growth_rate")]
    pub growth_rate: f64,
    /// Overall per-request deadline in seconds; no retry starts after it.
    #[serde(default = "default_request_deadline")]
    pub request_deadline_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("defaults are valid")
    }
}

impl RetryConfig {
    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.request_deadline_secs)
    }

    pub fn strategy(&self) -> crate::retry::RetryStrategy {
        crate::retry::RetryStrategy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            growth_rate: self.growth_rate,
            jitter: true,
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_model() -> String {
    "gemma3:4b".to_string()
}
fn default_temperature() -> f64 {
    0.2
}
fn default_top_p() -> f64 {
    0.9
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_connection_timeout() -> u64 {
    10
}
fn default_inference_timeout() -> u64 {
    30
}
fn default_db_path() -> String {
    "./data/clinic.db".to_string()
}
fn default_max_results() -> usize {
    1000
}
fn default_cache_size() -> usize {
    100
}
fn default_query_timeout() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_growth_rate() -> f64 {
    2.0
}
fn default_request_deadline() -> u64 {
    120
}

impl Settings {
    /// Load settings: YAML file if present, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)?;
                let parsed: Settings = serde_yaml::from_str(&raw)
                    .map_err(|e| QueryError::Config(format!("invalid settings file: {}", e)))?;
                info!(path = %path.display(), "loaded settings file");
                parsed
            }
            Some(path) => {
                warn!(path = %path.display(), "settings file not found, using defaults");
                Settings::default()
            }
            None => Settings::default(),
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("CLINIQ_LLM_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Ok(model) = std::env::var("CLINIQ_LLM_MODEL") {
            self.llm.model = model;
        }
        if let Ok(path) = std::env::var("CLINIQ_DB_PATH") {
            self.database.path = path;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.llm.base_url, "http://localhost:11434");
        assert_eq!(settings.database.max_results, 1000);
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.retry.strategy().growth_rate, 2.0);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let raw = "llm:\n  model: llama3:8b-instruct\ndatabase:\n  max_results: 50\n";
        let settings: Settings = serde_yaml::from_str(raw).unwrap();
        assert_eq!(settings.llm.model, "llama3:8b-instruct");
        assert_eq!(settings.llm.base_url, "http://localhost:11434");
        assert_eq!(settings.database.max_results, 50);
        assert_eq!(settings.database.cache_size, 100);
    }
}
