//! Runtime configuration
//!
//! Read from the environment (a `.env` file is honoured). Every setting has
//! a default that points at a local LM Studio server.

use crate::error::OrchestrationError;
use crate::Result;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "http://localhost:1234/v1";
pub const DEFAULT_MODEL: &str = "qwen3-4b-mlx";
pub const DEFAULT_API_KEY: &str = "lm-studio";
pub const DEFAULT_DATASET_PATH: &str = "./data/train.json";
pub const DEFAULT_RESULTS_PATH: &str = "./logs/evaluation_results.json";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub dataset_path: PathBuf,
    /// `None` disables the per-turn timeout
    pub turn_timeout: Option<Duration>,
    pub results_path: PathBuf,
    pub api_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: DEFAULT_API_KEY.to_string(),
            temperature: 0.1,
            max_tokens: 2048,
            dataset_path: PathBuf::from(DEFAULT_DATASET_PATH),
            turn_timeout: Some(Duration::from_secs(120)),
            results_path: PathBuf::from(DEFAULT_RESULTS_PATH),
            api_port: 8080,
        }
    }
}

fn parse_var<T: FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| {
        OrchestrationError::ConfigError(format!("{} has invalid value '{}': {}", name, raw, e))
    })
}

impl Config {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any name → value lookup. Unset or blank values keep the
    /// default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Config::default();

        if let Some(v) = get("OPENAI_BASE_URL") {
            config.base_url = v;
        }
        if let Some(v) = get("OPENAI_MODEL_NAME") {
            config.model = v;
        }
        if let Some(v) = get("OPENAI_API_KEY") {
            config.api_key = v;
        }
        if let Some(v) = get("MODEL_TEMPERATURE") {
            config.temperature = parse_var("MODEL_TEMPERATURE", &v)?;
        }
        if let Some(v) = get("MODEL_MAX_TOKENS") {
            config.max_tokens = parse_var("MODEL_MAX_TOKENS", &v)?;
        }
        if let Some(v) = get("DATASET_PATH") {
            config.dataset_path = PathBuf::from(v);
        }
        if let Some(v) = get("TURN_TIMEOUT_SECS") {
            let secs: u64 = parse_var("TURN_TIMEOUT_SECS", &v)?;
            config.turn_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(v) = get("EVAL_RESULTS_PATH") {
            config.results_path = PathBuf::from(v);
        }
        if let Some(v) = get("PORT").or_else(|| get("API_PORT")) {
            config.api_port = parse_var("API_PORT", &v)?;
        }

        if !(0.0..=2.0).contains(&config.temperature) {
            return Err(OrchestrationError::ConfigError(format!(
                "MODEL_TEMPERATURE must be between 0 and 2, got {}",
                config.temperature
            )));
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.model, "qwen3-4b-mlx");
        assert_eq!(config.turn_timeout, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("OPENAI_BASE_URL", "http://models:8000/v1"),
            ("MODEL_TEMPERATURE", "0.7"),
            ("TURN_TIMEOUT_SECS", "0"),
            ("API_PORT", "9000"),
            ("DATASET_PATH", "  "),
        ]))
        .unwrap();

        assert_eq!(config.base_url, "http://models:8000/v1");
        assert_eq!(config.temperature, 0.7);
        assert_eq!(config.turn_timeout, None);
        assert_eq!(config.api_port, 9000);
        assert_eq!(config.dataset_path, PathBuf::from(DEFAULT_DATASET_PATH));
    }

    #[test]
    fn test_port_prefers_port_variable() {
        let config =
            Config::from_lookup(lookup(&[("PORT", "3000"), ("API_PORT", "9000")])).unwrap();
        assert_eq!(config.api_port, 3000);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            Config::from_lookup(lookup(&[("MODEL_MAX_TOKENS", "lots")])),
            Err(OrchestrationError::ConfigError(_))
        ));
        assert!(Config::from_lookup(lookup(&[("MODEL_TEMPERATURE", "5")])).is_err());
    }
}
