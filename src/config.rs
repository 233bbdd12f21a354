use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::backoff::DEFAULT_MAX_BACKOFF;
use crate::dispatcher::{DispatcherOptions, DEFAULT_MAX_RESPONSE_SIZE};
use crate::error::ConfigError;
use crate::ip_rules::{IpRules, IpRulesConfig};
use crate::processor::DEFAULT_HTTP_TIMEOUT;
use crate::telemetry::LogConfig;
use crate::worker::WorkerConfig;

pub const ENV_PROXY_URL: &str = "WEBHOOK_PROXY_URL";
pub const ENV_WORKER_CONCURRENCY: &str = "WEBHOOK_WORKER_CONCURRENCY";
pub const ENV_MAX_RESPONSE_SIZE: &str = "WEBHOOK_MAX_RESPONSE_SIZE";
pub const ENV_LOG_LEVEL: &str = "WEBHOOK_LOG_LEVEL";
pub const ENV_LOG_JSON: &str = "WEBHOOK_LOG_JSON";

/// Process-wide settings.
///
/// Loaded from a JSON file, then overridden from the environment. Every
/// section and field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dispatcher: DispatcherConfig,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// `"nil"` or empty disables the proxy.
    pub proxy_url: Option<String>,
    pub ip_rules: IpRulesConfig,
    pub max_response_size: usize,
    pub user_agent: Option<String>,
    pub default_timeout_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            proxy_url: None,
            ip_rules: IpRulesConfig::default(),
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
            user_agent: None,
            default_timeout_secs: DEFAULT_HTTP_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Cap for exponential retry delays.
    pub max_backoff_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_backoff_secs: DEFAULT_MAX_BACKOFF.as_secs(),
        }
    }
}

impl Config {
    /// Read `path`, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config = Self::from_json(&raw)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, keyed by the `WEBHOOK_*` names.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(proxy) = lookup(ENV_PROXY_URL) {
            self.dispatcher.proxy_url = Some(proxy);
        }
        if let Some(raw) = lookup(ENV_WORKER_CONCURRENCY) {
            self.worker.concurrency = parse_env("worker.concurrency", &raw)?;
        }
        if let Some(raw) = lookup(ENV_MAX_RESPONSE_SIZE) {
            self.dispatcher.max_response_size = parse_env("dispatcher.max_response_size", &raw)?;
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.log.level = level;
        }
        if let Some(raw) = lookup(ENV_LOG_JSON) {
            self.log.json = matches!(
                raw.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes"
            );
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "worker.concurrency",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.dispatcher.max_response_size == 0 {
            return Err(ConfigError::Invalid {
                field: "dispatcher.max_response_size",
                reason: "must be at least 1".to_string(),
            });
        }
        IpRules::from_config(&self.dispatcher.ip_rules).map_err(|e| ConfigError::Invalid {
            field: "dispatcher.ip_rules",
            reason: e.to_string(),
        })?;
        Ok(())
    }

    pub fn dispatcher_options(&self) -> DispatcherOptions {
        let mut options = DispatcherOptions::default()
            .with_ip_rules(self.dispatcher.ip_rules.clone())
            .with_max_response_size(self.dispatcher.max_response_size);
        if let Some(proxy) = &self.dispatcher.proxy_url {
            options = options.with_proxy(proxy.clone());
        }
        if let Some(user_agent) = &self.dispatcher.user_agent {
            options = options.with_user_agent(user_agent.clone());
        }
        options
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatcher.default_timeout_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.retry.max_backoff_secs)
    }
}

fn parse_env<T: std::str::FromStr>(field: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        field,
        reason: format!("{raw:?}: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_document_yields_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.dispatcher.max_response_size, DEFAULT_MAX_RESPONSE_SIZE);
        assert_eq!(config.default_timeout(), DEFAULT_HTTP_TIMEOUT);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_json(
            r#"{
                "dispatcher": { "proxy_url": "http://proxy:3128", "ip_rules": { "deny": ["10.0.0.0/8"] } },
                "worker": { "concurrency": 3 },
                "log": { "json": true }
            }"#,
        )
        .unwrap();

        assert_eq!(config.worker.concurrency, 3);
        assert_eq!(config.worker.max_queue_retries, WorkerConfig::default().max_queue_retries);
        assert!(config.log.json);
        assert_eq!(config.log.level, LogConfig::default().level);

        let options = config.dispatcher_options();
        assert_eq!(options.proxy_url.as_deref(), Some("http://proxy:3128"));
        assert_eq!(options.ip_rules.deny, vec!["10.0.0.0/8".to_string()]);
    }

    #[test]
    fn environment_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            (ENV_PROXY_URL, "nil"),
            (ENV_WORKER_CONCURRENCY, "8"),
            (ENV_MAX_RESPONSE_SIZE, "1024"),
            (ENV_LOG_LEVEL, "debug"),
            (ENV_LOG_JSON, "true"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.dispatcher.proxy_url.as_deref(), Some("nil"));
        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.dispatcher.max_response_size, 1024);
        assert_eq!(config.log.level, "debug");
        assert!(config.log.json);
    }

    #[test]
    fn bad_override_names_the_field() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(|key| (key == ENV_WORKER_CONCURRENCY).then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "worker.concurrency", .. }));
    }

    #[test]
    fn invalid_ip_rules_fail_validation() {
        let config = Config::from_json(r#"{ "dispatcher": { "ip_rules": { "allow": ["nope"] } } }"#)
            .unwrap();
        assert!(config.validate().is_err());
    }
}
