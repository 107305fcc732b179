//! Startup configuration loaded from `hal-shell.toml`.
//!
//! Read once at process start. Unknown keys are reported with a warning
//! and ignored; malformed values are a [`ShellError::Configuration`].
//!
//! ```toml
//! default_backend = "local"
//! default_shots = 1024
//! # Omit to use the target's queue-class default (60 s interactive, 30 min batch).
//! timeout_secs = 60
//! max_in_flight = 8
//!
//! [retry]
//! max_attempts = 4
//! initial_backoff_ms = 100
//! max_backoff_ms = 5000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ShellError, ShellResult};

/// Default file name searched for in the working directory.
pub const CONFIG_FILE: &str = "hal-shell.toml";

const TOP_LEVEL_KEYS: &[&str] = &[
    "default_backend",
    "default_shots",
    "timeout_secs",
    "max_in_flight",
    "retry",
];
const RETRY_KEYS: &[&str] = &["max_attempts", "initial_backoff_ms", "max_backoff_ms"];

/// Shell-wide defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Backend used when the session has not picked one.
    #[serde(default)]
    pub default_backend: Option<String>,
    #[serde(default = "default_shots")]
    pub default_shots: u32,
    /// Per-request timeout in seconds. When unset each request uses its
    /// target's queue-class default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Benchmark in-flight concurrency ceiling.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            default_backend: None,
            default_shots: default_shots(),
            timeout_secs: None,
            max_in_flight: default_max_in_flight(),
            retry: RetryConfig::default(),
        }
    }
}

/// Retry settings for transient backend failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_shots() -> u32 {
    1024
}
fn default_max_in_flight() -> usize {
    8
}
fn default_max_attempts() -> u32 {
    4
}
fn default_initial_backoff_ms() -> u64 {
    100
}
fn default_max_backoff_ms() -> u64 {
    5000
}

impl ShellConfig {
    /// Parse configuration from TOML text.
    pub fn from_toml_str(text: &str) -> ShellResult<Self> {
        let table: toml::Table = text
            .parse()
            .map_err(|e: toml::de::Error| ShellError::Configuration(e.to_string()))?;

        for key in unknown_keys(&table) {
            warn!(key = %key, "ignoring unrecognized configuration key");
        }

        let config: ShellConfig = toml::from_str(text)
            .map_err(|e: toml::de::Error| ShellError::Configuration(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Load configuration from a file.
    pub fn load(path: &Path) -> ShellResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ShellError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let config = Self::from_toml_str(&text)?;
        debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Load `path` if given, else `hal-shell.toml` in `dir` if present, else defaults.
    pub fn discover(path: Option<&Path>, dir: &Path) -> ShellResult<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        let candidate = dir.join(CONFIG_FILE);
        if candidate.is_file() {
            Self::load(&candidate)
        } else {
            Ok(Self::default())
        }
    }

    fn check(&self) -> ShellResult<()> {
        if self.default_shots == 0 {
            return Err(ShellError::Configuration("default_shots must be at least 1".into()));
        }
        if self.timeout_secs == Some(0) {
            return Err(ShellError::Configuration("timeout_secs must be at least 1".into()));
        }
        if self.max_in_flight == 0 {
            return Err(ShellError::Configuration("max_in_flight must be at least 1".into()));
        }
        Ok(())
    }

    /// Configured per-request timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

fn unknown_keys(table: &toml::Table) -> Vec<String> {
    let mut unknown: Vec<String> = table
        .keys()
        .filter(|k| !TOP_LEVEL_KEYS.contains(&k.as_str()))
        .cloned()
        .collect();
    if let Some(toml::Value::Table(retry)) = table.get("retry") {
        unknown.extend(
            retry
                .keys()
                .filter(|k| !RETRY_KEYS.contains(&k.as_str()))
                .map(|k| format!("retry.{k}")),
        );
    }
    unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ShellConfig::default();
        assert_eq!(config.default_shots, 1024);
        assert_eq!(config.timeout(), None);
        assert_eq!(config.retry.max_attempts, 4);
        assert!(config.default_backend.is_none());
    }

    #[test]
    fn test_parse_config() {
        let config = ShellConfig::from_toml_str(
            r#"
            default_backend = "local"
            default_shots = 100
            timeout_secs = 5

            [retry]
            max_attempts = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.default_backend.as_deref(), Some("local"));
        assert_eq!(config.default_shots, 100);
        assert_eq!(config.timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.max_in_flight, 8);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.max_backoff_ms, 5000);
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let text = r#"
            default_shots = 10
            colour = "blue"

            [retry]
            jitter = true
        "#;
        let table: toml::Table = text.parse().unwrap();
        assert_eq!(unknown_keys(&table), vec!["colour".to_string(), "retry.jitter".to_string()]);

        let config = ShellConfig::from_toml_str(text).unwrap();
        assert_eq!(config.default_shots, 10);
    }

    #[test]
    fn test_bad_values_are_errors() {
        assert!(matches!(
            ShellConfig::from_toml_str("default_shots = \"many\""),
            Err(ShellError::Configuration(_))
        ));
        assert!(ShellConfig::from_toml_str("timeout_secs = 0").is_err());
    }

    #[test]
    fn test_discover() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            ShellConfig::discover(None, dir.path()).unwrap(),
            ShellConfig::default()
        );

        std::fs::write(dir.path().join(CONFIG_FILE), "default_shots = 7\n").unwrap();
        assert_eq!(ShellConfig::discover(None, dir.path()).unwrap().default_shots, 7);
    }
}
