//! Core configuration.
//!
//! Read from a camelCase JSON file; every field has a default so a partial
//! (or missing) file is fine:
//!
//! ```json
//! {
//!   "permissionTimeoutSecs": 300,
//!   "timeoutPolicy": "deny",
//!   "agent": { "binary": "/usr/local/bin/claude", "logDir": "/var/log/switchboard" }
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::permission::{BrokerSettings, RulePrecedence, TimeoutPolicy, DEFAULT_PRECEDENCE};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    pub permission_timeout_secs: u64,
    /// Timeout for non-permission requests (stop, info, ...).
    pub notification_timeout_secs: u64,
    pub timeout_policy: TimeoutPolicy,
    pub rule_precedence: RulePrecedence,
    pub max_notifications: usize,
    /// Default bound for `wait_for_release`.
    pub release_wait_secs: u64,
    pub agent: AgentConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            permission_timeout_secs: 300,
            notification_timeout_secs: 120,
            timeout_policy: TimeoutPolicy::Deny,
            rule_precedence: DEFAULT_PRECEDENCE,
            max_notifications: 500,
            release_wait_secs: 600,
            agent: AgentConfig::default(),
        }
    }
}

impl CoreConfig {
    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            permission_timeout: Duration::from_secs(self.permission_timeout_secs),
            notification_timeout: Duration::from_secs(self.notification_timeout_secs),
            timeout_policy: self.timeout_policy,
        }
    }

    pub fn release_wait(&self) -> Duration {
        Duration::from_secs(self.release_wait_secs)
    }
}

/// How the CLI agent is launched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    pub binary: String,
    /// Appended after the generated arguments.
    pub extra_args: Vec<String>,
    /// Replaces `$SHELL -l -c`.
    pub shell_prefix: Option<String>,
    /// Flag carrying a task's reasoning level. Reasoning is dropped when unset.
    pub reasoning_flag: Option<String>,
    /// Per-task transcripts are written here when set.
    pub log_dir: Option<PathBuf>,
    /// Time between SIGINT and kill on cancellation.
    pub cancel_grace_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            extra_args: Vec::new(),
            shell_prefix: None,
            reasoning_flag: None,
            log_dir: None,
            cancel_grace_ms: 3000,
        }
    }
}

/// Load the config file, or defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<CoreConfig, ConfigError> {
    if !path.exists() {
        log::info!("No config at {}, using defaults", path.display());
        return Ok(CoreConfig::default());
    }

    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = load_config(&dir.path().join("switchboard.json")).unwrap();
        assert_eq!(config, CoreConfig::default());
        assert_eq!(config.agent.binary, "claude");
        assert_eq!(config.timeout_policy, TimeoutPolicy::Deny);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("switchboard.json");
        fs::write(
            &path,
            r#"{"permissionTimeoutSecs": 30, "rulePrecedence": "denyFirst", "agent": {"reasoningFlag": "--effort"}}"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.permission_timeout_secs, 30);
        assert_eq!(config.notification_timeout_secs, 120);
        assert_eq!(config.rule_precedence, RulePrecedence::DenyFirst);
        assert_eq!(config.agent.reasoning_flag.as_deref(), Some("--effort"));
        assert_eq!(config.agent.binary, "claude");
        assert_eq!(config.agent.cancel_grace_ms, 3000);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("switchboard.json");
        fs::write(&path, "{ not json").unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("switchboard.json"));
    }

    #[test]
    fn broker_settings_follow_config() {
        let config = CoreConfig {
            permission_timeout_secs: 10,
            notification_timeout_secs: 5,
            timeout_policy: TimeoutPolicy::Allow,
            ..CoreConfig::default()
        };
        let settings = config.broker_settings();
        assert_eq!(settings.permission_timeout, Duration::from_secs(10));
        assert_eq!(settings.notification_timeout, Duration::from_secs(5));
        assert_eq!(settings.timeout_policy, TimeoutPolicy::Allow);
    }
}
