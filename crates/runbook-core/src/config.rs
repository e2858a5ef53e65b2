use crate::error::{Result, RunbookError};
use crate::registry::{Action, AuthConfig};
use crate::types::PermissionTier;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

impl ConfigWarning {
    fn warning(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Warning,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Error,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Operator
// ---------------------------------------------------------------------------

/// A caller allowed to talk to the coordinator, identified by a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    pub name: String,
    pub token: String,
    pub tier: PermissionTier,
}

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub actions: Vec<Action>,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Directory holding the run history database. History is in-memory when unset.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default = "default_watchdog_secs")]
    pub watchdog_secs: u64,
    #[serde(default = "default_replay_capacity")]
    pub replay_capacity: usize,
    #[serde(default = "default_observer_ttl_secs")]
    pub observer_ttl_secs: u64,
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
    #[serde(default)]
    pub operators: Vec<OperatorConfig>,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

fn default_listen() -> String {
    "127.0.0.1:4140".to_string()
}

fn default_watchdog_secs() -> u64 {
    900
}

fn default_replay_capacity() -> usize {
    4096
}

fn default_observer_ttl_secs() -> u64 {
    300
}

fn default_reap_interval_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            state_dir: None,
            watchdog_secs: default_watchdog_secs(),
            replay_capacity: default_replay_capacity(),
            observer_ttl_secs: default_observer_ttl_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            operators: Vec::new(),
            servers: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml(&data)
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(data)?;
        Ok(config)
    }

    pub fn watchdog(&self) -> Duration {
        Duration::from_secs(self.watchdog_secs)
    }

    pub fn observer_ttl(&self) -> Duration {
        Duration::from_secs(self.observer_ttl_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    /// Load and reject configs that carry any error-level warning.
    pub fn load_validated(path: &Path) -> Result<Self> {
        let config = Self::load(path)?;
        let errors: Vec<String> = config
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message)
            .collect();
        if !errors.is_empty() {
            return Err(RunbookError::InvalidConfig(errors.join("; ")));
        }
        Ok(config)
    }

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.operators.is_empty() {
            warnings.push(ConfigWarning::warning(
                "no operators configured: every request will be rejected",
            ));
        }
        let mut tokens = HashSet::new();
        for op in &self.operators {
            if op.token.trim().is_empty() {
                warnings.push(ConfigWarning::error(format!(
                    "operator '{}' has an empty token",
                    op.name
                )));
            } else if !tokens.insert(op.token.as_str()) {
                warnings.push(ConfigWarning::error(format!(
                    "operator '{}' reuses another operator's token",
                    op.name
                )));
            }
        }

        let mut server_ids = HashSet::new();
        for server in &self.servers {
            if crate::types::validate_id(&server.id).is_err() {
                warnings.push(ConfigWarning::error(format!(
                    "server id '{}' contains unsupported characters",
                    server.id
                )));
            }
            if !server_ids.insert(server.id.as_str()) {
                warnings.push(ConfigWarning::error(format!(
                    "duplicate server id '{}'",
                    server.id
                )));
            }
            if server.host.trim().is_empty() {
                warnings.push(ConfigWarning::error(format!(
                    "server '{}' has an empty host",
                    server.id
                )));
            }
            if server.actions.is_empty() {
                warnings.push(ConfigWarning::warning(format!(
                    "server '{}' has no actions",
                    server.id
                )));
            }

            let mut action_ids = HashSet::new();
            for action in &server.actions {
                if crate::types::validate_id(&action.id).is_err() {
                    warnings.push(ConfigWarning::error(format!(
                        "action id '{}/{}' contains unsupported characters",
                        server.id, action.id
                    )));
                }
                if !action_ids.insert(action.id.as_str()) {
                    warnings.push(ConfigWarning::error(format!(
                        "duplicate action id '{}/{}'",
                        server.id, action.id
                    )));
                }
                if !Path::new(&action.command_path).is_absolute() {
                    warnings.push(ConfigWarning::warning(format!(
                        "action '{}/{}' uses a relative command path '{}'",
                        server.id, action.id, action.command_path
                    )));
                }
            }
        }

        if self.watchdog_secs == 0 {
            warnings.push(ConfigWarning::error("watchdog_secs must be greater than 0"));
        }
        if self.replay_capacity == 0 {
            warnings.push(ConfigWarning::warning(
                "replay_capacity is 0: late observers will miss every earlier event",
            ));
        }
        if self.reap_interval_secs == 0 {
            warnings.push(ConfigWarning::error(
                "reap_interval_secs must be greater than 0",
            ));
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
listen: "0.0.0.0:9000"
watchdog_secs: 60
operators:
  - name: alice
    token: alice-token
    tier: elevated_use
  - name: bob
    token: bob-token
    tier: use
servers:
  - id: web-1
    name: Web 1
    host: web1.internal
    auth:
      user: deploy
      port: 2222
    actions:
      - id: deploy
        name: Deploy
        description: Roll out the current release
        command_path: /opt/ops/deploy.sh
      - id: wipe-cache
        name: Wipe cache
        command_path: /opt/ops/wipe.sh
        dangerous: true
"#;

    #[test]
    fn parses_sample_config() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.watchdog(), Duration::from_secs(60));
        assert_eq!(config.replay_capacity, 4096);
        assert_eq!(config.operators.len(), 2);
        assert_eq!(config.operators[0].tier, PermissionTier::ElevatedUse);
        let server = &config.servers[0];
        assert_eq!(server.auth.user.as_deref(), Some("deploy"));
        assert_eq!(server.auth.port, Some(2222));
        assert!(!server.actions[0].dangerous);
        assert!(server.actions[1].dangerous);
        assert_eq!(server.actions[1].description, "");
    }

    #[test]
    fn sample_config_has_no_errors() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert!(config
            .validate()
            .iter()
            .all(|w| w.level != WarnLevel::Error));
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.listen, "127.0.0.1:4140");
        assert_eq!(config.watchdog_secs, 900);
        assert!(config.state_dir.is_none());
    }

    #[test]
    fn duplicate_ids_are_errors() {
        let yaml = r#"
operators:
  - { name: a, token: t1, tier: use }
  - { name: b, token: t1, tier: use }
servers:
  - id: s
    name: S
    host: localhost
    actions:
      - { id: x, name: X, command_path: /bin/true }
      - { id: x, name: X2, command_path: /bin/true }
  - id: s
    name: S again
    host: localhost
"#;
        let config = Config::from_yaml(yaml).unwrap();
        let errors: Vec<_> = config
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message)
            .collect();
        assert!(errors.iter().any(|m| m.contains("reuses")));
        assert!(errors.iter().any(|m| m.contains("duplicate action id 's/x'")));
        assert!(errors.iter().any(|m| m.contains("duplicate server id 's'")));
    }

    #[test]
    fn relative_command_path_is_a_warning() {
        let yaml = r#"
operators: [{ name: a, token: t, tier: use }]
servers:
  - id: s
    name: S
    host: localhost
    actions: [{ id: x, name: X, command_path: scripts/x.sh }]
"#;
        let config = Config::from_yaml(yaml).unwrap();
        let warnings = config.validate();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].level, WarnLevel::Warning);
    }

    #[test]
    fn load_validated_rejects_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("runbook.yaml");
        std::fs::write(&path, "watchdog_secs: 0\n").unwrap();
        let err = Config::load_validated(&path).unwrap_err();
        assert!(matches!(err, RunbookError::InvalidConfig(_)));
    }
}
