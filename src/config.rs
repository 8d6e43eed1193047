use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;
use crate::server::{RuleSpec, Ruleset};

const APP_DIR: &str = "mc-console-ctrl";

/// Settings loaded from `config.json`.
///
/// Every field has a default, so a partial file is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// tmux session hosting the server
    pub session_name: String,
    /// Ordered classification rules; the first match wins
    pub rules: Vec<RuleSpec>,
    pub attach_timeout_ms: u64,
    /// How long after attaching a start line still counts as "just started"
    pub bootstrap_window_ms: u64,
    /// Pause after each command before the next may be written
    pub command_delay_ms: u64,
    pub poll_interval_ms: u64,
    /// Pane history replayed on attach
    pub backlog_lines: usize,
    pub max_line_bytes: usize,
    /// Console lines kept in the front end
    pub history_size: usize,
    /// Command that puts the server into the stopping phase
    pub stop_command: String,
    pub server_process_names: Vec<String>,
    pub server_process_keywords: Vec<String>,
    /// Player `qg` gives to
    pub default_player: Option<String>,
    /// Known players, managed with `player add|del`
    pub players: BTreeSet<String>,
    /// Destinations for `tp`, managed with `namedpos add|del`
    pub named_positions: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session_name: "minecraft".to_string(),
            rules: Ruleset::builtin_specs(),
            attach_timeout_ms: 5_000,
            bootstrap_window_ms: 2_000,
            command_delay_ms: 100,
            poll_interval_ms: 100,
            backlog_lines: 50,
            max_line_bytes: 64 * 1024,
            history_size: 1_000,
            stop_command: "stop".to_string(),
            server_process_names: vec!["bedrock_server".to_string(), "bedrock_server.exe".to_string()],
            server_process_keywords: vec!["bedrock".to_string(), "minecraft".to_string(), "server.jar".to_string()],
            default_player: None,
            players: BTreeSet::new(),
            named_positions: BTreeMap::new(),
        }
    }
}

impl Config {
    /// `<config dir>/mc-console-ctrl/config.json`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.json")
    }

    /// Directory for logs and capture files
    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }

    /// Load the config, writing the defaults first if the file is missing
    pub async fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if !tokio::fs::try_exists(path).await? {
            let config = Self::default();
            config.save(path).await?;
            info!(path = %path.display(), "wrote default config");
            return Ok(config);
        }
        let raw = tokio::fs::read_to_string(path).await?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_name.trim().is_empty() {
            return Err(ConfigError::EmptySessionName);
        }
        self.ruleset().map(|_| ())
    }

    pub fn ruleset(&self) -> Result<Ruleset, ConfigError> {
        Ruleset::from_specs(&self.rules)
    }

    pub fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_timeout_ms)
    }

    pub fn bootstrap_window(&self) -> Duration {
        Duration::from_millis(self.bootstrap_window_ms)
    }

    pub fn command_delay(&self) -> Duration {
        Duration::from_millis(self.command_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::EventKind;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = Config::parse(r#"{"session_name": "bedrock", "attach_timeout_ms": 250}"#).unwrap();
        assert_eq!(config.session_name, "bedrock");
        assert_eq!(config.attach_timeout(), Duration::from_millis(250));
        assert_eq!(config.bootstrap_window_ms, 2_000);
        assert_eq!(config.rules, Ruleset::builtin_specs());
    }

    #[test]
    fn test_default_rules_cover_every_kind() {
        let kinds: Vec<EventKind> = Config::default().rules.iter().map(|r| r.kind).collect();
        for kind in [
            EventKind::ServerStarted,
            EventKind::ServerStopped,
            EventKind::ServerCrashed,
            EventKind::PlayerJoined,
            EventKind::PlayerLeft,
            EventKind::WorldSaved,
        ] {
            assert!(kinds.contains(&kind), "no default rule for {kind}");
        }
    }

    #[test]
    fn test_empty_session_name_is_rejected() {
        let err = Config::parse(r#"{"session_name": "  "}"#).unwrap_err();
        assert!(matches!(err, ConfigError::EmptySessionName));
    }

    #[test]
    fn test_bad_rule_is_rejected() {
        let err = Config::parse(r#"{"rules": [{"pattern": "[", "kind": "world_saved"}]}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { index: 0, .. }));
    }

    #[tokio::test]
    async fn test_saved_settings_reload() {
        let dir = std::env::temp_dir().join(format!("mcc-settings-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("config.json");

        let mut config = Config::default();
        config.players.insert("Steve".to_string());
        config.default_player = Some("Steve".to_string());
        config.named_positions.insert("spawn".to_string(), "0 64 0".to_string());
        config.save(&path).await.unwrap();

        assert_eq!(Config::load_or_create(&path).await.unwrap(), config);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_load_creates_default_file() {
        let dir = std::env::temp_dir().join(format!("mcc-config-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("config.json");

        let created = Config::load_or_create(&path).await.unwrap();
        assert_eq!(created, Config::default());
        assert!(path.exists());

        let reloaded = Config::load_or_create(&path).await.unwrap();
        assert_eq!(reloaded, created);
        let _ = std::fs::remove_dir_all(dir);
    }
}
