//! Runtime configuration (§6, ambient).
//!
//! Grounded on `UserConfig::{load, save, config_path}` — a
//! `dirs`-located TOML file, round-tripped with `serde`/`toml`, with
//! `#[serde(default)]` on every field added after the format's first
//! release so older config files on disk keep loading (the same
//! forward-compatibility discipline `pow_required_bits` already
//! established).

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_comm_server_url() -> String {
    "wss://comm.example.invalid".to_string()
}

fn default_true() -> bool {
    true
}

fn default_pairing_token_ttl_secs() -> i64 {
    60
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CoreConfig {
    #[serde(default = "default_comm_server_url")]
    pub comm_server_url: String,

    #[serde(default = "default_true")]
    pub accept_incoming_connections: bool,

    #[serde(default)]
    pub accept_unknown_instances: bool,

    #[serde(default)]
    pub accept_unknown_persons: bool,

    #[serde(default = "default_true")]
    pub allow_pairing: bool,

    #[serde(default = "default_pairing_token_ttl_secs")]
    pub pairing_token_expiration_duration_secs: i64,

    #[serde(default = "default_true")]
    pub establish_outgoing_connections: bool,

    #[serde(default)]
    pub store_dir: Option<PathBuf>,

    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    #[serde(default)]
    pub identity_dir: Option<PathBuf>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            comm_server_url: default_comm_server_url(),
            accept_incoming_connections: true,
            accept_unknown_instances: false,
            accept_unknown_persons: false,
            allow_pairing: true,
            pairing_token_expiration_duration_secs: default_pairing_token_ttl_secs(),
            establish_outgoing_connections: true,
            store_dir: None,
            log_dir: None,
            identity_dir: None,
        }
    }
}

impl CoreConfig {
    fn base_dir() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("one-core");
        path
    }

    fn config_path() -> PathBuf {
        let mut path = Self::base_dir();
        std::fs::create_dir_all(&path).ok();
        path.push("config.toml");
        path
    }

    pub fn load() -> CoreResult<Self> {
        let path = Self::config_path();
        if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| CoreError::Storage(e.to_string()))?;
            toml::from_str(&content).map_err(|e| CoreError::Invalid(format!("bad config: {e}")))
        } else {
            let config = Self::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> CoreResult<()> {
        let path = Self::config_path();
        let content = toml::to_string_pretty(self).map_err(|e| CoreError::Invalid(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| CoreError::Storage(e.to_string()))
    }

    pub fn store_dir(&self) -> PathBuf {
        self.store_dir.clone().unwrap_or_else(|| Self::base_dir().join("store"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| Self::base_dir().join("logs"))
    }

    pub fn identity_dir(&self) -> PathBuf {
        self.identity_dir.clone().unwrap_or_else(|| Self::base_dir().join("identity"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_defaults() {
        let config = CoreConfig::default();
        assert!(config.accept_incoming_connections);
        assert!(!config.accept_unknown_instances);
        assert!(!config.accept_unknown_persons);
        assert!(config.allow_pairing);
        assert!(config.establish_outgoing_connections);
    }

    #[test]
    fn old_config_without_new_fields_still_loads() {
        let toml = r#"
            comm_server_url = "wss://old.example.invalid"
        "#;
        let config: CoreConfig = toml::from_str(toml).unwrap();
        assert!(config.accept_incoming_connections);
        assert_eq!(config.pairing_token_expiration_duration_secs, 60);
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = CoreConfig::default();
        config.accept_unknown_persons = true;
        let toml = toml::to_string_pretty(&config).unwrap();
        let reloaded: CoreConfig = toml::from_str(&toml).unwrap();
        assert_eq!(reloaded.accept_unknown_persons, true);
    }

    #[test]
    fn directory_helpers_fall_back_to_base_dir_subpaths() {
        let mut config = CoreConfig::default();
        config.store_dir = Some(PathBuf::from("/tmp/custom-store"));
        assert_eq!(config.store_dir(), PathBuf::from("/tmp/custom-store"));
        assert!(config.log_dir().ends_with("logs"));
    }
}
