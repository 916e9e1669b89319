//! Server configuration file
//!
//! YAML-shaped structured text with `accounts`, `services` and `cameras`
//! sections. The server itself consumes only `services.redis` (credentials
//! for the log/data sidecar channels); the remaining sections are parsed
//! and retained for the camera relay and account-facing adapters that run
//! alongside this process.
//!
//! The path comes from, in order: the `--config` flag, the `PROP_CONFIG`
//! environment variable, then `./config.yaml`. Only the implicit default is
//! allowed to be absent.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Environment variable overriding the config file path
pub const CONFIG_ENV: &str = "PROP_CONFIG";

/// Fallback path when neither the flag nor the env var is set
pub const DEFAULT_CONFIG_PATH: &str = "./config.yaml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Cannot parse config file '{path}': {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AccountConfig {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MediaMtxConfig {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub api_port: u16,
    #[serde(default)]
    pub webrtc_port: u16,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServicesConfig {
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub mediamtx: MediaMtxConfig,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CameraConfig {
    pub ip: String,
    #[serde(default)]
    pub onvif_port: u16,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub accounts: HashMap<String, AccountConfig>,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
}

impl ServerConfig {
    pub fn from_yaml(yaml: &str, path: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }
}

/// Load the server config, resolving the path as documented above.
pub fn load(cli_path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let env_path = std::env::var(CONFIG_ENV).ok();

    let (path, explicit) = match (cli_path, env_path) {
        (Some(p), _) => (p.to_path_buf(), true),
        (None, Some(p)) => (p.into(), true),
        (None, None) => (DEFAULT_CONFIG_PATH.into(), false),
    };

    let display = path.display().to_string();
    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            let config = ServerConfig::from_yaml(&contents, &display)?;
            log::info!("Loaded config from '{}'", display);
            Ok(config)
        }
        Err(source) if !explicit && source.kind() == std::io::ErrorKind::NotFound => {
            log::warn!("No config file at '{}', using defaults", display);
            Ok(ServerConfig::default())
        }
        Err(source) => Err(ConfigError::Io {
            path: display,
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
accounts:
  server:
    username: server
    password: hunter2
services:
  redis:
    ip: 192.168.1.100
    port: 6379
    username: server
    password: hunter2
  mediamtx:
    ip: 192.168.1.100
    api_port: 9997
    webrtc_port: 8889
cameras:
  - ip: 192.168.1.201
    onvif_port: 8000
  - ip: 192.168.1.202
"#;

    #[test]
    fn test_parse_full_config() {
        let config = ServerConfig::from_yaml(SAMPLE, "test").unwrap();
        assert_eq!(config.services.redis.ip, "192.168.1.100");
        assert_eq!(config.services.redis.port, 6379);
        assert_eq!(config.services.redis.username.as_deref(), Some("server"));
        assert_eq!(config.cameras.len(), 2);
        assert_eq!(config.cameras[1].onvif_port, 0);
        assert_eq!(config.accounts["server"].username, "server");
    }

    #[test]
    fn test_sections_default_when_absent() {
        let config = ServerConfig::from_yaml("accounts: {}\n", "test").unwrap();
        assert!(config.cameras.is_empty());
        assert_eq!(config.services.redis.port, 0);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(ServerConfig::from_yaml("accounts: [not, a, map]", "test").is_err());
    }
}
