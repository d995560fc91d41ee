//! Configuration management for subway.
//!
//! Handles loading and saving `config.toml` in the platform config directory.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Written by `subway login`, read by `subway start`.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub token: Option<String>,
    pub server: Option<String>,
}

/// Defaults for `subway serve`.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen: Option<String>,
    pub domain: Option<String>,
    pub public_scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_tokens: Vec<String>,
}

impl Config {
    /// Load from the default location, or defaults if there is no file yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    pub fn config_path() -> Result<PathBuf> {
        let proj_dirs =
            ProjectDirs::from("", "", "subway").context("Could not determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.auth.token = Some("abc".to_string());
        config.auth.server = Some("wss://relay.example/connect".to_string());
        config.server.domain = Some("tunnels.example".to_string());
        config.server.allowed_tokens = vec!["abc".to_string(), "def".to_string()];
        config.save_to(&path).unwrap();

        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[server]\nlisten = \"127.0.0.1:9000\"\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.server.listen.as_deref(), Some("127.0.0.1:9000"));
        assert!(config.auth.token.is_none());
        assert!(config.server.allowed_tokens.is_empty());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[auth\n").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
