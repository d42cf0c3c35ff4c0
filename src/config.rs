use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding content-addressed files, one per sha256.
    pub root: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

/// Command line overrides collected by the binary; every field beats both
/// the environment and the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config: Option<String>,
    pub db: Option<String>,
    pub storage_root: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_level: Option<String>,
}

/// The base directory for local state, `~/.ace` unless `ACE_BASE_DIR` says
/// otherwise.
pub fn base_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("ACE_BASE_DIR") {
        return PathBuf::from(dir);
    }

    match std::env::var("HOME") {
        Ok(home) => Path::new(&home).join(".ace"),
        Err(_) => PathBuf::from(".ace"),
    }
}

impl Config {
    /// Loads configuration in layers, lowest priority first:
    /// 1. built-in defaults under the base directory
    /// 2. config file (`--config`, else `conf/ace.toml` / `ace.toml`)
    /// 3. environment variables (`ACE_DB`, `ACE_STORAGE_ROOT`, `ACE_LOG_LEVEL`)
    /// 4. command line overrides
    pub fn load(overrides: &ConfigOverrides) -> Result<Self, anyhow::Error> {
        let config_path = overrides.config.clone().or_else(Self::find_config_file);
        let mut config = if let Some(config_path) = config_path {
            Self::from_toml(&config_path)?
        } else {
            Config::default()
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("ACE_DB") {
            self.database.url = url;
            tracing::info!("override database.url from ACE_DB");
        }

        if let Ok(root) = std::env::var("ACE_STORAGE_ROOT") {
            self.storage.root = root;
            tracing::info!("override storage.root from ACE_STORAGE_ROOT: {}", self.storage.root);
        }

        if let Ok(level) = std::env::var("ACE_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    fn apply_cli_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(db) = &overrides.db {
            self.database.url = db.clone();
        }

        if let Some(root) = &overrides.storage_root {
            self.storage.root = root.clone();
        }

        if let Some(host) = &overrides.host {
            self.server.host = host.clone();
        }

        if let Some(port) = overrides.port {
            self.server.port = port;
        }

        if let Some(level) = &overrides.log_level {
            self.logging.level = level.clone();
        }
    }

    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.server.port == 0 {
            anyhow::bail!("server port cannot be 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("database url cannot be empty");
        }

        if self.storage.root.is_empty() {
            anyhow::bail!("storage root cannot be empty");
        }

        Ok(())
    }

    fn find_config_file() -> Option<String> {
        let possible_paths = ["conf/ace.toml", "ace.toml", "./conf/ace.toml", "./ace.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                return Some(path.to_string());
            }
        }
        None
    }

    fn from_toml(path: &str) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".to_string(), port: 8880 }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let path = base_dir().join("ace.db");
        Self { url: format!("sqlite://{}", path.display()) }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { root: base_dir().join("storage").display().to_string() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info,ace_core=debug".to_string(), file: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.database.url.starts_with("sqlite://"));
    }

    #[test]
    fn test_cli_overrides_win() {
        let mut config = Config::default();
        let overrides = ConfigOverrides {
            db: Some("sqlite://custom.db".to_string()),
            port: Some(9000),
            ..Default::default()
        };
        config.apply_cli_overrides(&overrides);
        assert_eq!(config.database.url, "sqlite://custom.db");
        assert_eq!(config.server.port, 9000);
    }

    #[test]
    fn test_toml_parse() {
        let parsed: Config = toml::from_str(
            r#"
            [server]
            host = "0.0.0.0"
            port = 9999

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.server.host, "0.0.0.0");
        assert_eq!(parsed.server.port, 9999);
        assert_eq!(parsed.logging.level, "debug");
    }
}
