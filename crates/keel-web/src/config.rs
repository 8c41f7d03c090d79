//! Configuration loading from file and environment variables.

use keel_db::{Database, DatabaseUrl, DbError, DbRuntimeSettings, Metadata};
use serde::Deserialize;
use thiserror::Error;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL, e.g. `sqlite:///app.db` or `sqlite://` for in-memory.
    #[serde(default = "default_db_url")]
    pub url: String,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled connections, which bounds the number of
    /// requests holding a session at once.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,

    /// How long a request waits for a pooled connection, in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "keel_db=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_db_url() -> String {
    "sqlite:///keel.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    DbRuntimeSettings::default().busy_timeout_ms
}

fn default_pool_max_size() -> u32 {
    DbRuntimeSettings::default().pool_max_size
}

fn default_connection_timeout_ms() -> u64 {
    DbRuntimeSettings::default().connection_timeout_ms
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_db_url(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
            connection_timeout_ms: default_connection_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl DatabaseConfig {
    pub fn runtime_settings(&self) -> DbRuntimeSettings {
        DbRuntimeSettings {
            busy_timeout_ms: self.busy_timeout_ms,
            pool_max_size: self.pool_max_size,
            connection_timeout_ms: self.connection_timeout_ms,
        }
    }

    /// Builds the engine described by this configuration.
    pub fn connect(&self, metadata: Metadata) -> Result<Database, DbError> {
        let url = DatabaseUrl::parse(&self.url)?;
        Database::connect(&url, self.runtime_settings(), metadata)
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `KEEL_DATABASE_URL` overrides `database.url`
/// - `KEEL_DB_POOL_MAX_SIZE` overrides `database.pool_max_size`
/// - `KEEL_LOG_LEVEL` overrides `logging.level`
/// - `KEEL_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    Ok(apply_overrides(config, |name| std::env::var(name).ok()))
}

fn apply_overrides(mut config: Config, var: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(url) = var("KEEL_DATABASE_URL") {
        config.database.url = url;
    }
    if let Some(size) = var("KEEL_DB_POOL_MAX_SIZE") {
        match size.parse() {
            Ok(parsed) => config.database.pool_max_size = parsed,
            Err(_) => tracing::warn!(value = %size, "ignoring invalid KEEL_DB_POOL_MAX_SIZE"),
        }
    }
    if let Some(level) = var("KEEL_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("KEEL_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = load_config(path.to_str()).unwrap();
        assert_eq!(config.database.pool_max_size, 8);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn parses_file_with_partial_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[database]\nurl = \"sqlite://\"\npool_max_size = 2\n\n[logging]\njson = true"
        )
        .unwrap();

        let config = load_config(file.path().to_str()).unwrap();
        assert_eq!(config.database.url, "sqlite://");
        assert_eq!(config.database.pool_max_size, 2);
        assert_eq!(config.database.busy_timeout_ms, 5_000);
        assert!(config.logging.json);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[database\nurl = 1").unwrap();
        assert!(matches!(
            load_config(file.path().to_str()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn environment_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("KEEL_DATABASE_URL", "sqlite:///other.db"),
            ("KEEL_DB_POOL_MAX_SIZE", "not-a-number"),
            ("KEEL_LOG_LEVEL", "debug"),
            ("KEEL_LOG_JSON", "1"),
        ]
        .into_iter()
        .collect();

        let config = apply_overrides(Config::default(), |name| {
            vars.get(name).map(|v| v.to_string())
        });
        assert_eq!(config.database.url, "sqlite:///other.db");
        assert_eq!(config.database.pool_max_size, 8);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }

    #[test]
    fn runtime_settings_follow_config() {
        let config = DatabaseConfig {
            pool_max_size: 3,
            ..DatabaseConfig::default()
        };
        let settings = config.runtime_settings();
        assert_eq!(settings.pool_max_size, 3);
        assert_eq!(settings.busy_timeout_ms, 5_000);
    }
}
