//! Configuration management for the hopstore persistence core
//!
//! Settings are read from a TOML file, then overridden by `HOP_*`
//! environment variables and validated before use.

use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default name of the configuration file
pub const DEFAULT_CONFIG_FILE: &str = "hopstore.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Embedded database configuration
    pub storage: StorageConfig,

    /// Type mapping configuration
    pub mapping: MappingConfig,

    /// Node cache configuration
    pub cache: CacheConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Embedded XML database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database home directory holding one XML file per node
    pub db_home: PathBuf,

    /// Base value for the id generator. Ids 0 and 1 are reserved for the
    /// root and user-root nodes, so values below 1 are clamped.
    pub id_base: u64,

    /// Character encoding declared in written XML files
    pub encoding: String,
}

/// Type mapping configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    /// Application directory with one sub-directory per prototype, each
    /// holding a `type.properties` file. None = register mappings in code.
    pub app_dir: Option<PathBuf>,

    /// Id column used when a mapping doesn't declare `_id`
    pub default_id_column: String,

    /// Number of rows per segment of large subnode collections
    pub segment_length: usize,
}

/// Node cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of nodes kept across both cache generations
    pub capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (pretty, compact, json)
    pub format: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_home: PathBuf::from("./db"),
            id_base: 1,
            encoding: "UTF-8".to_string(),
        }
    }
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            app_dir: None,
            default_id_column: "ID".to_string(),
            segment_length: 1000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 5000 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default file (if present) and environment
    pub fn load() -> Result<Self> {
        let mut config = if Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::from_file(DEFAULT_CONFIG_FILE)?
        } else {
            Config::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&contents)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| Error::config(format!("Failed to parse config file: {}", e)))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Storage overrides
        if let Some(home) = lookup("HOP_DB_HOME") {
            self.storage.db_home = PathBuf::from(home);
        }

        if let Some(base) = lookup("HOP_ID_BASE") {
            self.storage.id_base = base
                .parse()
                .map_err(|e| Error::config(format!("Invalid id base: {}", e)))?;
        }

        // Mapping overrides
        if let Some(dir) = lookup("HOP_APP_DIR") {
            self.mapping.app_dir = Some(PathBuf::from(dir));
        }

        if let Some(len) = lookup("HOP_SEGMENT_LENGTH") {
            self.mapping.segment_length = len
                .parse()
                .map_err(|e| Error::config(format!("Invalid segment length: {}", e)))?;
        }

        // Cache overrides
        if let Some(size) = lookup("HOP_CACHE_SIZE") {
            self.cache.capacity = size
                .parse()
                .map_err(|e| Error::config(format!("Invalid cache size: {}", e)))?;
        }

        // Logging overrides
        if let Some(level) = lookup("HOP_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(format) = lookup("HOP_LOG_FORMAT") {
            self.logging.format = format;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.mapping.segment_length == 0 {
            return Err(Error::config("Segment length must be at least 1"));
        }

        if self.cache.capacity == 0 {
            return Err(Error::config("Cache capacity must be at least 1"));
        }

        if self.mapping.default_id_column.trim().is_empty() {
            return Err(Error::config("Default id column must not be empty"));
        }

        // node files are always written as UTF-8
        if !matches!(self.storage.encoding.to_ascii_uppercase().as_str(), "UTF-8" | "UTF8") {
            return Err(Error::config(format!(
                "Unsupported XML encoding {}",
                self.storage.encoding
            )));
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(Error::config("Invalid log level")),
        }

        match self.logging.format.as_str() {
            "pretty" | "compact" | "json" => {}
            _ => return Err(Error::config("Invalid log format")),
        }

        Ok(())
    }

    /// Id generator start value after clamping away the reserved ids
    pub fn effective_id_base(&self) -> u64 {
        self.storage.id_base.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mapping.segment_length, 1000);
        assert_eq!(config.mapping.default_id_column, "ID");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [storage]
            db_home = "/var/lib/hop"

            [mapping]
            segment_length = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.storage.db_home, PathBuf::from("/var/lib/hop"));
        assert_eq!(config.mapping.segment_length, 250);
        assert_eq!(config.cache.capacity, 5000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("HOP_DB_HOME", "/tmp/hop"),
            ("HOP_ID_BASE", "500"),
            ("HOP_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.storage.db_home, PathBuf::from("/tmp/hop"));
        assert_eq!(config.storage.id_base, 500);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_invalid_override_is_config_error() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(|name| (name == "HOP_SEGMENT_LENGTH").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.mapping.segment_length = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.storage.encoding = "ISO-8859-1".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_id_base_is_clamped() {
        let mut config = Config::default();
        config.storage.id_base = 0;
        assert_eq!(config.effective_id_base(), 1);
        config.storage.id_base = 77;
        assert_eq!(config.effective_id_base(), 77);
    }
}
