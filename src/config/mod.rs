//! Configuration loading.
//!
//! Sources, later overriding earlier:
//! 1. `config.yaml` in the current directory (if exists)
//! 2. File given by `--config <path>` (if provided)
//! 3. File named by `USER_IMPORTER_CONFIG` (if set)
//! 4. Environment variables prefixed `USER_IMPORTER__`, e.g.
//!    `USER_IMPORTER__MESSAGING__AMQP__URL`

use serde::Deserialize;

use crate::bus::MessagingConfig;
use crate::import::ImportConfig;
use crate::storage::StorageConfig;

/// Default configuration file name, without extension.
pub const DEFAULT_CONFIG_FILE: &str = "config";

/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "USER_IMPORTER_CONFIG";

/// Prefix for environment variable overrides.
pub const CONFIG_ENV_PREFIX: &str = "USER_IMPORTER";

/// Environment variable for the log filter.
pub const LOG_ENV_VAR: &str = "USER_IMPORTER_LOG";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Messaging configuration.
    pub messaging: MessagingConfig,
    /// Batch import configuration.
    pub import: ImportConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

impl Config {
    /// Load configuration from files and environment.
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::AdmissionPolicy;
    use crate::storage::StorageType;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.storage.storage_type, StorageType::Sqlite);
        assert_eq!(config.messaging.amqp.reconnect_delay_secs, 5);
        assert_eq!(config.import.capacity, 10);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r#"
storage:
  type: postgres
  postgres:
    uri: postgres://localhost/users
messaging:
  amqp:
    url: amqp://rabbit:5672
import:
  capacity: 4
  admission: wait
  max_retries: 5
logging:
  format: json
"#
        )
        .unwrap();

        let config = Config::load(file.path().to_str()).unwrap();

        assert_eq!(config.storage.storage_type, StorageType::Postgres);
        assert_eq!(config.storage.postgres.uri, "postgres://localhost/users");
        assert_eq!(config.messaging.amqp.url, "amqp://rabbit:5672");
        assert_eq!(config.messaging.amqp.reconnect_delay_secs, 5);
        assert_eq!(config.import.capacity, 4);
        assert_eq!(config.import.admission, AdmissionPolicy::Wait);
        assert_eq!(config.import.max_retries, 5);
        assert_eq!(config.import.retry_delay_ms, 2000);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("USER_IMPORTER__IMPORT__CAPACITY", "25");
        let config = Config::load(None);
        std::env::remove_var("USER_IMPORTER__IMPORT__CAPACITY");

        assert_eq!(config.unwrap().import.capacity, 25);
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_fails() {
        assert!(Config::load(Some("/nonexistent/user-importer.yaml")).is_err());
    }
}
