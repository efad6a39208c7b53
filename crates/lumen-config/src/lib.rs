//! Configuration parsing and validation for the lumen server
//!
//! Supports TOML configuration with:
//! - Versioned schema
//! - Socket and I/O thread settings
//! - Transport backpressure limits
//! - Connection authorization policy
//! - Validation with clear error messages

mod schema;
mod settings;
mod validation;

pub use schema::*;
pub use settings::*;
pub use validation::*;

use std::path::Path;
use thiserror::Error;
use tracing::info;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation failed: {errors:?}")]
    ValidationFailed { errors: Vec<ValidationError> },

    #[error("Unsupported config version: {0}")]
    UnsupportedVersion(u32),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Load and validate configuration from a TOML file
pub fn load_config(path: impl AsRef<Path>) -> ConfigResult<ServerConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Load configuration, falling back to defaults when the file does not exist
pub fn load_config_or_default(path: impl AsRef<Path>) -> ConfigResult<ServerConfig> {
    let path = path.as_ref();
    if !path.exists() {
        info!(path = %path.display(), "No config file, using defaults");
        return Ok(ServerConfig::default());
    }
    load_config(path)
}

/// Parse and validate configuration from a TOML string
pub fn parse_config(content: &str) -> ConfigResult<ServerConfig> {
    let raw: RawConfig = toml::from_str(content)?;

    if raw.config_version != CURRENT_CONFIG_VERSION {
        return Err(ConfigError::UnsupportedVersion(raw.config_version));
    }

    let errors = validate_config(&raw);
    if !errors.is_empty() {
        return Err(ConfigError::ValidationFailed { errors });
    }

    Ok(ServerConfig::from_raw(raw))
}

/// Current supported config version
pub const CURRENT_CONFIG_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parse_minimal_config() {
        let config = parse_config("config_version = 1").unwrap();
        assert_eq!(config.transport.send_timeout, Duration::from_millis(5000));
        assert!(config.authorization.allowed_uids.is_empty());
        assert!(config.server.io_threads >= 1);
    }

    #[test]
    fn parse_full_config() {
        let config = r#"
            config_version = 1

            [server]
            socket_path = "/tmp/lumen-test/lumen.sock"
            io_threads = 3

            [transport]
            send_timeout_ms = 250
            send_buffer_bytes = 65536

            [authorization]
            allowed_uids = [1000, 1001]
            allow_screencast = false
        "#;

        let config = parse_config(config).unwrap();
        assert_eq!(
            config.server.socket_path.to_str(),
            Some("/tmp/lumen-test/lumen.sock")
        );
        assert_eq!(config.server.io_threads, 3);
        assert_eq!(config.transport.send_timeout, Duration::from_millis(250));
        assert_eq!(config.transport.send_buffer_bytes, 65536);
        assert_eq!(config.authorization.allowed_uids, vec![1000, 1001]);
        assert!(!config.authorization.allow_screencast);
        assert!(config.authorization.allow_display_configuration);
    }

    #[test]
    fn reject_wrong_version() {
        let result = parse_config("config_version = 99");
        assert!(matches!(result, Err(ConfigError::UnsupportedVersion(99))));
    }

    #[test]
    fn reject_invalid_values() {
        let config = r#"
            config_version = 1

            [server]
            io_threads = 0

            [transport]
            send_timeout_ms = 0
        "#;

        match parse_config(config) {
            Err(ConfigError::ValidationFailed { errors }) => assert_eq!(errors.len(), 2),
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.transport.send_buffer_bytes, DEFAULT_SEND_BUFFER_BYTES);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lumen.toml");
        std::fs::write(&path, "config_version = 1\n[server]\nio_threads = 2\n").unwrap();
        assert_eq!(load_config(&path).unwrap().server.io_threads, 2);
    }
}
