//! Default paths for lumen components
//!
//! Paths are user-writable by default (no root required):
//! - Socket: `$XDG_RUNTIME_DIR/lumen/lumen.sock` or `/tmp/lumen-$USER/lumen.sock`
//! - Config: `$XDG_CONFIG_HOME/lumen/lumen.toml` or `~/.config/lumen/lumen.toml`

use std::path::PathBuf;
use tracing::debug;

/// Socket filename within the socket directory
const SOCKET_FILENAME: &str = "lumen.sock";

/// Config filename within the config directory
const CONFIG_FILENAME: &str = "lumen.toml";

/// Application subdirectory name
const APP_DIR: &str = "lumen";

/// Get the default socket path.
///
/// Order of precedence:
/// 1. `$XDG_RUNTIME_DIR/lumen/lumen.sock` (if XDG_RUNTIME_DIR is set)
/// 2. `/tmp/lumen-$USER/lumen.sock` (fallback)
pub fn default_socket_path() -> PathBuf {
    // Typically /run/user/<uid>
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join(APP_DIR).join(SOCKET_FILENAME);
    }

    let username = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    debug!(user = %username, "XDG_RUNTIME_DIR unset, socket goes under /tmp");
    PathBuf::from(format!("/tmp/{}-{}", APP_DIR, username)).join(SOCKET_FILENAME)
}

/// Get the default configuration file path.
///
/// Order of precedence:
/// 1. `$XDG_CONFIG_HOME/lumen/lumen.toml` (if XDG_CONFIG_HOME is set)
/// 2. `~/.config/lumen/lumen.toml` (fallback)
pub fn default_config_path() -> PathBuf {
    if let Ok(config_home) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(config_home).join(APP_DIR).join(CONFIG_FILENAME);
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join(APP_DIR)
            .join(CONFIG_FILENAME);
    }

    // Last resort
    PathBuf::from("/etc").join(APP_DIR).join(CONFIG_FILENAME)
}
