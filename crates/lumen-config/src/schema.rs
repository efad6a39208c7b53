//! Raw configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    #[serde(default)]
    pub server: RawServerConfig,

    #[serde(default)]
    pub transport: RawTransportConfig,

    #[serde(default)]
    pub authorization: RawAuthorizationConfig,
}

/// Listening socket and I/O thread pool
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawServerConfig {
    /// Socket path (default: $XDG_RUNTIME_DIR/lumen/lumen.sock)
    pub socket_path: Option<PathBuf>,

    /// Number of I/O threads servicing connections
    pub io_threads: Option<usize>,
}

/// Per-connection write behaviour
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawTransportConfig {
    /// Upper bound on one blocked response write
    pub send_timeout_ms: Option<u64>,

    /// Requested kernel send buffer size
    pub send_buffer_bytes: Option<usize>,
}

/// Which peers may connect and what they may do
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawAuthorizationConfig {
    /// Whitelisted peer uids; empty allows everyone
    #[serde(default)]
    pub allowed_uids: Vec<u32>,

    pub allow_screencast: Option<bool>,

    pub allow_display_configuration: Option<bool>,
}
