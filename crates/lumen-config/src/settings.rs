//! Validated server configuration

use crate::schema::{RawAuthorizationConfig, RawConfig, RawServerConfig, RawTransportConfig};
use lumen_util::default_socket_path;
use std::path::PathBuf;
use std::time::Duration;

/// Default bound on a single blocked response write
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Default SO_SNDBUF request for client sockets
pub const DEFAULT_SEND_BUFFER_BYTES: usize = 1024 * 1024;

/// Validated configuration ready for use by the daemon
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub server: ServerSettings,
    pub transport: TransportConfig,
    pub authorization: AuthorizationPolicy,
}

impl ServerConfig {
    /// Convert from raw config (after validation)
    pub fn from_raw(raw: RawConfig) -> Self {
        Self {
            server: ServerSettings::from_raw(raw.server),
            transport: TransportConfig::from_raw(raw.transport),
            authorization: AuthorizationPolicy::from_raw(raw.authorization),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub socket_path: PathBuf,
    pub io_threads: usize,
}

impl ServerSettings {
    fn from_raw(raw: RawServerConfig) -> Self {
        Self {
            socket_path: raw.socket_path.unwrap_or_else(default_socket_path),
            io_threads: raw.io_threads.unwrap_or_else(default_io_threads),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self::from_raw(RawServerConfig::default())
    }
}

fn default_io_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub send_timeout: Duration,
    pub send_buffer_bytes: usize,
}

impl TransportConfig {
    fn from_raw(raw: RawTransportConfig) -> Self {
        Self {
            send_timeout: raw
                .send_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_SEND_TIMEOUT),
            send_buffer_bytes: raw
                .send_buffer_bytes
                .unwrap_or(DEFAULT_SEND_BUFFER_BYTES),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from_raw(RawTransportConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct AuthorizationPolicy {
    /// Empty allows every uid
    pub allowed_uids: Vec<u32>,
    pub allow_screencast: bool,
    pub allow_display_configuration: bool,
}

impl AuthorizationPolicy {
    fn from_raw(raw: RawAuthorizationConfig) -> Self {
        Self {
            allowed_uids: raw.allowed_uids,
            allow_screencast: raw.allow_screencast.unwrap_or(true),
            allow_display_configuration: raw.allow_display_configuration.unwrap_or(true),
        }
    }

    pub fn uid_is_allowed(&self, uid: u32) -> bool {
        self.allowed_uids.is_empty() || self.allowed_uids.contains(&uid)
    }
}

impl Default for AuthorizationPolicy {
    fn default() -> Self {
        Self::from_raw(RawAuthorizationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_whitelist_allows_everyone() {
        let policy = AuthorizationPolicy::default();
        assert!(policy.uid_is_allowed(0));
        assert!(policy.uid_is_allowed(4242));
    }

    #[test]
    fn whitelist_restricts() {
        let policy = AuthorizationPolicy {
            allowed_uids: vec![1000],
            ..Default::default()
        };
        assert!(policy.uid_is_allowed(1000));
        assert!(!policy.uid_is_allowed(1001));
    }
}
