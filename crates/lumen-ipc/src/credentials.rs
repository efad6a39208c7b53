//! Peer credentials, session authorization and the protocol version gate

use lumen_protocol::{
    CURRENT_PROTOCOL_VERSION, Invocation, OLDEST_COMPATIBLE_PROTOCOL_VERSION, ProtocolVersion,
};
use std::sync::{Arc, OnceLock};
use thiserror::Error;

use crate::{StreamTransport, TransportError};

/// Identity of the process on the other end of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionCredentials {
    pid: i32,
    uid: u32,
    gid: u32,
}

impl SessionCredentials {
    pub fn new(pid: i32, uid: u32, gid: u32) -> Self {
        Self { pid, uid, gid }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }
}

/// Decides whether a client may connect and which privileged operations it
/// may use
pub trait SessionAuthorizer: Send + Sync {
    fn connection_is_allowed(&self, credentials: &SessionCredentials) -> bool;

    fn configure_display_is_allowed(&self, _credentials: &SessionCredentials) -> bool {
        true
    }

    fn screencast_is_allowed(&self, _credentials: &SessionCredentials) -> bool {
        true
    }
}

/// Admits every client to everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl SessionAuthorizer for AllowAll {
    fn connection_is_allowed(&self, _credentials: &SessionCredentials) -> bool {
        true
    }
}

/// How a connection came to exist
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionOrigin {
    /// Accepted on the listening socket
    #[default]
    Listener,
    /// Socket handed to a helper process the server launched itself
    TrustedHelper,
    /// Socket created on behalf of a prompt session
    PromptSession,
}

/// Context handed to the factory when a session is built
#[derive(Debug, Clone, Default)]
pub struct ConnectionContext {
    pub origin: ConnectionOrigin,
    /// Credentials known up front; fetched from the socket when absent
    pub credentials: Option<SessionCredentials>,
}

impl ConnectionContext {
    pub fn listener() -> Self {
        Self::default()
    }

    pub fn with_origin(origin: ConnectionOrigin) -> Self {
        Self {
            origin,
            credentials: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("Failed to read peer credentials: {0}")]
    Credentials(#[source] TransportError),

    #[error("Invocation carries no protocol version")]
    MissingVersion,

    #[error("Unsupported protocol version {version} (supported {oldest} to {current})")]
    UnsupportedVersion {
        version: ProtocolVersion,
        oldest: ProtocolVersion,
        current: ProtocolVersion,
    },
}

/// Check the version an invocation was written against
pub fn check_protocol_version(raw: Option<u32>) -> Result<ProtocolVersion, GateError> {
    let version = ProtocolVersion::from_raw(raw.ok_or(GateError::MissingVersion)?);
    if !version.is_supported() {
        return Err(GateError::UnsupportedVersion {
            version,
            oldest: OLDEST_COMPATIBLE_PROTOCOL_VERSION,
            current: CURRENT_PROTOCOL_VERSION,
        });
    }
    Ok(version)
}

/// Admits invocations into dispatch.
///
/// Peer credentials are fetched at most once and cached for the life of the
/// connection.
pub struct CredentialGate {
    transport: Arc<StreamTransport>,
    cached: OnceLock<SessionCredentials>,
}

impl CredentialGate {
    pub fn new(transport: Arc<StreamTransport>, known: Option<SessionCredentials>) -> Self {
        let cached = OnceLock::new();
        if let Some(credentials) = known {
            let _ = cached.set(credentials);
        }
        Self { transport, cached }
    }

    pub fn credentials(&self) -> Result<SessionCredentials, GateError> {
        if let Some(credentials) = self.cached.get() {
            return Ok(*credentials);
        }
        let fetched = self
            .transport
            .peer_credentials()
            .map_err(GateError::Credentials)?;
        Ok(*self.cached.get_or_init(|| fetched))
    }

    pub fn client_pid(&self) -> Result<i32, GateError> {
        self.credentials().map(|c| c.pid())
    }

    /// Credentials first, then the protocol version
    pub fn admit(&self, invocation: &Invocation) -> Result<SessionCredentials, GateError> {
        let credentials = self.credentials()?;
        check_protocol_version(invocation.protocol_version)?;
        Ok(credentials)
    }
}
