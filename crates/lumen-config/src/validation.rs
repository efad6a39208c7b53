//! Configuration validation

use crate::schema::RawConfig;
use std::collections::HashSet;
use thiserror::Error;

/// Smallest send buffer worth asking the kernel for
pub const MIN_SEND_BUFFER_BYTES: usize = 4096;

/// Validation error
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("server.socket_path cannot be empty")]
    EmptySocketPath,

    #[error("server.io_threads must be at least 1")]
    NoIoThreads,

    #[error("transport.send_timeout_ms must be greater than 0")]
    ZeroSendTimeout,

    #[error("transport.send_buffer_bytes {0} is below the minimum of 4096")]
    SendBufferTooSmall(usize),

    #[error("Duplicate uid in authorization.allowed_uids: {0}")]
    DuplicateUid(u32),
}

/// Validate a raw configuration
pub fn validate_config(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if let Some(path) = &config.server.socket_path
        && path.as_os_str().is_empty()
    {
        errors.push(ValidationError::EmptySocketPath);
    }

    if config.server.io_threads == Some(0) {
        errors.push(ValidationError::NoIoThreads);
    }

    if config.transport.send_timeout_ms == Some(0) {
        errors.push(ValidationError::ZeroSendTimeout);
    }

    if let Some(bytes) = config.transport.send_buffer_bytes
        && bytes < MIN_SEND_BUFFER_BYTES
    {
        errors.push(ValidationError::SendBufferTooSmall(bytes));
    }

    let mut seen = HashSet::new();
    for uid in &config.authorization.allowed_uids {
        if !seen.insert(uid) {
            errors.push(ValidationError::DuplicateUid(*uid));
        }
    }

    errors
}
