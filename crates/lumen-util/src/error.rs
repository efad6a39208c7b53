//! Error types for lumen

use thiserror::Error;

/// Core error type for lumen handler operations
#[derive(Debug, Error)]
pub enum LumenError {
    #[error("Surface not found: {0}")]
    SurfaceNotFound(i32),

    #[error("Screencast not found: {0}")]
    ScreencastNotFound(i32),

    #[error("Session not connected")]
    NotConnected,

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Buffer allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LumenError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParameters(msg.into())
    }

    pub fn allocation(msg: impl Into<String>) -> Self {
        Self::AllocationFailed(msg.into())
    }

    pub fn permission(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, LumenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_human_readable() {
        assert_eq!(
            LumenError::SurfaceNotFound(7).to_string(),
            "Surface not found: 7"
        );
        assert_eq!(
            LumenError::permission("screencast").to_string(),
            "Permission denied: screencast"
        );
    }
}
