//! Shared utilities for lumen
//!
//! This crate provides:
//! - ID types (ConnectionId) and the registry-owned id allocator
//! - Error types
//! - File descriptor identity helpers
//! - Default paths for the server socket and configuration file

mod error;
mod fd;
mod ids;
mod paths;

pub use error::*;
pub use fd::*;
pub use ids::*;
pub use paths::*;
