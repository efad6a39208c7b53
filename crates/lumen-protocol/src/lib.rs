//! Protocol types for lumen IPC
//!
//! This crate defines the wire contract between the lumen server and clients:
//! - Request and response envelopes, and their 2-byte length framing
//! - The method table
//! - Parameter and result messages
//! - Side-channel file descriptor groups
//! - Versioning

mod fds;
mod messages;
mod methods;
mod version;
mod wire;

pub use fds::*;
pub use messages::*;
pub use methods::*;
pub use version::*;
pub use wire::*;
