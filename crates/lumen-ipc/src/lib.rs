//! Session transport layer for lumen
//!
//! Provides:
//! - Unix domain socket transport carrying bytes and side-channel fds
//! - Length-prefixed message framing
//! - Peer credential caching and protocol version gating
//! - Method dispatch with asynchronous completions
//! - Serialized response writes with resource lifetime extension
//! - Connection registry with idempotent teardown
//! - Client side of the protocol

mod client;
mod connection;
mod credentials;
mod dispatcher;
mod observers;
mod reader;
mod registry;
mod resource_cache;
mod sender;
mod server;
mod state;
mod transport;

pub use client::*;
pub use connection::*;
pub use credentials::*;
pub use dispatcher::*;
pub use observers::*;
pub use reader::*;
pub use registry::*;
pub use resource_cache::*;
pub use sender::*;
pub use server::*;
pub use state::*;
pub use transport::*;

use lumen_protocol::{FdAttachError, WireError};
use thiserror::Error;

/// IPC errors
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("File descriptor mismatch: {0}")]
    FdAttach(#[from] FdAttachError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Server error: {0}")]
    ServerError(String),
}

pub type IpcResult<T> = Result<T, IpcError>;
