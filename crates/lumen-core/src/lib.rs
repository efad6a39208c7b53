//! Session handlers for the lumen server
//!
//! This crate provides the handler set each client session talks to:
//! - Surfaces backed by shared-memory buffer swap chains
//! - Screencasts of a display region
//! - The shared display configuration and its change notifications
//! - A worker thread that completes deferred buffer requests
//! - The factory and authorizer wiring sessions to the configured policy

mod buffers;
mod display;
mod executor;
mod factory;
mod mediator;

pub use buffers::*;
pub use display::*;
pub use executor::*;
pub use factory::*;
pub use mediator::*;
