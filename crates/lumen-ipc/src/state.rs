//! Per-connection read/dispatch state machine

use std::sync::atomic::{AtomicU8, Ordering};

/// Where a connection is in its read loop.
///
/// `AwaitingHeader -> AwaitingBody -> AwaitingFds (if any) -> Dispatching ->
/// AwaitingHeader`, or `Closed` from anywhere. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    AwaitingHeader = 0,
    AwaitingBody = 1,
    AwaitingFds = 2,
    Dispatching = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::AwaitingHeader,
            1 => ConnectionState::AwaitingBody,
            2 => ConnectionState::AwaitingFds,
            3 => ConnectionState::Dispatching,
            _ => ConnectionState::Closed,
        }
    }
}

#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::AwaitingHeader as u8))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next`; fails once the connection is closed
    pub fn advance(&self, next: ConnectionState) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != ConnectionState::Closed as u8).then_some(next as u8)
            })
            .is_ok()
    }

    pub fn close(&self) {
        self.0.store(ConnectionState::Closed as u8, Ordering::Release);
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
