//! Framed message reader
//!
//! One message is a 2-byte big-endian length, that many bytes of encoded
//! [`Invocation`], and, when the invocation declares side-channel fds, one
//! carrier byte bringing exactly that many descriptors.

use lumen_protocol::{HEADER_LEN, Invocation, WireError, body_len};
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

use crate::{ConnectionState, MAX_FDS_PER_MESSAGE, StateCell, StreamTransport, TransportError};

/// A fully read request
#[derive(Debug)]
pub struct InboundMessage {
    pub invocation: Invocation,
    pub fds: Vec<OwnedFd>,
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Malformed invocation: {0}")]
    Decode(#[from] WireError),

    #[error("Invocation declares {0} descriptors, more than one message can carry")]
    TooManyFds(u32),

    #[error("A read is already in progress on this connection")]
    Concurrent,

    #[error("Connection closed")]
    Closed,
}

pub struct MessageReader {
    transport: Arc<StreamTransport>,
    outstanding: AtomicUsize,
    peak: AtomicUsize,
}

/// Counts one in-flight read; released even when the read is cancelled
struct ReadGuard<'a>(&'a AtomicUsize);

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl MessageReader {
    pub fn new(transport: Arc<StreamTransport>) -> Self {
        Self {
            transport,
            outstanding: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Reads currently in flight; never more than one
    pub fn outstanding_reads(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Most reads ever in flight at once
    pub fn peak_outstanding_reads(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    fn enter(&self) -> Result<ReadGuard<'_>, ReadError> {
        let now = self.outstanding.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        let guard = ReadGuard(&self.outstanding);
        if now > 1 {
            return Err(ReadError::Concurrent);
        }
        Ok(guard)
    }

    fn advance(state: &StateCell, next: ConnectionState) -> Result<(), ReadError> {
        if state.advance(next) {
            Ok(())
        } else {
            Err(ReadError::Closed)
        }
    }

    /// Read the next complete message, moving `state` through the read phases
    pub async fn read_next_message(&self, state: &StateCell) -> Result<InboundMessage, ReadError> {
        let _guard = self.enter()?;

        Self::advance(state, ConnectionState::AwaitingHeader)?;
        let mut header = [0u8; HEADER_LEN];
        self.transport.receive(&mut header).await?;

        Self::advance(state, ConnectionState::AwaitingBody)?;
        let mut body = vec![0u8; body_len(header)];
        self.transport.receive(&mut body).await?;
        let invocation = Invocation::decode(&body)?;

        let declared = invocation.side_channel_fds;
        let fds = if declared > 0 {
            if declared as usize > MAX_FDS_PER_MESSAGE {
                return Err(ReadError::TooManyFds(declared));
            }
            Self::advance(state, ConnectionState::AwaitingFds)?;
            let mut carrier = [0u8; 1];
            self.transport
                .receive_with_fds(&mut carrier, declared as usize)
                .await?
        } else {
            Vec::new()
        };

        Ok(InboundMessage { invocation, fds })
    }
}
