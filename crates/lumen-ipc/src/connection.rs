//! One accepted client connection and its read loop

use lumen_util::ConnectionId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    ConnectionRegistry, ConnectionState, CredentialGate, DisplayServer, Dispatcher, GateError,
    InboundMessage, MessageReader, MethodTable, ReadError, ResourceCache, ResponseSender,
    SessionCredentials, StateCell, StreamTransport, TransportError, TransportObserver,
};

/// State shared by every connection of one server
#[derive(Clone)]
pub struct ConnectionShared {
    pub table: Arc<MethodTable>,
    pub cache: Arc<ResourceCache>,
    pub registry: Arc<ConnectionRegistry>,
    pub runtime: Handle,
}

/// How the read loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    /// Write out completed responses before tearing down
    Flush,
    Immediate,
}

/// Removes the connection as soon as the transport sees the peer go away
struct DisconnectObserver {
    registry: Weak<ConnectionRegistry>,
    id: ConnectionId,
}

impl TransportObserver for DisconnectObserver {
    fn on_disconnected(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

pub struct SocketConnection {
    id: ConnectionId,
    transport: Arc<StreamTransport>,
    reader: MessageReader,
    gate: CredentialGate,
    dispatcher: Dispatcher,
    sender: Arc<ResponseSender>,
    cache: Arc<ResourceCache>,
    state: StateCell,
    cancel: CancellationToken,
    /// Held while a handler runs; teardown waits on it
    dispatch_lock: Mutex<()>,
    closed: AtomicBool,
}

impl SocketConnection {
    pub fn new(
        id: ConnectionId,
        transport: Arc<StreamTransport>,
        gate: CredentialGate,
        server: Arc<dyn DisplayServer>,
        shared: &ConnectionShared,
    ) -> Arc<Self> {
        let registry = Arc::downgrade(&shared.registry);
        let on_failure = {
            let registry = registry.clone();
            Arc::new(move |id: ConnectionId| {
                if let Some(registry) = registry.upgrade() {
                    registry.remove(id);
                }
            })
        };
        let sender = Arc::new(
            ResponseSender::new(
                id,
                transport.clone(),
                shared.cache.clone(),
                shared.runtime.clone(),
            )
            .with_failure_hook(on_failure),
        );
        let dispatcher = Dispatcher::new(id, server, shared.table.clone(), sender.clone());
        transport.register_observer(Arc::new(DisconnectObserver { registry, id }));

        Arc::new(Self {
            id,
            reader: MessageReader::new(transport.clone()),
            transport,
            gate,
            dispatcher,
            sender,
            cache: shared.cache.clone(),
            state: StateCell::new(),
            cancel: CancellationToken::new(),
            dispatch_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn credentials(&self) -> Result<SessionCredentials, GateError> {
        self.gate.credentials()
    }

    pub fn client_pid(&self) -> Result<i32, GateError> {
        self.gate.client_pid()
    }

    pub fn reader(&self) -> &MessageReader {
        &self.reader
    }

    pub fn transport(&self) -> &Arc<StreamTransport> {
        &self.transport
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Read and dispatch until the client leaves or misbehaves, then remove
    /// the connection from `registry`
    pub async fn run(self: Arc<Self>, registry: Weak<ConnectionRegistry>) {
        let stop = self.read_loop().await;
        if stop == Stop::Flush {
            self.sender
                .flush(self.transport.settings().send_timeout)
                .await;
        }
        match registry.upgrade() {
            Some(registry) => {
                registry.remove(self.id);
            }
            None => self.close(),
        }
    }

    async fn read_one(&self) -> Result<InboundMessage, ReadError> {
        self.transport.wait_readable().await?;
        self.reader.read_next_message(&self.state).await
    }

    async fn read_loop(&self) -> Stop {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Stop::Immediate,
                next = self.read_one() => next,
            };

            let message = match next {
                Ok(message) => message,
                Err(ReadError::Transport(TransportError::PeerDisconnected)) => {
                    info!(connection_id = %self.id, "Client disconnected");
                    return Stop::Immediate;
                }
                Err(ReadError::Closed | ReadError::Transport(TransportError::Closed)) => {
                    debug!(connection_id = %self.id, "Read loop stopped by close");
                    return Stop::Immediate;
                }
                Err(e) => {
                    warn!(connection_id = %self.id, error = %e, "Failed to read message");
                    return Stop::Immediate;
                }
            };

            if let Err(e) = self.gate.admit(&message.invocation) {
                warn!(
                    connection_id = %self.id,
                    invocation_id = message.invocation.id,
                    error = %e,
                    "Rejecting client"
                );
                return Stop::Immediate;
            }

            let keep_reading = {
                let _dispatching = self
                    .dispatch_lock
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if self.is_closed() || !self.state.advance(ConnectionState::Dispatching) {
                    return Stop::Immediate;
                }
                self.dispatcher
                    .dispatch(message.invocation, message.fds)
            };
            if !keep_reading {
                return Stop::Flush;
            }
        }
    }

    /// Tear the connection down. Idempotent.
    ///
    /// Waits for a running handler to return, so it must not be called from
    /// inside a handler of this same connection.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _dispatching = self
            .dispatch_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.state.close();
        self.cancel.cancel();
        self.sender.close();
        self.transport.close();
        let released = self.cache.release_connection(self.id);
        debug!(connection_id = %self.id, released, "Connection closed");
    }
}
