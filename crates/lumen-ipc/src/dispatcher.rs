//! Method dispatch
//!
//! Each invocation is routed by method name to a [`DisplayServer`] handler.
//! Handlers are synchronous and receive a [`Completion`] they may finish
//! immediately or hand to another thread to finish later.

use lumen_protocol::{
    Buffer, BufferSubmission, ConnectParameters, Connection, DisplayConfiguration, FdAttachError,
    FdGroup, Invocation, Method, ParameterMessage, ResultMessage, Screencast, ScreencastId,
    ScreencastParameters, Surface, SurfaceId, SurfaceParameters, Void, WireError, decode,
};
use lumen_util::{ConnectionId, LumenError};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::os::fd::OwnedFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::{Resource, Responder, ResponseSender};

/// Error returned by a handler; reported to the client in the result's error
/// field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn unsupported(method: Method) -> Self {
        Self::new(format!("{method} is not supported by this server"))
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<LumenError> for HandlerError {
    fn from(e: LumenError) -> Self {
        Self::new(e.to_string())
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(e: std::io::Error) -> Self {
        Self::new(e.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// Pending answer to one request.
///
/// Finishing it queues the response. Dropping it unfinished releases anything
/// retained for it; the dispatcher still answers if the handler failed.
pub struct Completion<R> {
    responder: Responder,
    _result: PhantomData<fn(R)>,
}

impl<R: ResultMessage> Completion<R> {
    pub fn new(responder: Responder) -> Self {
        Self {
            responder,
            _result: PhantomData,
        }
    }

    pub fn invocation_id(&self) -> u32 {
        self.responder.invocation_id()
    }

    /// Keep `resource` alive until the response has been written
    pub fn retain(&self, resource: Resource) {
        self.responder.retain(resource);
    }

    pub fn complete(self, result: R) {
        self.responder.respond(result);
    }

    pub fn fail(self, message: impl Into<String>) {
        self.complete(R::failed(message));
    }
}

impl<R> Drop for Completion<R> {
    fn drop(&mut self) {
        if !self.responder.is_answered() {
            trace!(
                invocation_id = self.responder.invocation_id(),
                "Completion dropped unanswered"
            );
            self.responder.release_resources();
        }
    }
}

/// Session-level operations a connected client can invoke.
///
/// Every method returns once the request has been accepted. The response is
/// sent when `done` is completed, which may happen later on any thread.
/// Returning `Err` answers the request with the error instead; the
/// connection stays open.
pub trait DisplayServer: Send + Sync {
    fn connect(&self, _params: ConnectParameters, _done: Completion<Connection>) -> HandlerResult {
        Err(HandlerError::unsupported(Method::Connect))
    }

    fn create_surface(
        &self,
        _params: SurfaceParameters,
        _done: Completion<Surface>,
    ) -> HandlerResult {
        Err(HandlerError::unsupported(Method::CreateSurface))
    }

    fn next_buffer(&self, _params: SurfaceId, _done: Completion<Buffer>) -> HandlerResult {
        Err(HandlerError::unsupported(Method::NextBuffer))
    }

    fn submit_buffer(&self, _params: BufferSubmission, _done: Completion<Void>) -> HandlerResult {
        Err(HandlerError::unsupported(Method::SubmitBuffer))
    }

    fn release_surface(&self, _params: SurfaceId, _done: Completion<Void>) -> HandlerResult {
        Err(HandlerError::unsupported(Method::ReleaseSurface))
    }

    fn configure_display(
        &self,
        _params: DisplayConfiguration,
        _done: Completion<DisplayConfiguration>,
    ) -> HandlerResult {
        Err(HandlerError::unsupported(Method::ConfigureDisplay))
    }

    fn create_screencast(
        &self,
        _params: ScreencastParameters,
        _done: Completion<Screencast>,
    ) -> HandlerResult {
        Err(HandlerError::unsupported(Method::CreateScreencast))
    }

    fn screencast_buffer(&self, _params: ScreencastId, _done: Completion<Buffer>) -> HandlerResult {
        Err(HandlerError::unsupported(Method::ScreencastBuffer))
    }

    fn release_screencast(&self, _params: ScreencastId, _done: Completion<Void>) -> HandlerResult {
        Err(HandlerError::unsupported(Method::ReleaseScreencast))
    }

    fn disconnect(&self, _params: Void, done: Completion<Void>) -> HandlerResult {
        done.complete(Void::default());
        Ok(())
    }
}

/// Why an invocation could not be handed to its handler
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Unknown method {0:?}")]
    UnknownMethod(String),

    #[error("Malformed parameters: {0}")]
    Decode(#[from] WireError),

    #[error("Descriptors do not match the parameters: {0}")]
    Fds(#[from] FdAttachError),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

/// What happened once a handler ran
enum Handled {
    Accepted,
    Failed(HandlerError),
}

struct Call {
    parameters: Vec<u8>,
    fds: Vec<OwnedFd>,
    responder: Responder,
}

type Invoker =
    Box<dyn Fn(&dyn DisplayServer, Call) -> Result<Handled, DispatchError> + Send + Sync>;

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Decode the parameters, reattach request descriptors and run the handler
fn bind<P, R>(handler: fn(&dyn DisplayServer, P, Completion<R>) -> HandlerResult) -> Invoker
where
    P: ParameterMessage,
    R: ResultMessage,
{
    Box::new(move |server: &dyn DisplayServer, call: Call| {
        let Call {
            parameters,
            fds,
            responder,
        } = call;

        let mut params: P = decode(&parameters)?;
        let groups: Vec<FdGroup> = if fds.is_empty() { Vec::new() } else { vec![fds] };
        params.attach_fds(groups)?;

        let done = Completion::<R>::new(responder.clone());
        match panic::catch_unwind(AssertUnwindSafe(|| handler(server, params, done))) {
            Ok(Ok(())) => Ok(Handled::Accepted),
            Ok(Err(e)) => {
                responder.respond(R::failed(e.message()));
                Ok(Handled::Failed(e))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                responder.respond(R::failed(format!("internal error: {message}")));
                Err(DispatchError::Panicked(message))
            }
        }
    })
}

/// Method name to handler routing
pub struct MethodTable {
    entries: HashMap<&'static str, (Method, Invoker)>,
}

impl MethodTable {
    pub fn new() -> Self {
        let mut table = Self {
            entries: HashMap::new(),
        };
        table.register(
            Method::Connect,
            bind::<ConnectParameters, Connection>(|s, p, d| s.connect(p, d)),
        );
        table.register(
            Method::CreateSurface,
            bind::<SurfaceParameters, Surface>(|s, p, d| s.create_surface(p, d)),
        );
        table.register(
            Method::NextBuffer,
            bind::<SurfaceId, Buffer>(|s, p, d| s.next_buffer(p, d)),
        );
        table.register(
            Method::SubmitBuffer,
            bind::<BufferSubmission, Void>(|s, p, d| s.submit_buffer(p, d)),
        );
        table.register(
            Method::ReleaseSurface,
            bind::<SurfaceId, Void>(|s, p, d| s.release_surface(p, d)),
        );
        table.register(
            Method::ConfigureDisplay,
            bind::<DisplayConfiguration, DisplayConfiguration>(|s, p, d| s.configure_display(p, d)),
        );
        table.register(
            Method::CreateScreencast,
            bind::<ScreencastParameters, Screencast>(|s, p, d| s.create_screencast(p, d)),
        );
        table.register(
            Method::ScreencastBuffer,
            bind::<ScreencastId, Buffer>(|s, p, d| s.screencast_buffer(p, d)),
        );
        table.register(
            Method::ReleaseScreencast,
            bind::<ScreencastId, Void>(|s, p, d| s.release_screencast(p, d)),
        );
        table.register(
            Method::Disconnect,
            bind::<Void, Void>(|s, p, d| s.disconnect(p, d)),
        );
        table
    }

    fn register(&mut self, method: Method, invoker: Invoker) {
        self.entries.insert(method.name(), (method, invoker));
    }

    pub fn lookup(&self, name: &str) -> Option<Method> {
        self.entries.get(name).map(|(method, _)| *method)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MethodTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes one connection's invocations to its session handlers
pub struct Dispatcher {
    connection_id: ConnectionId,
    server: Arc<dyn DisplayServer>,
    table: Arc<MethodTable>,
    sender: Arc<ResponseSender>,
}

impl Dispatcher {
    pub fn new(
        connection_id: ConnectionId,
        server: Arc<dyn DisplayServer>,
        table: Arc<MethodTable>,
        sender: Arc<ResponseSender>,
    ) -> Self {
        Self {
            connection_id,
            server,
            table,
            sender,
        }
    }

    /// Run the handler for `invocation`.
    ///
    /// Returns whether the connection should keep reading. It stops after a
    /// terminal method, an unknown method, undecodable parameters,
    /// mismatched descriptors or a handler panic. A handler error is answered
    /// and reading continues.
    pub fn dispatch(&self, invocation: Invocation, fds: Vec<OwnedFd>) -> bool {
        match self.try_dispatch(invocation, fds) {
            Ok((method, Handled::Accepted)) => !method.is_terminal(),
            Ok((method, Handled::Failed(e))) => {
                debug!(
                    connection_id = %self.connection_id,
                    method = %method,
                    error = %e,
                    "Handler reported an error"
                );
                !method.is_terminal()
            }
            Err(DispatchError::Panicked(message)) => {
                error!(
                    connection_id = %self.connection_id,
                    panic = %message,
                    "Handler panicked; closing connection"
                );
                false
            }
            Err(e) => {
                warn!(
                    connection_id = %self.connection_id,
                    error = %e,
                    "Rejecting invocation; closing connection"
                );
                false
            }
        }
    }

    fn try_dispatch(
        &self,
        invocation: Invocation,
        fds: Vec<OwnedFd>,
    ) -> Result<(Method, Handled), DispatchError> {
        let Some((method, invoke)) = self.table.entries.get(invocation.method_name.as_str()) else {
            return Err(DispatchError::UnknownMethod(invocation.method_name));
        };

        let call = Call {
            parameters: invocation.parameters,
            fds,
            responder: self.sender.responder(invocation.id),
        };
        debug!(
            connection_id = %self.connection_id,
            invocation_id = invocation.id,
            method = %method,
            "Dispatching"
        );
        let handled = invoke(self.server.as_ref(), call)?;
        Ok((*method, handled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        MessageReader, ResourceCache, RpcClient, StateCell, StreamTransport, TransportSettings,
    };
    use lumen_protocol::{HEADER_LEN, ResultEnvelope, SideChannel, body_len, encode};
    use lumen_util::FdIdentity;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::runtime::Handle;

    #[derive(Default)]
    struct Recording {
        submitted: Mutex<Vec<Vec<FdIdentity>>>,
        parked: Mutex<Option<Completion<Buffer>>>,
    }

    impl DisplayServer for Recording {
        fn create_surface(
            &self,
            params: SurfaceParameters,
            done: Completion<Surface>,
        ) -> HandlerResult {
            if params.width <= 0 {
                return Err(HandlerError::new("width must be positive"));
            }
            done.complete(Surface {
                id: Some(SurfaceId { value: 1 }),
                width: params.width,
                height: params.height,
                ..Default::default()
            });
            Ok(())
        }

        fn next_buffer(&self, _params: SurfaceId, done: Completion<Buffer>) -> HandlerResult {
            *self.parked.lock().unwrap() = Some(done);
            Ok(())
        }

        fn submit_buffer(
            &self,
            params: BufferSubmission,
            done: Completion<Void>,
        ) -> HandlerResult {
            let identities = params
                .buffer
                .side_channel
                .fds
                .iter()
                .map(|fd| FdIdentity::of(fd).unwrap())
                .collect();
            self.submitted.lock().unwrap().push(identities);
            done.complete(Void::default());
            Ok(())
        }

        fn release_surface(&self, _params: SurfaceId, _done: Completion<Void>) -> HandlerResult {
            panic!("release exploded");
        }
    }

    struct Harness {
        client: StreamTransport,
        dispatcher: Dispatcher,
        server: Arc<Recording>,
        sender: Arc<ResponseSender>,
    }

    fn harness() -> Harness {
        let (client, server_end) = StreamTransport::pair(TransportSettings::default()).unwrap();
        harness_on(client, Arc::new(server_end))
    }

    fn harness_on(client: StreamTransport, server_end: Arc<StreamTransport>) -> Harness {
        let id = ConnectionId::from_raw(1);
        let sender = Arc::new(ResponseSender::new(
            id,
            server_end,
            Arc::new(ResourceCache::new()),
            Handle::current(),
        ));
        let server = Arc::new(Recording::default());
        let dispatcher = Dispatcher::new(
            id,
            server.clone(),
            Arc::new(MethodTable::new()),
            sender.clone(),
        );
        Harness {
            client,
            dispatcher,
            server,
            sender,
        }
    }

    fn invocation<P: ParameterMessage>(
        id: u32,
        method: Method,
        params: &P,
        fds: u32,
    ) -> Invocation {
        Invocation::new(id, method, encode(params).unwrap(), fds)
    }

    async fn read_envelope(client: &StreamTransport) -> ResultEnvelope {
        let mut header = [0u8; HEADER_LEN];
        client.receive(&mut header).await.unwrap();
        let mut body = vec![0u8; body_len(header)];
        client.receive(&mut body).await.unwrap();
        ResultEnvelope::decode(&body).unwrap()
    }

    #[test]
    fn table_covers_every_method() {
        let table = MethodTable::new();
        assert_eq!(table.len(), Method::ALL.len());
        for method in Method::ALL {
            assert_eq!(table.lookup(method.name()), Some(method));
        }
        assert_eq!(table.lookup("drop_tables"), None);
    }

    #[tokio::test]
    async fn immediate_completion_is_answered() {
        let h = harness();
        let params = SurfaceParameters {
            width: 32,
            height: 16,
            ..Default::default()
        };
        assert!(
            h.dispatcher
                .dispatch(invocation(5, Method::CreateSurface, &params, 0), Vec::new())
        );

        let envelope = read_envelope(&h.client).await;
        assert_eq!(envelope.id, 5);
        let surface: Surface = envelope.result().unwrap();
        assert_eq!(surface.width, 32);
        assert!(surface.error.is_none());
    }

    #[tokio::test]
    async fn handler_error_is_answered_and_reading_continues() {
        let h = harness();
        let params = SurfaceParameters::default();
        assert!(
            h.dispatcher
                .dispatch(invocation(6, Method::CreateSurface, &params, 0), Vec::new())
        );

        let surface: Surface = read_envelope(&h.client).await.result().unwrap();
        assert_eq!(surface.error.as_deref(), Some("width must be positive"));
    }

    #[tokio::test]
    async fn deferred_completion_answers_later() {
        let h = harness();
        assert!(h.dispatcher.dispatch(
            invocation(7, Method::NextBuffer, &SurfaceId { value: 1 }, 0),
            Vec::new()
        ));
        let done = h.server.parked.lock().unwrap().take().unwrap();

        std::thread::spawn(move || {
            done.complete(Buffer {
                buffer_id: 3,
                ..Default::default()
            })
        })
        .join()
        .unwrap();

        let envelope = read_envelope(&h.client).await;
        assert_eq!(envelope.id, 7);
        let buffer: Buffer = envelope.result().unwrap();
        assert_eq!(buffer.buffer_id, 3);
    }

    #[tokio::test]
    async fn dropped_completion_sends_nothing() {
        let h = harness();
        h.dispatcher.dispatch(
            invocation(8, Method::NextBuffer, &SurfaceId { value: 1 }, 0),
            Vec::new(),
        );
        drop(h.server.parked.lock().unwrap().take());
        assert!(h.sender.flush(Duration::from_secs(1)).await);

        let mut byte = [0u8; 1];
        let pending = tokio::time::timeout(Duration::from_millis(50), h.client.receive(&mut byte));
        assert!(pending.await.is_err());
    }

    #[tokio::test]
    async fn request_fds_reach_the_handler() {
        let h = harness();
        let submission = BufferSubmission {
            surface_id: SurfaceId { value: 1 },
            buffer: Buffer {
                side_channel: SideChannel {
                    fds_on_side_channel: 2,
                    fds: Vec::new(),
                },
                ..Default::default()
            },
        };
        let fds: Vec<OwnedFd> = (0..2)
            .map(|_| tempfile::tempfile().unwrap().into())
            .collect();
        let sent: Vec<FdIdentity> = fds.iter().map(|fd| FdIdentity::of(fd).unwrap()).collect();
        assert!(
            h.dispatcher
                .dispatch(invocation(9, Method::SubmitBuffer, &submission, 2), fds)
        );
        assert_eq!(*h.server.submitted.lock().unwrap(), vec![sent]);
    }

    #[tokio::test]
    async fn fds_cross_the_socket_in_order() {
        let (client_end, server_end) =
            StreamTransport::pair(TransportSettings::default()).unwrap();
        let server_end = Arc::new(server_end);
        let reader = MessageReader::new(server_end.clone());
        // Responses go back to `client`; the harness end stays idle
        let (idle, _idle_peer) = StreamTransport::pair(TransportSettings::default()).unwrap();
        let h = harness_on(idle, server_end);
        let mut client = RpcClient::from_transport(client_end);

        let fds: Vec<OwnedFd> = (0..2)
            .map(|_| tempfile::tempfile().unwrap().into())
            .collect();
        let sent: Vec<FdIdentity> = fds.iter().map(|fd| FdIdentity::of(fd).unwrap()).collect();
        let submission = BufferSubmission {
            surface_id: SurfaceId { value: 1 },
            buffer: Buffer {
                side_channel: SideChannel::with_fds(fds),
                ..Default::default()
            },
        };
        let id = client
            .send_invocation(Method::SubmitBuffer, submission)
            .await
            .unwrap();

        let message = reader.read_next_message(&StateCell::new()).await.unwrap();
        assert_eq!(message.invocation.id, id);
        assert_eq!(message.invocation.side_channel_fds, 2);
        assert!(h.dispatcher.dispatch(message.invocation, message.fds));

        assert_eq!(*h.server.submitted.lock().unwrap(), vec![sent]);
        let (response_id, _void) = client.receive::<Void>().await.unwrap();
        assert_eq!(response_id, id);
    }

    #[tokio::test]
    async fn unexpected_fds_stop_the_connection() {
        let h = harness();
        let fds: Vec<OwnedFd> = vec![tempfile::tempfile().unwrap().into()];
        assert!(!h.dispatcher.dispatch(
            invocation(10, Method::NextBuffer, &SurfaceId { value: 1 }, 1),
            fds
        ));
        assert!(h.server.parked.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_method_stops_the_connection() {
        let h = harness();
        let mut bogus = invocation(11, Method::Connect, &ConnectParameters::default(), 0);
        bogus.method_name = "launch_missiles".into();
        assert!(!h.dispatcher.dispatch(bogus, Vec::new()));
    }

    #[tokio::test]
    async fn malformed_parameters_stop_the_connection() {
        let h = harness();
        let mut garbled = invocation(12, Method::CreateSurface, &SurfaceParameters::default(), 0);
        garbled.parameters = vec![0xff];
        assert!(!h.dispatcher.dispatch(garbled, Vec::new()));
    }

    #[tokio::test]
    async fn panic_is_answered_then_stops_the_connection() {
        let h = harness();
        assert!(!h.dispatcher.dispatch(
            invocation(13, Method::ReleaseSurface, &SurfaceId { value: 1 }, 0),
            Vec::new()
        ));

        let void: Void = read_envelope(&h.client).await.result().unwrap();
        assert!(void.error.unwrap().contains("release exploded"));
    }

    #[tokio::test]
    async fn disconnect_is_answered_and_terminal() {
        let h = harness();
        assert!(!h.dispatcher.dispatch(
            invocation(14, Method::Disconnect, &Void::default(), 0),
            Vec::new()
        ));
        assert_eq!(read_envelope(&h.client).await.id, 14);
    }

    #[tokio::test]
    async fn unimplemented_methods_answer_with_an_error() {
        let h = harness();
        assert!(h.dispatcher.dispatch(
            invocation(15, Method::ReleaseScreencast, &ScreencastId { value: 1 }, 0),
            Vec::new()
        ));
        let void: Void = read_envelope(&h.client).await.result().unwrap();
        assert!(void.error.unwrap().contains("release_screencast"));
    }
}
