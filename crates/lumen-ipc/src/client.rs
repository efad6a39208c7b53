//! IPC client implementation

use lumen_protocol::{
    FdSets, HEADER_LEN, Invocation, Method, ParameterMessage, ProtocolVersion, ResultEnvelope,
    ResultMessage, body_len, encode,
};
use std::os::fd::OwnedFd;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::{IpcError, IpcResult, StreamTransport, TransportSettings};

/// Client end of a session connection.
///
/// Requests carry the current protocol version unless told otherwise.
/// Descriptors attached to request parameters travel as one group after the
/// body.
pub struct RpcClient {
    transport: Arc<StreamTransport>,
    next_invocation_id: u32,
    protocol_version: Option<ProtocolVersion>,
    disconnected: bool,
}

impl RpcClient {
    /// Connect to a lumen server
    pub async fn connect(socket_path: impl AsRef<Path>) -> IpcResult<Self> {
        let transport =
            StreamTransport::connect(socket_path, TransportSettings::default()).await?;
        Ok(Self::from_transport(transport))
    }

    pub fn from_transport(transport: StreamTransport) -> Self {
        Self {
            transport: Arc::new(transport),
            next_invocation_id: 1,
            protocol_version: Some(lumen_protocol::CURRENT_PROTOCOL_VERSION),
            disconnected: false,
        }
    }

    /// Speak a different protocol version, or none at all
    pub fn with_protocol_version(mut self, version: Option<ProtocolVersion>) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn transport(&self) -> &Arc<StreamTransport> {
        &self.transport
    }

    /// Whether `disconnect` has been sent; later calls fail without I/O
    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Send one request and return its invocation id
    pub async fn send_invocation<P: ParameterMessage>(
        &mut self,
        method: Method,
        mut params: P,
    ) -> IpcResult<u32> {
        if self.disconnected {
            return Err(IpcError::ConnectionClosed);
        }

        let fds: Vec<OwnedFd> = params
            .extract_fds()
            .into_groups()
            .into_iter()
            .flatten()
            .collect();
        let id = self.next_invocation_id;
        self.next_invocation_id = self.next_invocation_id.wrapping_add(1);

        let invocation = Invocation::new(id, method, encode(&params)?, fds.len() as u32)
            .with_protocol_version(self.protocol_version);
        self.send_raw(&invocation, fds).await?;

        if method.is_terminal() {
            self.disconnected = true;
        }
        Ok(id)
    }

    /// Send a hand-built invocation with its descriptors
    pub async fn send_raw(&self, invocation: &Invocation, fds: Vec<OwnedFd>) -> IpcResult<()> {
        let mut groups = FdSets::new();
        groups.push(fds);
        self.transport.send(&invocation.to_frame()?, &groups).await?;
        debug!(
            invocation_id = invocation.id,
            method = %invocation.method_name,
            "Sent invocation"
        );
        Ok(())
    }

    /// Read the next response and reattach its descriptors
    pub async fn receive<R: ResultMessage>(&mut self) -> IpcResult<(u32, R)> {
        let mut header = [0u8; HEADER_LEN];
        self.transport.receive(&mut header).await?;
        let mut body = vec![0u8; body_len(header)];
        self.transport.receive(&mut body).await?;

        let envelope = ResultEnvelope::decode(&body)?;
        let mut result: R = envelope.result()?;

        let mut groups = Vec::new();
        for expected in result.declared_fd_groups() {
            let mut carrier = [0u8; 1];
            groups.push(self.transport.receive_with_fds(&mut carrier, expected).await?);
        }
        result.attach_fds(groups)?;

        Ok((envelope.id, result))
    }

    /// Send a request and wait for its response
    pub async fn call<P, R>(&mut self, method: Method, params: P) -> IpcResult<R>
    where
        P: ParameterMessage,
        R: ResultMessage,
    {
        let id = self.send_invocation(method, params).await?;
        let (response_id, result) = self.receive::<R>().await?;
        if response_id != id {
            return Err(IpcError::InvalidMessage(format!(
                "response {response_id} does not answer request {id}"
            )));
        }
        Ok(result)
    }

    /// Like [`RpcClient::call`], with a reported handler error turned into
    /// [`IpcError::ServerError`]
    pub async fn call_checked<P, R>(&mut self, method: Method, params: P) -> IpcResult<R>
    where
        P: ParameterMessage,
        R: ResultMessage,
    {
        let result: R = self.call(method, params).await?;
        match result.error() {
            Some(message) => Err(IpcError::ServerError(message.to_string())),
            None => Ok(result),
        }
    }
}
