//! IPC server: listening socket, connection creation and shutdown

use lumen_util::ConnectionId;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::{
    ConnectionContext, ConnectionRegistry, ConnectionShared, CredentialGate, DisplayServer,
    IpcError, IpcResult, MethodTable, ResourceCache, SessionAuthorizer, SessionCredentials,
    SocketConnection, StreamTransport, TransportSettings,
};

/// Builds the per-session handlers for a newly admitted client
pub trait IpcFactory: Send + Sync {
    fn make_ipc_server(
        &self,
        credentials: &SessionCredentials,
        context: &ConnectionContext,
    ) -> Arc<dyn DisplayServer>;
}

/// IPC Server
pub struct IpcServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    factory: Arc<dyn IpcFactory>,
    authorizer: Arc<dyn SessionAuthorizer>,
    settings: TransportSettings,
    registry: Arc<ConnectionRegistry>,
    cache: Arc<ResourceCache>,
    table: Arc<MethodTable>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    /// Runtime that connection tasks are spawned on
    runtime: Option<Handle>,
}

impl IpcServer {
    pub fn new(
        socket_path: impl AsRef<Path>,
        factory: Arc<dyn IpcFactory>,
        authorizer: Arc<dyn SessionAuthorizer>,
        settings: TransportSettings,
    ) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            listener: None,
            factory,
            authorizer,
            settings,
            registry: Arc::new(ConnectionRegistry::new()),
            cache: Arc::new(ResourceCache::new()),
            table: Arc::new(MethodTable::new()),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            runtime: Handle::try_current().ok(),
        }
    }

    /// Start listening
    pub async fn start(&mut self) -> IpcResult<()> {
        if let Ok(runtime) = Handle::try_current() {
            self.runtime = Some(runtime);
        }

        // Remove existing socket if present
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        // Readable/writable by owner and group
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o660))?;

        info!(path = %self.socket_path.display(), "IPC server listening");

        self.listener = Some(listener);

        Ok(())
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until [`IpcServer::stop`] is called
    pub async fn run(&self) -> IpcResult<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| IpcError::ServerError("Server not started".into()))?;

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Accept loop stopped");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, _)) => {
                    let context = ConnectionContext::listener();
                    if let Err(e) = self.create_connection_for(stream, context) {
                        warn!(error = %e, "Failed to set up connection");
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Admit a connected socket as a client session.
    ///
    /// Returns the new connection id, or `None` when the authorizer refuses
    /// the peer. May be called from any thread once the server knows its
    /// runtime, either because it was built inside one or was started.
    pub fn create_connection_for(
        &self,
        stream: UnixStream,
        context: ConnectionContext,
    ) -> IpcResult<Option<ConnectionId>> {
        if self.shutdown.is_cancelled() {
            return Err(IpcError::ServerError("Server is shutting down".into()));
        }
        let Some(runtime) = self.runtime.clone() else {
            return Err(IpcError::ServerError(
                "Server has no runtime to run connections on".into(),
            ));
        };

        let transport = Arc::new(StreamTransport::new(stream, self.settings.clone())?);
        let gate = CredentialGate::new(transport.clone(), context.credentials);
        let credentials = match gate.credentials() {
            Ok(credentials) => credentials,
            Err(e) => {
                transport.close();
                return Err(e.into());
            }
        };

        if !self.authorizer.connection_is_allowed(&credentials) {
            info!(
                pid = credentials.pid(),
                uid = credentials.uid(),
                "Connection refused by session authorizer"
            );
            transport.close();
            return Ok(None);
        }

        let id = self.registry.next_id();
        let server = self.factory.make_ipc_server(&credentials, &context);
        let shared = ConnectionShared {
            table: self.table.clone(),
            cache: self.cache.clone(),
            registry: self.registry.clone(),
            runtime: runtime.clone(),
        };
        let connection = SocketConnection::new(id, transport, gate, server, &shared);
        self.registry.add(connection.clone());

        info!(
            connection_id = %id,
            pid = credentials.pid(),
            uid = credentials.uid(),
            origin = ?context.origin,
            "Client connected"
        );

        self.tasks
            .spawn_on(connection.run(Arc::downgrade(&self.registry)), &runtime);
        Ok(Some(id))
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn resource_cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    /// Get connected client count
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Stop accepting, finish outstanding requests and close every
    /// connection.
    ///
    /// `force_requests_to_complete` runs before connections are closed so
    /// that handlers blocked on deferred work can return.
    pub async fn stop(&self, force_requests_to_complete: impl FnOnce()) {
        info!("Stopping IPC server");
        self.shutdown.cancel();
        self.remove_socket();

        force_requests_to_complete();
        let closed = self.registry.clear();

        self.tasks.close();
        self.tasks.wait().await;
        info!(connections = closed, "IPC server stopped");
    }

    fn remove_socket(&self) {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.remove_socket();
    }
}
