//! Wiring sessions to the configured authorization policy

use lumen_config::AuthorizationPolicy;
use lumen_ipc::{
    ConnectionContext, ConnectionOrigin, DisplayServer, IpcFactory, SessionAuthorizer,
    SessionCredentials,
};
use std::sync::Arc;
use tracing::debug;

use crate::{BufferExecutor, DisplayState, SessionMediator, SessionPermissions};

/// Authorizer backed by the `[authorization]` config section
#[derive(Debug, Clone)]
pub struct PolicyAuthorizer {
    policy: AuthorizationPolicy,
}

impl PolicyAuthorizer {
    pub fn new(policy: AuthorizationPolicy) -> Self {
        Self { policy }
    }
}

impl SessionAuthorizer for PolicyAuthorizer {
    fn connection_is_allowed(&self, credentials: &SessionCredentials) -> bool {
        self.policy.uid_is_allowed(credentials.uid())
    }

    fn configure_display_is_allowed(&self, _credentials: &SessionCredentials) -> bool {
        self.policy.allow_display_configuration
    }

    fn screencast_is_allowed(&self, _credentials: &SessionCredentials) -> bool {
        self.policy.allow_screencast
    }
}

/// Builds a [`SessionMediator`] for every admitted connection
pub struct MediatorFactory {
    display: Arc<DisplayState>,
    executor: Arc<BufferExecutor>,
    authorizer: Arc<dyn SessionAuthorizer>,
}

impl MediatorFactory {
    pub fn new(
        display: Arc<DisplayState>,
        executor: Arc<BufferExecutor>,
        authorizer: Arc<dyn SessionAuthorizer>,
    ) -> Self {
        Self {
            display,
            executor,
            authorizer,
        }
    }

    pub fn permissions_for(
        &self,
        credentials: &SessionCredentials,
        context: &ConnectionContext,
    ) -> SessionPermissions {
        // Helpers spawned by the server itself are not subject to policy
        if context.origin == ConnectionOrigin::TrustedHelper {
            return SessionPermissions::all();
        }
        SessionPermissions {
            screencast: self.authorizer.screencast_is_allowed(credentials),
            display_configuration: self.authorizer.configure_display_is_allowed(credentials),
        }
    }
}

impl IpcFactory for MediatorFactory {
    fn make_ipc_server(
        &self,
        credentials: &SessionCredentials,
        context: &ConnectionContext,
    ) -> Arc<dyn DisplayServer> {
        let permissions = self.permissions_for(credentials, context);
        debug!(
            pid = credentials.pid(),
            origin = ?context.origin,
            ?permissions,
            "Creating session mediator"
        );
        Arc::new(SessionMediator::new(
            *credentials,
            permissions,
            self.display.clone(),
            self.executor.clone(),
        ))
    }
}
