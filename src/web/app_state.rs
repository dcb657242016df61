use std::sync::Arc;

use crate::engine::connection::ConnectionHandler;
use crate::engine::registry::SessionRegistry;
use crate::engine::router::MessageRouter;
use crate::engine::store::ChatStore;

/// Shared application state available to all HTTP/WebSocket handlers.
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub router: Arc<MessageRouter>,
    pub handler: ConnectionHandler,
    pub store: Arc<dyn ChatStore>,
}

impl AppState {
    /// Wire the core around one store: a fresh registry, a router over it,
    /// and a connection handler observing `shutdown`.
    pub fn new(
        store: Arc<dyn ChatStore>,
        config: &crate::config::ServerConfig,
        shutdown: tokio_util::sync::CancellationToken,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.routing.outbound_queue_capacity));
        let router = Arc::new(MessageRouter::new(
            registry.clone(),
            store.clone(),
            config.router_options(),
        ));
        let handler = ConnectionHandler::new(
            router.clone(),
            store.clone(),
            shutdown,
            config.auth.require_registered_user,
        );
        Self {
            registry,
            router,
            handler,
            store,
        }
    }
}
