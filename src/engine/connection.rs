use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{InboundMessage, Message};
use super::registry::{RegistryError, SessionRegistry};
use super::router::MessageRouter;
use super::session::Session;
use super::store::ChatStore;
use super::validation;

/// Lifecycle of one duplex connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingHandshake,
    Active,
    Closing,
    Closed,
}

/// One item read off the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InboundError {
    /// The frame arrived but could not be decoded.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// The transport itself failed.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Why a handshake was refused. No session exists afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("connection closed before handshake")]
    ClosedBeforeHandshake,
    #[error("malformed handshake: {0}")]
    Malformed(String),
    #[error("handshake identity is empty")]
    EmptyIdentity,
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("unknown user: {0}")]
    UnknownUser(String),
    #[error("user {0} is already connected")]
    AlreadyConnected(String),
    #[error("transport error during handshake: {0}")]
    Transport(String),
}

/// Why an active connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    ReadError(String),
    WriteError(String),
    /// The session was removed from the registry by someone else.
    Removed,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientClosed => write!(f, "client closed the stream"),
            CloseReason::ReadError(e) => write!(f, "read error: {}", e),
            CloseReason::WriteError(e) => write!(f, "write error: {}", e),
            CloseReason::Removed => write!(f, "session removed"),
            CloseReason::Shutdown => write!(f, "server shutting down"),
        }
    }
}

/// Admits, services and retires connections. Protocol-agnostic: the
/// WebSocket adapter feeds it a stream of decoded frames and a sink for
/// outbound messages.
#[derive(Clone)]
pub struct ConnectionHandler {
    registry: Arc<SessionRegistry>,
    router: Arc<MessageRouter>,
    store: Arc<dyn ChatStore>,
    shutdown: CancellationToken,
    require_registered_user: bool,
}

impl ConnectionHandler {
    pub fn new(
        router: Arc<MessageRouter>,
        store: Arc<dyn ChatStore>,
        shutdown: CancellationToken,
        require_registered_user: bool,
    ) -> Self {
        Self {
            registry: router.registry().clone(),
            router,
            store,
            shutdown,
            require_registered_user,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// `AwaitingHandshake`: read exactly one frame and bind its sender to a
    /// new session. Any error leaves the connection `Closed` with no session.
    pub async fn handshake<R>(&self, inbound: &mut R) -> Result<ActiveConnection, HandshakeError>
    where
        R: Stream<Item = Result<InboundMessage, InboundError>> + Unpin,
    {
        let hello = match inbound.next().await {
            Some(Ok(message)) => message,
            Some(Err(InboundError::Malformed(e))) => return Err(HandshakeError::Malformed(e)),
            Some(Err(InboundError::Transport(e))) => return Err(HandshakeError::Transport(e)),
            None => return Err(HandshakeError::ClosedBeforeHandshake),
        };
        let username = hello.from.trim().to_string();
        if username.is_empty() {
            return Err(HandshakeError::EmptyIdentity);
        }
        validation::validate_username(&username).map_err(HandshakeError::InvalidIdentity)?;

        if self.require_registered_user {
            match self.store.user_exists(&username).await {
                Ok(true) => {}
                Ok(false) => return Err(HandshakeError::UnknownUser(username)),
                Err(e) => {
                    warn!(%username, error = %e, "could not verify user, admitting anyway");
                }
            }
        }

        let (session, outbound_rx) = self.registry.register(&username).map_err(|e| match e {
            RegistryError::AlreadyConnected(name) => HandshakeError::AlreadyConnected(name),
        })?;

        if let Err(e) = self.store.set_online_status(&username, true).await {
            warn!(%username, error = %e, "failed to record online status");
        }

        debug!(%username, state = ?ConnectionState::Active, "handshake complete");

        if hello.has_payload() {
            let report = self.router.dispatch(hello.stamp(&username, session.connected_at)).await;
            debug!(%username, ?report, "dispatched handshake payload");
        }

        Ok(ActiveConnection {
            handler: self.clone(),
            session,
            outbound_rx,
        })
    }
}

/// A connection in the `Active` state, holding its registered session.
pub struct ActiveConnection {
    handler: ConnectionHandler,
    session: Arc<Session>,
    outbound_rx: mpsc::Receiver<Message>,
}

impl ActiveConnection {
    pub fn username(&self) -> &str {
        &self.session.username
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.session.connected_at
    }

    /// Run the read and write loops until the connection ends, then retire
    /// the session. Returns once the write loop has been joined.
    pub async fn run<R, W>(self, mut inbound: R, outbound: W) -> CloseReason
    where
        R: Stream<Item = Result<InboundMessage, InboundError>> + Unpin,
        W: Sink<Message> + Send + 'static,
        W::Error: fmt::Display + Send,
    {
        let ActiveConnection {
            handler,
            session,
            outbound_rx,
        } = self;
        let username = session.username.clone();

        let mut writer = tokio::spawn(write_loop(outbound_rx, outbound, session.closed_token()));
        let mut writer_joined = false;

        let reason = loop {
            tokio::select! {
                _ = handler.shutdown.cancelled() => break CloseReason::Shutdown,
                result = &mut writer => {
                    let reason = match &result {
                        Ok(Err(e)) => CloseReason::WriteError(e.clone()),
                        Ok(Ok(())) => CloseReason::Removed,
                        Err(e) => CloseReason::WriteError(e.to_string()),
                    };
                    writer_joined = true;
                    break reason;
                }
                next = inbound.next() => match next {
                    Some(Ok(frame)) => handle_frame(&handler, &session, frame).await,
                    Some(Err(InboundError::Malformed(e))) => {
                        warn!(%username, error = %e, "skipping malformed frame");
                    }
                    Some(Err(InboundError::Transport(e))) => break CloseReason::ReadError(e),
                    None => break CloseReason::ClientClosed,
                },
            }
        };

        debug!(%username, state = ?ConnectionState::Closing, %reason, "closing connection");

        // The offline flag is written while this session still holds the
        // name, so a reconnect registering afterwards always wins.
        let holds_name = handler
            .registry
            .lookup(&username)
            .is_some_and(|current| current.id == session.id);
        if holds_name || !handler.registry.is_online(&username) {
            if let Err(e) = handler.store.set_online_status(&username, false).await {
                warn!(%username, error = %e, "failed to record offline status");
            }
        } else {
            debug!(%username, "name already claimed by a newer session, keeping online flag");
        }

        // Removal closes the queue, which is what stops the write loop.
        handler.registry.remove_session(&session);
        if !writer_joined {
            match writer.await {
                Ok(Err(e)) => debug!(%username, error = %e, "write loop ended with error"),
                Err(e) => warn!(%username, error = %e, "write loop panicked"),
                Ok(Ok(())) => {}
            }
        }

        info!(%username, session_id = %session.id, state = ?ConnectionState::Closed, %reason, "connection closed");
        reason
    }
}

async fn handle_frame(handler: &ConnectionHandler, session: &Session, frame: InboundMessage) {
    if frame.from != session.username {
        debug!(
            username = %session.username,
            claimed = %frame.from,
            "sender field does not match session, using session identity"
        );
    }
    let message = frame.stamp(&session.username, Utc::now());
    let report = handler.router.dispatch(message).await;
    if let Some(reason) = &report.rejected {
        debug!(username = %session.username, %reason, "inbound message not routed");
    }
}

/// Drain the session's queue into the transport in FIFO order until the
/// session is closed or the transport fails.
async fn write_loop<W>(
    mut rx: mpsc::Receiver<Message>,
    sink: W,
    closed: CancellationToken,
) -> Result<(), String>
where
    W: Sink<Message> + Send + 'static,
    W::Error: fmt::Display + Send,
{
    let mut sink = Box::pin(sink);
    loop {
        tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            next = rx.recv() => {
                let Some(message) = next else { break };
                if let Err(e) = sink.send(message).await {
                    return Err(e.to_string());
                }
            }
        }
    }
    let _ = sink.close().await;
    Ok(())
}
