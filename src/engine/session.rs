use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::events::{Message, SessionId};

/// Why a message could not be placed on a session's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("outbound queue is full")]
    Full,
    #[error("session is closed")]
    Closed,
}

/// A live connection's delivery handle. Owned by the registry; the
/// connection handler keeps a reference while it drains the queue.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub username: String,
    pub connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<Message>,
    closed: CancellationToken,
}

impl Session {
    /// Create a session with a bounded outbound queue. The receiver goes to
    /// the connection's write loop.
    pub fn new(username: String, capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let session = Self {
            id: Uuid::new_v4(),
            username,
            connected_at: Utc::now(),
            outbound: tx,
            closed: CancellationToken::new(),
        };
        (session, rx)
    }

    /// Queue a message without waiting. A full queue drops the message.
    pub fn enqueue(&self, message: Message) -> Result<(), EnqueueError> {
        if self.closed.is_cancelled() {
            return Err(EnqueueError::Closed);
        }
        self.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Number of messages waiting to be written.
    pub fn queued(&self) -> usize {
        self.outbound.max_capacity() - self.outbound.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.outbound.max_capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.outbound.is_closed()
    }

    /// Token the write loop watches; cancelled once the session is removed.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Only the registry calls this, from its removal path.
    pub(super) fn close(&self) {
        self.closed.cancel();
    }
}
