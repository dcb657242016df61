use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::events::Message;
use super::session::Session;

/// Default per-session outbound queue size.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("user {0} is already connected")]
    AlreadyConnected(String),
}

/// Who is online right now. One instance per process, shared by `Arc`.
///
/// Every operation takes the same lock: writers (register/remove) are
/// exclusive, lookups and listings are shared.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    queue_capacity: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl SessionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Create and store a session for `username`, unless one already exists.
    /// Returns the session and the receiving end of its outbound queue.
    pub fn register(
        &self,
        username: &str,
    ) -> Result<(Arc<Session>, mpsc::Receiver<Message>), RegistryError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        if sessions.contains_key(username) {
            return Err(RegistryError::AlreadyConnected(username.to_string()));
        }

        let (session, rx) = Session::new(username.to_string(), self.queue_capacity);
        let session = Arc::new(session);
        sessions.insert(username.to_string(), session.clone());

        info!(%username, session_id = %session.id, online = sessions.len(), "session registered");
        Ok((session, rx))
    }

    pub fn lookup(&self, username: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(username)
            .cloned()
    }

    /// Remove the session for `username` and close its outbound queue.
    /// Returns false (and does nothing) if no such session exists.
    pub fn remove(&self, username: &str) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(username);

        match removed {
            Some(session) => {
                session.close();
                info!(%username, session_id = %session.id, "session removed");
                true
            }
            None => {
                debug!(%username, "remove for unknown session ignored");
                false
            }
        }
    }

    /// Remove `session` only if it is still the one registered under its
    /// username. A retiring connection uses this so it can never evict a
    /// newer session that claimed the same name.
    pub fn remove_session(&self, session: &Session) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        let is_current = sessions
            .get(&session.username)
            .is_some_and(|current| current.id == session.id);
        if !is_current {
            return false;
        }

        if let Some(removed) = sessions.remove(&session.username) {
            removed.close();
            info!(username = %removed.username, session_id = %removed.id, "session removed");
        }
        true
    }

    /// Snapshot of online usernames, sorted.
    pub fn list_online(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn online_count(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_online(&self, username: &str) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(username)
    }
}
