use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::auth::password::{hash_password, verify_password};
use crate::engine::events::{GroupSummary, Message, MessageKind, StoredMessage, UserSummary};
use crate::engine::store::{ChatStore, StoreError};

#[derive(Default)]
struct UserRecord {
    /// `None` for users seeded without credentials; they cannot log in.
    password_hash: Option<String>,
    online: bool,
}

#[derive(Default)]
struct Inner {
    users: BTreeMap<String, UserRecord>,
    groups: BTreeMap<String, Vec<String>>,
    messages: Vec<Message>,
}

/// In-process [`ChatStore`] used by tests and by embedders that do not need
/// durability. Mirrors the SQLite store's semantics.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    failing: AtomicBool,
    failing_group_lookups: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store with the given accounts already present.
    pub fn with_users(usernames: &[&str]) -> Self {
        let store = Self::new();
        {
            let mut inner = store.lock();
            for name in usernames {
                inner.users.insert(name.to_string(), UserRecord::default());
            }
        }
        store
    }

    pub fn seed_group(&self, group: &str, members: &[&str]) {
        let mut inner = self.lock();
        inner.groups.insert(
            group.to_string(),
            members.iter().map(|m| m.to_string()).collect(),
        );
    }

    /// Every message persisted so far, oldest first.
    pub fn saved_messages(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    /// Make every write fail with a database error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make `group_members` fail with a database error.
    pub fn set_failing_group_lookups(&self, failing: bool) {
        self.failing_group_lookups.store(failing, Ordering::SeqCst);
    }

    pub fn is_marked_online(&self, username: &str) -> bool {
        self.lock().users.get(username).is_some_and(|u| u.online)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn check_writes(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Database("store unavailable".into()));
        }
        Ok(())
    }
}

fn stored(id: usize, message: &Message) -> StoredMessage {
    StoredMessage {
        id: id as i64 + 1,
        from: message.from.clone(),
        to: message.to.clone(),
        kind: message.kind,
        text: message.text.clone(),
        created_at: message.sent_at,
    }
}

fn newest_first<'a>(
    messages: impl DoubleEndedIterator<Item = (usize, &'a Message)>,
    limit: i64,
) -> Vec<StoredMessage> {
    messages
        .rev()
        .take(limit.max(0) as usize)
        .map(|(id, m)| stored(id, m))
        .collect()
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn user_exists(&self, username: &str) -> Result<bool, StoreError> {
        Ok(self.lock().users.contains_key(username))
    }

    async fn create_user(&self, username: &str, password: &str) -> Result<(), StoreError> {
        self.check_writes()?;
        let hash = hash_password(password)?;
        let mut inner = self.lock();
        if inner.users.contains_key(username) {
            return Err(StoreError::AlreadyExists(format!("user {}", username)));
        }
        inner.users.insert(
            username.to_string(),
            UserRecord {
                password_hash: Some(hash),
                online: false,
            },
        );
        Ok(())
    }

    async fn authenticate(&self, username: &str, password: &str) -> Result<(), StoreError> {
        let hash = self
            .lock()
            .users
            .get(username)
            .and_then(|u| u.password_hash.clone());
        match hash {
            Some(hash) if verify_password(password, &hash) => Ok(()),
            _ => Err(StoreError::InvalidCredentials),
        }
    }

    async fn group_exists(&self, group: &str) -> Result<bool, StoreError> {
        Ok(self.lock().groups.contains_key(group))
    }

    async fn create_group(&self, group: &str, members: &[String]) -> Result<(), StoreError> {
        self.check_writes()?;
        let mut inner = self.lock();
        if inner.groups.contains_key(group) {
            return Err(StoreError::AlreadyExists(format!("group {}", group)));
        }
        let mut joined: Vec<String> = Vec::with_capacity(members.len());
        for member in members {
            if !joined.contains(member) {
                joined.push(member.clone());
            }
        }
        inner.groups.insert(group.to_string(), joined);
        Ok(())
    }

    async fn add_member(&self, group: &str, username: &str) -> Result<(), StoreError> {
        self.check_writes()?;
        let mut inner = self.lock();
        let members = inner
            .groups
            .get_mut(group)
            .ok_or_else(|| StoreError::NotFound(format!("group {}", group)))?;
        if !members.iter().any(|m| m == username) {
            members.push(username.to_string());
        }
        Ok(())
    }

    async fn group_members(&self, group: &str) -> Result<Vec<String>, StoreError> {
        if self.failing_group_lookups.load(Ordering::SeqCst) {
            return Err(StoreError::Database("group lookup unavailable".into()));
        }
        self.lock()
            .groups
            .get(group)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("group {}", group)))
    }

    async fn user_groups(&self, username: &str) -> Result<Vec<GroupSummary>, StoreError> {
        Ok(self
            .lock()
            .groups
            .iter()
            .filter(|(_, members)| members.iter().any(|m| m == username))
            .map(|(name, members)| GroupSummary {
                name: name.clone(),
                members: members.clone(),
            })
            .collect())
    }

    async fn save_message(&self, message: &Message) -> Result<(), StoreError> {
        self.check_writes()?;
        self.lock().messages.push(message.clone());
        Ok(())
    }

    async fn set_online_status(&self, username: &str, online: bool) -> Result<(), StoreError> {
        self.check_writes()?;
        if let Some(user) = self.lock().users.get_mut(username) {
            user.online = online;
        }
        Ok(())
    }

    async fn search_users(&self, query: &str, limit: i64) -> Result<Vec<UserSummary>, StoreError> {
        let needle = query.to_lowercase();
        let inner = self.lock();
        let mut found: Vec<UserSummary> = inner
            .users
            .iter()
            .filter(|(name, _)| name.to_lowercase().contains(&needle))
            .map(|(name, user)| UserSummary {
                username: name.clone(),
                display_name: name.clone(),
                is_online: user.online,
            })
            .collect();
        // BTreeMap order is alphabetical; stable sort keeps it within each bucket.
        found.sort_by_key(|u| !u.is_online);
        found.truncate(limit.max(0) as usize);
        Ok(found)
    }

    async fn private_history(
        &self,
        user: &str,
        peer: &str,
        limit: i64,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let inner = self.lock();
        let matching = inner.messages.iter().enumerate().filter(|(_, m)| {
            m.kind == MessageKind::Private
                && ((m.from == user && m.to == peer) || (m.from == peer && m.to == user))
        });
        Ok(newest_first(matching, limit))
    }

    async fn group_history(&self, group: &str, limit: i64) -> Result<Vec<StoredMessage>, StoreError> {
        let inner = self.lock();
        let matching = inner
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.kind == MessageKind::Group && m.to == group);
        Ok(newest_first(matching, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::events::InboundMessage;
    use chrono::Utc;

    #[tokio::test]
    async fn test_seeded_users_cannot_log_in() {
        let store = MemoryStore::with_users(&["alice"]);
        assert!(store.user_exists("alice").await.unwrap());
        assert!(matches!(
            store.authenticate("alice", "").await,
            Err(StoreError::InvalidCredentials)
        ));

        store.create_user("bob", "builder").await.unwrap();
        assert!(store.authenticate("bob", "builder").await.is_ok());
        assert!(matches!(
            store.create_user("bob", "again").await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let store = MemoryStore::with_users(&["alice"]);
        store.set_failing(true);
        let msg = InboundMessage::private("alice", "bob", "hi").stamp("alice", Utc::now());
        assert!(matches!(
            store.save_message(&msg).await,
            Err(StoreError::Database(_))
        ));
        store.set_failing(false);
        store.save_message(&msg).await.unwrap();
        assert_eq!(store.saved_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_history_filters_and_orders() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for (from, to, text) in [("a", "b", "1"), ("b", "a", "2"), ("a", "c", "3")] {
            let msg = InboundMessage::private(from, to, text).stamp(from, now);
            store.save_message(&msg).await.unwrap();
        }
        let history = store.private_history("a", "b", 10).await.unwrap();
        let texts: Vec<&str> = history.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["2", "1"]);
        assert_eq!(history[0].id, 2);
    }

    #[tokio::test]
    async fn test_search_puts_online_first() {
        let store = MemoryStore::with_users(&["anna", "annabel", "bob"]);
        store.set_online_status("annabel", true).await.unwrap();
        let found = store.search_users("ANN", 10).await.unwrap();
        let names: Vec<&str> = found.iter().map(|u| u.username.as_str()).collect();
        assert_eq!(names, vec!["annabel", "anna"]);
    }
}
