use async_trait::async_trait;
use thiserror::Error;

use super::events::{GroupSummary, Message, StoredMessage, UserSummary};

/// Default number of results for user search.
pub const DEFAULT_SEARCH_LIMIT: i64 = 20;

/// Default number of history entries returned.
pub const DEFAULT_HISTORY_LIMIT: i64 = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("database error: {0}")]
    Database(String),

    #[error("password hashing failed: {0}")]
    Crypto(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound("row".into()),
            other => StoreError::Database(other.to_string()),
        }
    }
}

/// Durable accounts, group membership and message history.
///
/// Every call may fail. The routing core logs failures and carries on; only
/// the account endpoints surface them to the client.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn user_exists(&self, username: &str) -> Result<bool, StoreError>;

    /// Create an account. Fails with `AlreadyExists` for a taken username.
    async fn create_user(&self, username: &str, password: &str) -> Result<(), StoreError>;

    /// Check credentials. Unknown users and wrong passwords both yield
    /// `InvalidCredentials`.
    async fn authenticate(&self, username: &str, password: &str) -> Result<(), StoreError>;

    async fn group_exists(&self, group: &str) -> Result<bool, StoreError>;

    /// Create a group together with its initial members. Either all of it
    /// is stored or none of it; a taken name yields `AlreadyExists`.
    async fn create_group(&self, group: &str, members: &[String]) -> Result<(), StoreError>;

    /// Add `username` to `group`. Adding an existing member is a no-op.
    async fn add_member(&self, group: &str, username: &str) -> Result<(), StoreError>;

    /// Current members of `group`; `NotFound` if the group does not exist.
    async fn group_members(&self, group: &str) -> Result<Vec<String>, StoreError>;

    /// Groups `username` belongs to, sorted by name.
    async fn user_groups(&self, username: &str) -> Result<Vec<GroupSummary>, StoreError>;

    async fn save_message(&self, message: &Message) -> Result<(), StoreError>;

    async fn set_online_status(&self, username: &str, online: bool) -> Result<(), StoreError>;

    /// Case-insensitive substring search, online users first.
    async fn search_users(&self, query: &str, limit: i64) -> Result<Vec<UserSummary>, StoreError>;

    /// Private messages exchanged between two users, newest first.
    async fn private_history(
        &self,
        user: &str,
        peer: &str,
        limit: i64,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    /// Messages posted to a group, newest first.
    async fn group_history(&self, group: &str, limit: i64) -> Result<Vec<StoredMessage>, StoreError>;
}

/// Clamp a caller-supplied limit to `1..=max`, using `default` when absent
/// or non-positive.
pub fn clamp_limit(limit: Option<i64>, default: i64, max: i64) -> i64 {
    match limit {
        Some(l) if l > 0 => l.min(max),
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(None, 20, 100), 20);
        assert_eq!(clamp_limit(Some(0), 20, 100), 20);
        assert_eq!(clamp_limit(Some(-5), 20, 100), 20);
        assert_eq!(clamp_limit(Some(7), 20, 100), 7);
        assert_eq!(clamp_limit(Some(500), 20, 100), 100);
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
