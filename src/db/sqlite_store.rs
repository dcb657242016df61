use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::auth::password::{hash_password, verify_password};
use crate::engine::events::{GroupSummary, Message, StoredMessage, UserSummary};
use crate::engine::store::{ChatStore, StoreError};

use super::models::{MessageRow, format_timestamp};
use super::queries::{groups, messages, users};

/// SQLite-backed [`ChatStore`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn require_group_id(&self, group: &str) -> Result<i64, StoreError> {
        groups::get_group_id(&self.pool, group)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("group {}", group)))
    }
}

fn map_unique(e: sqlx::Error, what: String) -> StoreError {
    if let sqlx::Error::Database(db) = &e
        && db.is_unique_violation()
    {
        return StoreError::AlreadyExists(what);
    }
    e.into()
}

fn into_history(rows: Vec<MessageRow>) -> Vec<StoredMessage> {
    rows.into_iter().filter_map(MessageRow::into_stored).collect()
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn user_exists(&self, username: &str) -> Result<bool, StoreError> {
        Ok(users::user_exists(&self.pool, username).await?)
    }

    async fn create_user(&self, username: &str, password: &str) -> Result<(), StoreError> {
        let hash = hash_password(password)?;
        users::insert_user(&self.pool, username, &hash)
            .await
            .map_err(|e| map_unique(e, format!("user {}", username)))
    }

    async fn authenticate(&self, username: &str, password: &str) -> Result<(), StoreError> {
        let Some(hash) = users::get_password_hash(&self.pool, username).await? else {
            return Err(StoreError::InvalidCredentials);
        };
        if verify_password(password, &hash) {
            Ok(())
        } else {
            Err(StoreError::InvalidCredentials)
        }
    }

    async fn group_exists(&self, group: &str) -> Result<bool, StoreError> {
        Ok(groups::get_group_id(&self.pool, group).await?.is_some())
    }

    async fn create_group(&self, group: &str, members: &[String]) -> Result<(), StoreError> {
        groups::insert_group_with_members(&self.pool, group, members)
            .await
            .map_err(|e| map_unique(e, format!("group {}", group)))
    }

    async fn add_member(&self, group: &str, username: &str) -> Result<(), StoreError> {
        let group_id = self.require_group_id(group).await?;
        Ok(groups::add_member(&self.pool, group_id, username).await?)
    }

    async fn group_members(&self, group: &str) -> Result<Vec<String>, StoreError> {
        let group_id = self.require_group_id(group).await?;
        Ok(groups::list_members(&self.pool, group_id).await?)
    }

    async fn user_groups(&self, username: &str) -> Result<Vec<GroupSummary>, StoreError> {
        let rows = groups::list_user_groups_with_members(&self.pool, username).await?;

        let mut summaries: Vec<GroupSummary> = Vec::new();
        for (name, member) in rows {
            match summaries.last_mut() {
                Some(last) if last.name == name => last.members.push(member),
                _ => summaries.push(GroupSummary {
                    name,
                    members: vec![member],
                }),
            }
        }
        Ok(summaries)
    }

    async fn save_message(&self, message: &Message) -> Result<(), StoreError> {
        messages::insert_message(
            &self.pool,
            &message.from,
            &message.to,
            message.kind.as_str(),
            &message.text,
            &format_timestamp(&message.sent_at),
        )
        .await?;
        Ok(())
    }

    async fn set_online_status(&self, username: &str, online: bool) -> Result<(), StoreError> {
        Ok(users::set_online_status(&self.pool, username, online).await?)
    }

    async fn search_users(&self, query: &str, limit: i64) -> Result<Vec<UserSummary>, StoreError> {
        let rows = users::search_users(&self.pool, query, limit).await?;
        Ok(rows.into_iter().map(UserSummary::from).collect())
    }

    async fn private_history(
        &self,
        user: &str,
        peer: &str,
        limit: i64,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let rows = messages::fetch_private_history(&self.pool, user, peer, limit).await?;
        Ok(into_history(rows))
    }

    async fn group_history(&self, group: &str, limit: i64) -> Result<Vec<StoredMessage>, StoreError> {
        let rows = messages::fetch_group_history(&self.pool, group, limit).await?;
        Ok(into_history(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::{create_pool, run_migrations};
    use crate::engine::events::{InboundMessage, MessageKind};
    use chrono::{Duration, Utc};

    async fn store() -> SqliteStore {
        let pool = create_pool("sqlite::memory:", 1).await.unwrap();
        run_migrations(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    #[tokio::test]
    async fn test_create_and_authenticate() {
        let store = store().await;
        store.create_user("alice", "wonderland").await.unwrap();

        assert!(store.user_exists("alice").await.unwrap());
        assert!(!store.user_exists("bob").await.unwrap());
        assert!(store.authenticate("alice", "wonderland").await.is_ok());
        assert!(matches!(
            store.authenticate("alice", "wrong").await,
            Err(StoreError::InvalidCredentials)
        ));
        assert!(matches!(
            store.authenticate("nobody", "wonderland").await,
            Err(StoreError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_user_rejected() {
        let store = store().await;
        store.create_user("alice", "pw-one").await.unwrap();
        assert!(matches!(
            store.create_user("alice", "pw-two").await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_groups_and_membership() {
        let store = store().await;
        store.create_group("rust", &[]).await.unwrap();
        store.create_group("go", &[]).await.unwrap();
        assert!(matches!(
            store.create_group("rust", &[]).await,
            Err(StoreError::AlreadyExists(_))
        ));

        store.add_member("rust", "alice").await.unwrap();
        store.add_member("rust", "bob").await.unwrap();
        store.add_member("rust", "alice").await.unwrap();
        store.add_member("go", "bob").await.unwrap();

        assert_eq!(store.group_members("rust").await.unwrap(), vec!["alice", "bob"]);
        assert!(matches!(
            store.group_members("missing").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.add_member("missing", "alice").await,
            Err(StoreError::NotFound(_))
        ));

        let bobs = store.user_groups("bob").await.unwrap();
        assert_eq!(
            bobs,
            vec![
                GroupSummary {
                    name: "go".into(),
                    members: vec!["bob".into()]
                },
                GroupSummary {
                    name: "rust".into(),
                    members: vec!["alice".into(), "bob".into()]
                },
            ]
        );
        assert!(store.user_groups("carol").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_group_with_initial_members() {
        let store = store().await;
        let members = vec!["alice".to_string(), "bob".to_string(), "alice".to_string()];
        store.create_group("rust", &members).await.unwrap();
        assert_eq!(store.group_members("rust").await.unwrap(), vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_failed_member_insert_rolls_back_group() {
        let store = store().await;
        sqlx::query("DROP TABLE group_members")
            .execute(store.pool())
            .await
            .unwrap();

        let result = store.create_group("rust", &["alice".to_string()]).await;
        assert!(matches!(result, Err(StoreError::Database(_))));
        assert!(!store.group_exists("rust").await.unwrap());
    }

    #[tokio::test]
    async fn test_history_newest_first() {
        let store = store().await;
        let base = Utc::now();

        let first = InboundMessage::private("alice", "bob", "one").stamp("alice", base);
        let second = InboundMessage::private("bob", "alice", "two")
            .stamp("bob", base + Duration::seconds(1));
        let other = InboundMessage::private("alice", "carol", "x")
            .stamp("alice", base + Duration::seconds(2));
        let grp = InboundMessage::group("alice", "rust", "hey")
            .stamp("alice", base + Duration::seconds(3));
        for m in [&first, &second, &other, &grp] {
            store.save_message(m).await.unwrap();
        }

        let history = store.private_history("bob", "alice", 10).await.unwrap();
        let texts: Vec<&str> = history.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["two", "one"]);

        let limited = store.private_history("alice", "bob", 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].text, "two");

        let group = store.group_history("rust", 10).await.unwrap();
        assert_eq!(group.len(), 1);
        assert_eq!(group[0].kind, MessageKind::Group);
        assert_eq!(group[0].from, "alice");
    }

    #[tokio::test]
    async fn test_search_and_online_status() {
        let store = store().await;
        for name in ["alice", "alicia", "bob", "mal_ice"] {
            store.create_user(name, "password").await.unwrap();
        }
        store.set_online_status("alicia", true).await.unwrap();

        let found = store.search_users("ALI", 10).await.unwrap();
        let names: Vec<&str> = found.iter().map(|u| u.username.as_str()).collect();
        assert_eq!(names, vec!["alicia", "alice"]);
        assert!(found[0].is_online);

        let literal = store.search_users("l_i", 10).await.unwrap();
        assert_eq!(literal.len(), 1);
        assert_eq!(literal[0].username, "mal_ice");

        let reset = users::mark_all_offline(store.pool()).await.unwrap();
        assert_eq!(reset, 1);
    }
}
