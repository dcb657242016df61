use sqlx::SqlitePool;

use crate::db::models::MessageRow;

/// Insert a message into history.
pub async fn insert_message(
    pool: &SqlitePool,
    from_user: &str,
    to_target: &str,
    message_type: &str,
    text: &str,
    created_at: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO messages (from_user, to_target, message_type, text, created_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(from_user)
    .bind(to_target)
    .bind(message_type)
    .bind(text)
    .bind(created_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Private messages between two users in either direction, newest first.
pub async fn fetch_private_history(
    pool: &SqlitePool,
    user: &str,
    peer: &str,
    limit: i64,
) -> Result<Vec<MessageRow>, sqlx::Error> {
    sqlx::query_as::<_, MessageRow>(
        "SELECT id, from_user, to_target, message_type, text, created_at \
         FROM messages \
         WHERE message_type = 'private' \
           AND ((from_user = ? AND to_target = ?) OR (from_user = ? AND to_target = ?)) \
         ORDER BY created_at DESC, id DESC \
         LIMIT ?",
    )
    .bind(user)
    .bind(peer)
    .bind(peer)
    .bind(user)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Messages posted to a group, newest first.
pub async fn fetch_group_history(
    pool: &SqlitePool,
    group: &str,
    limit: i64,
) -> Result<Vec<MessageRow>, sqlx::Error> {
    sqlx::query_as::<_, MessageRow>(
        "SELECT id, from_user, to_target, message_type, text, created_at \
         FROM messages \
         WHERE message_type = 'group' AND to_target = ? \
         ORDER BY created_at DESC, id DESC \
         LIMIT ?",
    )
    .bind(group)
    .bind(limit)
    .fetch_all(pool)
    .await
}
