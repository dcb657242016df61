use sqlx::SqlitePool;

use crate::db::models::UserRow;

/// Insert a new user. The username doubles as the initial display name.
pub async fn insert_user(
    pool: &SqlitePool,
    username: &str,
    password_hash: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO users (username, password_hash, display_name) VALUES (?, ?, ?)")
        .bind(username)
        .bind(password_hash)
        .bind(username)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn user_exists(pool: &SqlitePool, username: &str) -> Result<bool, sqlx::Error> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE username = ?")
        .bind(username)
        .fetch_one(pool)
        .await?;
    Ok(count > 0)
}

/// Fetch the stored password hash for a user.
pub async fn get_password_hash(
    pool: &SqlitePool,
    username: &str,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar("SELECT password_hash FROM users WHERE username = ?")
        .bind(username)
        .fetch_optional(pool)
        .await
}

/// Update a user's online flag and last-seen time.
pub async fn set_online_status(
    pool: &SqlitePool,
    username: &str,
    online: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE users SET is_online = ?, \
         last_seen = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE username = ?",
    )
    .bind(online)
    .bind(username)
    .execute(pool)
    .await?;
    Ok(())
}

/// Mark every user offline. Run at startup: no session survives a restart.
pub async fn mark_all_offline(pool: &SqlitePool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE users SET is_online = 0 WHERE is_online != 0")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Case-insensitive substring search on username and display name.
/// Online users sort first, then alphabetically.
pub async fn search_users(
    pool: &SqlitePool,
    query: &str,
    limit: i64,
) -> Result<Vec<UserRow>, sqlx::Error> {
    let pattern = format!("%{}%", escape_like(&query.to_lowercase()));
    sqlx::query_as::<_, UserRow>(
        "SELECT username, display_name, is_online FROM users \
         WHERE lower(username) LIKE ? ESCAPE '\\' OR lower(display_name) LIKE ? ESCAPE '\\' \
         ORDER BY is_online DESC, username ASC \
         LIMIT ?",
    )
    .bind(&pattern)
    .bind(&pattern)
    .bind(limit)
    .fetch_all(pool)
    .await
}

fn escape_like(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
