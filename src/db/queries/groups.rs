use sqlx::SqlitePool;

/// Create a group and its initial members in one transaction. Fails on a
/// duplicate name (UNIQUE constraint); a failed member insert rolls the
/// group back too.
pub async fn insert_group_with_members(
    pool: &SqlitePool,
    name: &str,
    members: &[String],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    let group_id: i64 = sqlx::query_scalar("INSERT INTO chat_groups (name) VALUES (?) RETURNING id")
        .bind(name)
        .fetch_one(&mut *tx)
        .await?;

    for username in members {
        sqlx::query("INSERT OR IGNORE INTO group_members (group_id, username) VALUES (?, ?)")
            .bind(group_id)
            .bind(username)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await
}

pub async fn get_group_id(pool: &SqlitePool, name: &str) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar("SELECT id FROM chat_groups WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
}

/// Add a member. Re-adding an existing member is ignored.
pub async fn add_member(pool: &SqlitePool, group_id: i64, username: &str) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT OR IGNORE INTO group_members (group_id, username) VALUES (?, ?)")
        .bind(group_id)
        .bind(username)
        .execute(pool)
        .await?;
    Ok(())
}

/// Members of a group in join order.
pub async fn list_members(pool: &SqlitePool, group_id: i64) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar("SELECT username FROM group_members WHERE group_id = ? ORDER BY id ASC")
        .bind(group_id)
        .fetch_all(pool)
        .await
}

/// Groups a user belongs to, as (group name, member) pairs ordered by group
/// name. One row per member so callers can rebuild member lists in one query.
pub async fn list_user_groups_with_members(
    pool: &SqlitePool,
    username: &str,
) -> Result<Vec<(String, String)>, sqlx::Error> {
    sqlx::query_as::<_, (String, String)>(
        "SELECT g.name, m.username \
         FROM chat_groups g \
         JOIN group_members mine ON mine.group_id = g.id AND mine.username = ? \
         JOIN group_members m ON m.group_id = g.id \
         ORDER BY g.name ASC, m.id ASC",
    )
    .bind(username)
    .fetch_all(pool)
    .await
}
