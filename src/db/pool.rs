use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;
use tracing::info;

/// Create and initialize a SQLite connection pool with WAL mode.
///
/// In-memory databases are private to each connection, so callers using
/// `sqlite::memory:` should pass `max_connections = 1`.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await?;

    info!("database connected: {}", database_url);
    Ok(pool)
}

/// Split SQL text into statements on semicolons, dropping comment-only chunks.
fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    for line in sql.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("--") && current.trim().is_empty() {
            continue;
        }

        current.push_str(line);
        current.push('\n');

        while let Some(pos) = current.find(';') {
            let stmt = current[..pos].trim().to_string();
            if !stmt.is_empty() {
                statements.push(stmt);
            }
            current = current[pos + 1..].to_string();
        }
    }

    let remaining = current.trim();
    if !remaining.is_empty() && !remaining.starts_with("--") {
        statements.push(remaining.to_string());
    }

    statements
}

/// Run all pending migration SQL files against the database.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (\
            version     INTEGER PRIMARY KEY, \
            applied_at  TEXT NOT NULL DEFAULT (datetime('now'))\
        )",
    )
    .execute(pool)
    .await?;

    let current_version: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(pool)
            .await?;

    let migrations: &[(i64, &str)] = &[(1, include_str!("../../migrations/001_initial.sql"))];

    for &(version, sql) in migrations {
        if version <= current_version {
            continue;
        }
        info!("applying migration {version}...");
        let mut tx = pool.begin().await?;
        for statement in split_sql_statements(sql) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
            .bind(version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
    }

    let final_version = migrations.last().map(|m| m.0).unwrap_or(0);
    info!("database migrations applied (version: {final_version})");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_statements() {
        let sql = "-- header\nCREATE TABLE a (x INTEGER);\n\n-- note\nCREATE INDEX i ON a(x);\nINSERT INTO a VALUES (1)";
        let statements = split_sql_statements(sql);
        assert_eq!(
            statements,
            vec![
                "CREATE TABLE a (x INTEGER)",
                "CREATE INDEX i ON a(x)",
                "INSERT INTO a VALUES (1)",
            ]
        );
    }

    #[test]
    fn test_initial_migration_splits() {
        let statements = split_sql_statements(include_str!("../../migrations/001_initial.sql"));
        assert!(statements.iter().any(|s| s.starts_with("CREATE TABLE IF NOT EXISTS users")));
        assert!(statements.iter().any(|s| s.starts_with("CREATE TABLE IF NOT EXISTS messages")));
        assert!(statements.iter().all(|s| !s.contains(';')));
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = create_pool("sqlite::memory:", 1).await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let version: i64 = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(version, 1);
    }
}
