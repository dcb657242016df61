use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::events::{MessageKind, StoredMessage, UserSummary};

/// A stored account, without its password hash.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserRow {
    pub username: String,
    pub display_name: String,
    pub is_online: bool,
}

impl From<UserRow> for UserSummary {
    fn from(row: UserRow) -> Self {
        UserSummary {
            username: row.username,
            display_name: row.display_name,
            is_online: row.is_online,
        }
    }
}

/// A stored message from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MessageRow {
    pub id: i64,
    pub from_user: String,
    pub to_target: String,
    pub message_type: String,
    pub text: String,
    pub created_at: String,
}

impl MessageRow {
    /// Convert to the engine's history type. Rows with an unknown kind or an
    /// unparseable timestamp are skipped by callers.
    pub fn into_stored(self) -> Option<StoredMessage> {
        let kind: MessageKind = self.message_type.parse().ok()?;
        let created_at = parse_timestamp(&self.created_at)?;
        Some(StoredMessage {
            id: self.id,
            from: self.from_user,
            to: self.to_target,
            kind,
            text: self.text,
            created_at,
        })
    }
}

/// Timestamps are stored as RFC 3339 text with millisecond precision so
/// that lexical order matches chronological order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
