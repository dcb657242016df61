use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a live session (one per connection, not per user).
pub type SessionId = Uuid;

/// How a message is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Delivered to the single user named in `to`.
    Private,
    /// Fanned out to the online members of the group named in `to`.
    Group,
    /// Identity-establishing handshake; never routed.
    Connect,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Private => "private",
            MessageKind::Group => "group",
            MessageKind::Connect => "connect",
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(MessageKind::Private),
            "group" => Ok(MessageKind::Group),
            "connect" => Ok(MessageKind::Connect),
            other => Err(format!("unknown message kind: {}", other)),
        }
    }
}

/// A message as the client put it on the wire. The client-side timestamp is
/// accepted in any JSON form (RFC 3339 string, Unix seconds, null) but never
/// trusted or interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    pub kind: MessageKind,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<serde_json::Value>,
}

impl InboundMessage {
    pub fn connect(username: impl Into<String>) -> Self {
        Self {
            from: username.into(),
            to: String::new(),
            kind: MessageKind::Connect,
            text: String::new(),
            timestamp: None,
        }
    }

    pub fn private(from: impl Into<String>, to: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            kind: MessageKind::Private,
            text: text.into(),
            timestamp: None,
        }
    }

    pub fn group(from: impl Into<String>, group: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: group.into(),
            kind: MessageKind::Group,
            text: text.into(),
            timestamp: None,
        }
    }

    /// Whether this frame carries something to route beyond a bare connect.
    pub fn has_payload(&self) -> bool {
        self.kind != MessageKind::Connect && !self.text.trim().is_empty()
    }

    /// Turn a wire message into a routable [`Message`], binding it to the
    /// session identity and the server's receipt time.
    pub fn stamp(self, from: &str, sent_at: DateTime<Utc>) -> Message {
        Message {
            from: from.to_string(),
            to: self.to,
            kind: self.kind,
            text: self.text,
            sent_at,
        }
    }
}

/// A routed chat message. Immutable once built; flows by value through the router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub from: String,
    pub to: String,
    pub kind: MessageKind,
    pub text: String,
    #[serde(rename = "timestamp")]
    pub sent_at: DateTime<Utc>,
}

/// A message read back from history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub from: String,
    pub to: String,
    pub kind: MessageKind,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// User entry returned by search and listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub username: String,
    pub display_name: String,
    pub is_online: bool,
}

/// A group together with its member list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub name: String,
    pub members: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&MessageKind::Private).unwrap(), "\"private\"");
        assert_eq!(serde_json::to_string(&MessageKind::Group).unwrap(), "\"group\"");
        assert_eq!(serde_json::to_string(&MessageKind::Connect).unwrap(), "\"connect\"");
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let result: Result<InboundMessage, _> =
            serde_json::from_str(r#"{"from":"alice","to":"bob","kind":"broadcast","text":"x"}"#);
        assert!(result.is_err());
        assert!("broadcast".parse::<MessageKind>().is_err());
    }

    #[test]
    fn test_inbound_defaults_missing_fields() {
        let msg: InboundMessage = serde_json::from_str(r#"{"from":"alice","kind":"connect"}"#).unwrap();
        assert_eq!(msg, InboundMessage::connect("alice"));
        assert!(!msg.has_payload());
    }

    #[test]
    fn test_client_timestamp_in_any_form_is_accepted() {
        let frames = [
            r#"{"from":"alice","to":"bob","kind":"private","text":"hi","timestamp":1700000000}"#,
            r#"{"from":"alice","to":"bob","kind":"private","text":"hi","timestamp":"2023-11-14T22:13:20Z"}"#,
            r#"{"from":"alice","to":"bob","kind":"private","text":"hi","timestamp":"yesterday"}"#,
            r#"{"from":"alice","to":"bob","kind":"private","text":"hi","timestamp":null}"#,
        ];
        for frame in frames {
            let msg: InboundMessage = serde_json::from_str(frame).unwrap();
            assert_eq!(msg.text, "hi");

            let now = Utc::now();
            assert_eq!(msg.stamp("alice", now).sent_at, now);
        }

        let hello: InboundMessage =
            serde_json::from_str(r#"{"from":"alice","kind":"connect","timestamp":1700000000}"#).unwrap();
        assert_eq!(hello.from, "alice");
        assert_eq!(hello.kind, MessageKind::Connect);
    }

    #[test]
    fn test_has_payload() {
        assert!(InboundMessage::private("a", "b", "hi").has_payload());
        assert!(!InboundMessage::private("a", "b", "   ").has_payload());

        let mut connect = InboundMessage::connect("a");
        connect.text = "hello".into();
        assert!(!connect.has_payload());
    }

    #[test]
    fn test_stamp_overrides_sender_and_time() {
        let mut inbound = InboundMessage::private("mallory", "bob", "hi");
        inbound.timestamp = Some(serde_json::json!("2001-01-01T00:00:00Z"));

        let now = Utc::now();
        let msg = inbound.stamp("alice", now);
        assert_eq!(msg.from, "alice");
        assert_eq!(msg.to, "bob");
        assert_eq!(msg.sent_at, now);
    }

    #[test]
    fn test_message_wire_shape() {
        let msg = InboundMessage::group("alice", "rust", "hello").stamp("alice", Utc::now());
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["kind"], "group");
        assert_eq!(value["to"], "rust");
        assert!(value.get("timestamp").is_some());
        assert!(value.get("sent_at").is_none());
    }
}
