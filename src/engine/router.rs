use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use super::events::{Message, MessageKind};
use super::registry::SessionRegistry;
use super::session::{EnqueueError, Session};
use super::store::{ChatStore, StoreError};
use super::validation::DEFAULT_MAX_MESSAGE_LEN;

/// Who may post to a group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupPostPolicy {
    /// Only members may post; other senders are rejected before fan-out.
    #[default]
    MembersOnly,
    /// Anyone may post; fan-out still reaches members only.
    Open,
}

impl std::str::FromStr for GroupPostPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "members_only" => Ok(GroupPostPolicy::MembersOnly),
            "open" => Ok(GroupPostPolicy::Open),
            other => Err(format!("unknown group post policy: {}", other)),
        }
    }
}

/// Why a message was refused before any delivery was attempted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("message has no recipient")]
    MissingRecipient,
    #[error("message text is empty")]
    EmptyText,
    #[error("message text exceeds {0} bytes")]
    TooLong(usize),
    #[error("no such group: {0}")]
    UnknownGroup(String),
    #[error("{user} is not a member of {group}")]
    NotAMember { group: String, user: String },
    #[error("could not resolve members of {0}")]
    GroupLookupFailed(String),
}

/// What happened to one dispatched message. Used for logging and tests;
/// the sender never sees it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Recipients whose queue accepted the message.
    pub queued: Vec<String>,
    /// Recipients with no live session.
    pub offline: Vec<String>,
    /// Recipients whose queue was full; the message was dropped for them.
    pub dropped: Vec<String>,
    pub rejected: Option<Rejection>,
    pub persisted: bool,
}

impl DispatchReport {
    fn rejected(reason: Rejection) -> Self {
        Self {
            rejected: Some(reason),
            ..Self::default()
        }
    }

    pub fn delivered_to(&self, username: &str) -> bool {
        self.queued.iter().any(|u| u == username)
    }
}

/// Routing knobs, taken from `[routing]` in the server config.
#[derive(Debug, Clone, Copy)]
pub struct RouterOptions {
    pub max_message_len: usize,
    pub group_post_policy: GroupPostPolicy,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            group_post_policy: GroupPostPolicy::default(),
        }
    }
}

/// Decides who gets each message and pushes it onto their queues.
pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn ChatStore>,
    options: RouterOptions,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<dyn ChatStore>,
        options: RouterOptions,
    ) -> Self {
        Self {
            registry,
            store,
            options,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn options(&self) -> RouterOptions {
        self.options
    }

    /// Route one message. Never blocks on a recipient: full queues drop.
    /// Routed messages are then handed to the store; a store failure is
    /// logged and does not affect delivery.
    pub async fn dispatch(&self, message: Message) -> DispatchReport {
        if let Err(reason) = self.validate(&message) {
            debug!(from = %message.from, to = %message.to, %reason, "message rejected");
            return DispatchReport::rejected(reason);
        }

        let mut report = match message.kind {
            MessageKind::Connect => return DispatchReport::default(),
            MessageKind::Private => self.route_private(&message),
            MessageKind::Group => match self.route_group(&message).await {
                Ok(report) => report,
                Err(reason @ Rejection::GroupLookupFailed(_)) => {
                    DispatchReport::rejected(reason)
                }
                Err(reason) => {
                    warn!(from = %message.from, group = %message.to, %reason, "group post refused");
                    return DispatchReport::rejected(reason);
                }
            },
        };

        report.persisted = self.persist(&message).await;
        report
    }

    fn validate(&self, message: &Message) -> Result<(), Rejection> {
        if message.kind == MessageKind::Connect {
            return Ok(());
        }
        if message.to.trim().is_empty() {
            return Err(Rejection::MissingRecipient);
        }
        if message.text.trim().is_empty() {
            return Err(Rejection::EmptyText);
        }
        if message.text.len() > self.options.max_message_len {
            return Err(Rejection::TooLong(self.options.max_message_len));
        }
        Ok(())
    }

    fn route_private(&self, message: &Message) -> DispatchReport {
        let mut report = DispatchReport::default();
        match self.registry.lookup(&message.to) {
            Some(session) => deliver(&session, message, &mut report),
            None => {
                debug!(from = %message.from, to = %message.to, "recipient offline");
                report.offline.push(message.to.clone());
            }
        }
        report
    }

    async fn route_group(&self, message: &Message) -> Result<DispatchReport, Rejection> {
        let group = &message.to;
        let members = match self.store.group_members(group).await {
            Ok(members) => members,
            Err(StoreError::NotFound(_)) => return Err(Rejection::UnknownGroup(group.clone())),
            Err(e) => {
                error!(%group, error = %e, "failed to resolve group members");
                return Err(Rejection::GroupLookupFailed(group.clone()));
            }
        };

        let sender_is_member = members.iter().any(|m| *m == message.from);
        if !sender_is_member && self.options.group_post_policy == GroupPostPolicy::MembersOnly {
            return Err(Rejection::NotAMember {
                group: group.clone(),
                user: message.from.clone(),
            });
        }

        let mut report = DispatchReport::default();
        for member in members.iter().filter(|m| **m != message.from) {
            match self.registry.lookup(member) {
                Some(session) => deliver(&session, message, &mut report),
                None => report.offline.push(member.clone()),
            }
        }

        if report.queued.is_empty() {
            debug!(%group, from = %message.from, "no online members to deliver to");
        }
        Ok(report)
    }

    async fn persist(&self, message: &Message) -> bool {
        match self.store.save_message(message).await {
            Ok(()) => true,
            Err(e) => {
                error!(from = %message.from, to = %message.to, error = %e, "failed to persist message");
                false
            }
        }
    }
}

fn deliver(session: &Session, message: &Message, report: &mut DispatchReport) {
    match session.enqueue(message.clone()) {
        Ok(()) => report.queued.push(session.username.clone()),
        Err(EnqueueError::Full) => {
            warn!(
                recipient = %session.username,
                from = %message.from,
                capacity = session.capacity(),
                "outbound queue full, message dropped"
            );
            report.dropped.push(session.username.clone());
        }
        // Removed between lookup and enqueue.
        Err(EnqueueError::Closed) => report.offline.push(session.username.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::engine::events::InboundMessage;
    use chrono::Utc;

    fn router_with(store: Arc<MemoryStore>, options: RouterOptions) -> MessageRouter {
        MessageRouter::new(Arc::new(SessionRegistry::new(4)), store, options)
    }

    fn private(from: &str, to: &str, text: &str) -> Message {
        InboundMessage::private(from, to, text).stamp(from, Utc::now())
    }

    fn group(from: &str, to: &str, text: &str) -> Message {
        InboundMessage::group(from, to, text).stamp(from, Utc::now())
    }

    #[tokio::test]
    async fn test_private_to_online_user() {
        let store = Arc::new(MemoryStore::with_users(&["alice", "bob"]));
        let router = router_with(store.clone(), RouterOptions::default());
        let (_bob, mut rx) = router.registry().register("bob").unwrap();

        let report = router.dispatch(private("alice", "bob", "hi")).await;
        assert_eq!(report.queued, vec!["bob"]);
        assert!(report.persisted);

        let received = rx.try_recv().unwrap();
        assert_eq!(received.text, "hi");
        assert_eq!(store.saved_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_private_to_offline_user_is_persisted_not_queued() {
        let store = Arc::new(MemoryStore::with_users(&["alice", "bob"]));
        let router = router_with(store.clone(), RouterOptions::default());

        let report = router.dispatch(private("alice", "bob", "are you there?")).await;
        assert!(report.queued.is_empty());
        assert_eq!(report.offline, vec!["bob"]);
        assert!(report.persisted);
        assert_eq!(store.saved_messages()[0].text, "are you there?");
    }

    #[tokio::test]
    async fn test_connect_is_not_routed_or_persisted() {
        let store = Arc::new(MemoryStore::with_users(&["alice"]));
        let router = router_with(store.clone(), RouterOptions::default());
        let (_alice, mut rx) = router.registry().register("alice").unwrap();

        let mut connect = InboundMessage::connect("alice");
        connect.to = "alice".into();
        let report = router.dispatch(connect.stamp("alice", Utc::now())).await;

        assert_eq!(report, DispatchReport::default());
        assert!(rx.try_recv().is_err());
        assert!(store.saved_messages().is_empty());
    }

    #[tokio::test]
    async fn test_validation_rejections() {
        let store = Arc::new(MemoryStore::with_users(&["alice", "bob"]));
        let options = RouterOptions {
            max_message_len: 5,
            ..RouterOptions::default()
        };
        let router = router_with(store.clone(), options);

        let report = router.dispatch(private("alice", "", "hi")).await;
        assert_eq!(report.rejected, Some(Rejection::MissingRecipient));

        let report = router.dispatch(private("alice", "bob", "  ")).await;
        assert_eq!(report.rejected, Some(Rejection::EmptyText));

        let report = router.dispatch(private("alice", "bob", "too long")).await;
        assert_eq!(report.rejected, Some(Rejection::TooLong(5)));

        assert!(store.saved_messages().is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let store = Arc::new(MemoryStore::with_users(&["alice", "bob"]));
        let router = router_with(store.clone(), RouterOptions::default());
        let (bob, _rx) = router.registry().register("bob").unwrap();

        for i in 0..4 {
            let report = router.dispatch(private("alice", "bob", &format!("m{i}"))).await;
            assert_eq!(report.queued, vec!["bob"]);
        }

        let report = router.dispatch(private("alice", "bob", "overflow")).await;
        assert_eq!(report.dropped, vec!["bob"]);
        assert!(report.persisted);
        assert_eq!(bob.queued(), bob.capacity());
    }

    #[tokio::test]
    async fn test_group_skips_sender_and_offline_members() {
        let store = Arc::new(MemoryStore::with_users(&["a", "b", "c"]));
        store.seed_group("g", &["a", "b", "c"]);
        let router = router_with(store.clone(), RouterOptions::default());
        let (_a, mut rx_a) = router.registry().register("a").unwrap();
        let (_b, mut rx_b) = router.registry().register("b").unwrap();

        let report = router.dispatch(group("a", "g", "hello group")).await;
        assert_eq!(report.queued, vec!["b"]);
        assert_eq!(report.offline, vec!["c"]);
        assert!(report.persisted);

        assert_eq!(rx_b.try_recv().unwrap().text, "hello group");
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_group_members_only_rejects_outsider() {
        let store = Arc::new(MemoryStore::with_users(&["alice", "bob", "eve"]));
        store.seed_group("g", &["alice", "bob"]);
        let router = router_with(store.clone(), RouterOptions::default());
        let (_bob, mut rx_bob) = router.registry().register("bob").unwrap();

        let report = router.dispatch(group("eve", "g", "let me in")).await;
        assert_eq!(
            report.rejected,
            Some(Rejection::NotAMember {
                group: "g".into(),
                user: "eve".into()
            })
        );
        assert!(rx_bob.try_recv().is_err());
        assert!(store.saved_messages().is_empty());
    }

    #[tokio::test]
    async fn test_group_open_policy_lets_outsider_post() {
        let store = Arc::new(MemoryStore::with_users(&["alice", "bob", "eve"]));
        store.seed_group("g", &["alice", "bob"]);
        let options = RouterOptions {
            group_post_policy: GroupPostPolicy::Open,
            ..RouterOptions::default()
        };
        let router = router_with(store.clone(), options);
        let (_bob, mut rx_bob) = router.registry().register("bob").unwrap();
        let (_eve, mut rx_eve) = router.registry().register("eve").unwrap();

        let report = router.dispatch(group("eve", "g", "hi all")).await;
        assert_eq!(report.queued, vec!["bob"]);
        assert_eq!(report.offline, vec!["alice"]);
        assert_eq!(rx_bob.try_recv().unwrap().from, "eve");
        assert!(rx_eve.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_group_rejected() {
        let store = Arc::new(MemoryStore::with_users(&["alice"]));
        let router = router_with(store.clone(), RouterOptions::default());

        let report = router.dispatch(group("alice", "nowhere", "hello?")).await;
        assert_eq!(report.rejected, Some(Rejection::UnknownGroup("nowhere".into())));
        assert!(!report.persisted);
    }

    #[tokio::test]
    async fn test_store_failure_does_not_block_delivery() {
        let store = Arc::new(MemoryStore::with_users(&["alice", "bob"]));
        store.set_failing(true);
        let router = router_with(store.clone(), RouterOptions::default());
        let (_bob, mut rx) = router.registry().register("bob").unwrap();

        let report = router.dispatch(private("alice", "bob", "still here")).await;
        assert_eq!(report.queued, vec!["bob"]);
        assert!(!report.persisted);
        assert_eq!(rx.try_recv().unwrap().text, "still here");
    }

    #[tokio::test]
    async fn test_group_lookup_failure_still_persists() {
        let store = Arc::new(MemoryStore::with_users(&["alice", "bob"]));
        store.seed_group("g", &["alice", "bob"]);
        store.set_failing_group_lookups(true);
        let router = router_with(store.clone(), RouterOptions::default());
        let (_bob, mut rx) = router.registry().register("bob").unwrap();

        let report = router.dispatch(group("alice", "g", "anyone?")).await;
        assert_eq!(report.rejected, Some(Rejection::GroupLookupFailed("g".into())));
        assert!(report.persisted);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("open".parse::<GroupPostPolicy>(), Ok(GroupPostPolicy::Open));
        assert_eq!(
            "members_only".parse::<GroupPostPolicy>(),
            Ok(GroupPostPolicy::MembersOnly)
        );
        assert!("anyone".parse::<GroupPostPolicy>().is_err());
    }
}
