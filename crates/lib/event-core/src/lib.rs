//! Change-event envelopes emitted by account sessions.
//!
//! Every envelope carries its own timestamp and a nonce so consumers can
//! deduplicate under at-least-once delivery.

use chrono::{DateTime, Utc};

/// The kind of change an event describes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    /// A new message appeared in a mailbox.
    MessageNew,

    /// A message was removed from a mailbox.
    MessageDeleted,

    /// Message flags or metadata changed.
    MessageUpdated,

    /// A mailbox was re-synchronized from scratch.
    MailboxReset,

    /// A mailbox was deleted on the server.
    MailboxDeleted,

    /// A new mailbox appeared on the server.
    MailboxNew,

    /// The server rejected the account credentials.
    AuthenticationError,

    /// The connection to the server failed.
    ConnectError,

    /// A queued message was accepted for delivery.
    MessageSent,

    /// A queued message exhausted its delivery attempts.
    MessageFailed,

    /// A delivered message bounced.
    MessageBounce,

    /// A test event requested by an operator.
    Test,
}

impl EventKind {
    /// The camelCase wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageNew => "messageNew",
            Self::MessageDeleted => "messageDeleted",
            Self::MessageUpdated => "messageUpdated",
            Self::MailboxReset => "mailboxReset",
            Self::MailboxDeleted => "mailboxDeleted",
            Self::MailboxNew => "mailboxNew",
            Self::AuthenticationError => "authenticationError",
            Self::ConnectError => "connectError",
            Self::MessageSent => "messageSent",
            Self::MessageFailed => "messageFailed",
            Self::MessageBounce => "messageBounce",
            Self::Test => "test",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event envelope.
///
/// This is the exact shape POSTed to webhook endpoints.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// The account the event belongs to.
    pub account: String,

    /// When the event was observed.
    pub date: DateTime<Utc>,

    /// The kind of change.
    pub event: EventKind,

    /// Kind-specific payload.
    pub data: serde_json::Value,

    /// Unique nonce for idempotent consumption.
    pub nonce: String,
}

impl Event {
    /// Build an envelope stamped with the current time and a fresh nonce.
    pub fn new(account: impl Into<String>, kind: EventKind, data: serde_json::Value) -> Self {
        Self {
            account: account.into(),
            date: Utc::now(),
            event: kind,
            data,
            nonce: uuid::Uuid::new_v4().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_serialize_as_camel_case() {
        let kind = serde_json::to_string(&EventKind::MessageNew).unwrap();
        assert_eq!(kind, "\"messageNew\"");

        let parsed: EventKind = serde_json::from_str("\"mailboxReset\"").unwrap();
        assert_eq!(parsed, EventKind::MailboxReset);
    }

    #[test]
    fn wire_names_match_serde_names() {
        for kind in [
            EventKind::MessageNew,
            EventKind::AuthenticationError,
            EventKind::MessageFailed,
            EventKind::Test,
        ] {
            let serde_name = serde_json::to_value(kind).unwrap();
            assert_eq!(serde_name, serde_json::Value::String(kind.as_str().into()));
        }
    }

    #[test]
    fn envelope_shape_is_stable() {
        let event = Event::new(
            "a1",
            EventKind::MessageNew,
            serde_json::json!({"id": "AAAAAQAAAAE"}),
        );

        let value = serde_json::to_value(&event).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object["account"], "a1");
        assert_eq!(object["event"], "messageNew");
        assert!(object.contains_key("date"));
        assert!(object.contains_key("nonce"));

        let other = Event::new("a1", EventKind::MessageNew, serde_json::json!({}));
        assert_ne!(event.nonce, other.nonce);
    }
}
