//! The mail-session capability consumed by the IMAP worker.
//!
//! The worker never touches the wire protocol; it drives a connector that
//! yields a session handle: a bounded stream of tagged change events plus
//! a request/response operation surface. Production code plugs in the
//! `imap-driver` connector; tests plug in a scripted one.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;

/// Capacity of a session's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Transport security of a server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    /// Implicit TLS.
    Tls,

    /// Plaintext upgraded with STARTTLS.
    StartTls,

    /// No transport security.
    Plain,
}

/// How to authenticate a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    /// Username/password login.
    Login {
        /// Login username.
        user: String,

        /// Login password.
        password: String,
    },

    /// OAuth2 bearer (XOAUTH2).
    OAuth2 {
        /// Account user, typically the email address.
        user: String,

        /// A currently-valid access token.
        access_token: String,
    },
}

/// A mail server endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    /// Hostname.
    pub host: String,

    /// Port.
    pub port: u16,

    /// Transport security.
    pub security: Security,

    /// Authentication.
    pub auth: Auth,
}

/// Everything a connector needs to open an account session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectSpec {
    /// The account id, for logging and event attribution.
    pub account: String,

    /// The IMAP endpoint.
    pub imap: ServerSpec,

    /// The SMTP submission endpoint.
    pub smtp: Option<ServerSpec>,

    /// Whether submitted messages are copied to the sent mailbox.
    pub copy_on_send: bool,
}

/// Errors establishing a session.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectError {
    /// The server rejected the credentials. Permanent until the operator
    /// changes them.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Transport-level failure. Transient.
    #[error("connect failed: {0}")]
    Transport(String),
}

/// A change observed on a live session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Initial mailbox discovery finished; the session is in steady state.
    SyncCompleted {
        /// Discovered mailbox names.
        mailboxes: Vec<String>,
    },

    /// A new message appeared.
    MessageNew {
        /// Containing mailbox.
        mailbox: String,

        /// Message id.
        id: String,

        /// Server-side receive time.
        internal_date: DateTime<Utc>,

        /// Summary headers.
        envelope: MessageEnvelope,
    },

    /// A message disappeared.
    MessageDeleted {
        /// Containing mailbox.
        mailbox: String,

        /// Message id.
        id: String,
    },

    /// Message flags changed.
    MessageUpdated {
        /// Containing mailbox.
        mailbox: String,

        /// Message id.
        id: String,

        /// Current flags.
        flags: Vec<String>,
    },

    /// A mailbox appeared on the server.
    MailboxNew {
        /// Mailbox name.
        mailbox: String,
    },

    /// A mailbox disappeared from the server.
    MailboxDeleted {
        /// Mailbox name.
        mailbox: String,
    },

    /// A mailbox had to be re-synchronized from scratch.
    MailboxReset {
        /// Mailbox name.
        mailbox: String,
    },

    /// The session ended.
    ///
    /// `error` is `None` for a requested close and carries the transport
    /// failure otherwise. This is always the final event on the channel.
    Closed {
        /// What went wrong, if anything.
        error: Option<String>,
    },
}

/// Summary headers of a message.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    /// Message id within its mailbox.
    pub id: String,

    /// Subject header.
    pub subject: String,

    /// From header.
    pub from: String,

    /// To header.
    pub to: Vec<String>,

    /// Date header.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,

    /// Current flags.
    pub flags: Vec<String>,

    /// Size in bytes.
    pub size: u32,
}

/// A page of message envelopes.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageList {
    /// Envelopes on this page, newest first.
    pub messages: Vec<MessageEnvelope>,

    /// Total messages in the mailbox.
    pub total: u32,

    /// This page's zero-based index.
    pub page: u32,

    /// Total pages.
    pub pages: u32,
}

/// Text content of a message.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageText {
    /// Plain-text body, possibly truncated.
    pub plain: String,

    /// HTML body, possibly truncated.
    pub html: String,

    /// Whether either part was truncated to the size cap.
    pub truncated: bool,
}

/// A decoded attachment.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    /// File name.
    pub filename: String,

    /// MIME content type.
    pub content_type: String,

    /// Decoded bytes.
    pub data: Vec<u8>,
}

/// Flag changes applied to a message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlagUpdate {
    /// Flags to add.
    pub add: Vec<String>,

    /// Flags to remove.
    pub remove: Vec<String>,
}

/// SMTP envelope of a submission.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitEnvelope {
    /// Envelope sender.
    pub mail_from: String,

    /// Envelope recipients.
    pub rcpt_to: Vec<String>,
}

/// Result of an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    /// Server response line.
    pub response: String,

    /// RFC 5322 message id of the sent message.
    pub message_id: String,
}

/// A queued outbound message: the durable blob stored until its
/// submission job reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    /// Raw RFC 5322 message.
    pub raw: Vec<u8>,

    /// SMTP envelope.
    pub envelope: SubmitEnvelope,
}

/// A contact extracted from mailbox traffic.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    /// Display name.
    pub name: String,

    /// Email address.
    pub address: String,
}

/// A structured operation failure.
///
/// Codes and status codes travel unchanged through the supervisor to the
/// original caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{code} ({status_code}): {message}")]
pub struct OpError {
    /// Machine-readable code.
    pub code: String,

    /// HTTP-ish status code.
    pub status_code: u16,

    /// Human-readable description.
    pub message: String,
}

impl OpError {
    /// A transport-level failure (retryable).
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            code: "ETRANSPORT".to_string(),
            status_code: 502,
            message: message.into(),
        }
    }

    /// A not-found failure.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            code: "ENOTFOUND".to_string(),
            status_code: 404,
            message: message.into(),
        }
    }

    /// A permanent upstream rejection.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            code: "EPERMANENT".to_string(),
            status_code: 500,
            message: message.into(),
        }
    }
}

/// Operation result alias.
pub type OpResult<T> = Result<T, OpError>;

/// The per-account operation surface of a live session.
pub trait MailOps: Send {
    /// List message envelopes in a mailbox, one page at a time.
    fn list_messages(
        &mut self,
        mailbox: &str,
        page: u32,
        page_size: u32,
    ) -> BoxFuture<'_, OpResult<MessageList>>;

    /// Load one message's envelope.
    fn get_message(&mut self, mailbox: &str, id: &str) -> BoxFuture<'_, OpResult<MessageEnvelope>>;

    /// Load a message's text content, capped at `max_bytes` per part.
    fn get_text(
        &mut self,
        mailbox: &str,
        id: &str,
        max_bytes: usize,
    ) -> BoxFuture<'_, OpResult<MessageText>>;

    /// Load a message's raw RFC 5322 bytes.
    fn get_raw_message(&mut self, mailbox: &str, id: &str) -> BoxFuture<'_, OpResult<Vec<u8>>>;

    /// Load one attachment by index.
    fn get_attachment(
        &mut self,
        mailbox: &str,
        id: &str,
        index: usize,
    ) -> BoxFuture<'_, OpResult<Attachment>>;

    /// Apply flag changes to a message.
    fn update_message(
        &mut self,
        mailbox: &str,
        id: &str,
        flags: FlagUpdate,
    ) -> BoxFuture<'_, OpResult<()>>;

    /// Move a message to another mailbox.
    fn move_message(
        &mut self,
        mailbox: &str,
        id: &str,
        target: &str,
    ) -> BoxFuture<'_, OpResult<()>>;

    /// Delete a message.
    fn delete_message(&mut self, mailbox: &str, id: &str) -> BoxFuture<'_, OpResult<()>>;

    /// Submit a message over the account's SMTP endpoint.
    fn submit_message(
        &mut self,
        raw: &[u8],
        envelope: &SubmitEnvelope,
    ) -> BoxFuture<'_, OpResult<SubmitReceipt>>;

    /// Append a message to a mailbox; returns the new message id.
    fn upload_message(
        &mut self,
        mailbox: &str,
        raw: &[u8],
        flags: &[String],
    ) -> BoxFuture<'_, OpResult<String>>;

    /// Create a mailbox.
    fn create_mailbox(&mut self, mailbox: &str) -> BoxFuture<'_, OpResult<()>>;

    /// Delete a mailbox.
    fn delete_mailbox(&mut self, mailbox: &str) -> BoxFuture<'_, OpResult<()>>;

    /// Build a contact list from recent mailbox traffic.
    fn build_contacts(&mut self) -> BoxFuture<'_, OpResult<Vec<Contact>>>;
}

/// A live session: the event stream, the operation surface and the stop
/// signal.
///
/// Sending `true` on `stop` (or dropping the sender) closes the
/// connection; the driver then emits [`SessionEvent::Closed`] and closes
/// the event channel.
pub struct SessionHandle {
    /// Tagged change events, bounded.
    pub events: tokio::sync::mpsc::Receiver<SessionEvent>,

    /// The operation surface.
    pub ops: Box<dyn MailOps>,

    /// Stop signal.
    pub stop: tokio::sync::watch::Sender<bool>,
}

/// Opens account sessions.
pub trait MailConnector: Send + Sync + 'static {
    /// Connect and authenticate, returning a live session handle.
    ///
    /// The initial mailbox discovery runs in the background; the session
    /// emits [`SessionEvent::SyncCompleted`] when it reaches steady state.
    fn connect(&self, spec: ConnectSpec) -> BoxFuture<'_, Result<SessionHandle, ConnectError>>;
}
