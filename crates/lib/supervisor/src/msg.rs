//! Control-channel message types.
//!
//! Two families: commands carrying a correlation id that expect a
//! response, and fire-and-forget notifications. Callers dispatch on the
//! variant tag; there is no dynamic method lookup anywhere on this path.

use imap_client::{
    Attachment, Contact, MessageEnvelope, MessageList, MessageText, OpError, SubmitEnvelope,
    SubmitReceipt,
};

/// A request routed to the worker owning an account.
#[derive(Debug, Clone)]
pub enum AccountRequest {
    /// List message envelopes in a mailbox.
    ListMessages {
        /// Mailbox name.
        mailbox: String,

        /// Zero-based page.
        page: u32,

        /// Page size.
        page_size: u32,
    },

    /// Load one envelope.
    GetMessage {
        /// Mailbox name.
        mailbox: String,

        /// Message id.
        id: String,
    },

    /// Load text content.
    GetText {
        /// Mailbox name.
        mailbox: String,

        /// Message id.
        id: String,

        /// Per-part size cap.
        max_bytes: usize,
    },

    /// Load raw message bytes.
    GetRawMessage {
        /// Mailbox name.
        mailbox: String,

        /// Message id.
        id: String,
    },

    /// Load one attachment.
    GetAttachment {
        /// Mailbox name.
        mailbox: String,

        /// Message id.
        id: String,

        /// Attachment index.
        index: usize,
    },

    /// Apply flag changes.
    UpdateMessage {
        /// Mailbox name.
        mailbox: String,

        /// Message id.
        id: String,

        /// Flags to add.
        add: Vec<String>,

        /// Flags to remove.
        remove: Vec<String>,
    },

    /// Move a message to another mailbox.
    MoveMessage {
        /// Source mailbox.
        mailbox: String,

        /// Message id.
        id: String,

        /// Target mailbox.
        target: String,
    },

    /// Delete a message.
    DeleteMessage {
        /// Mailbox name.
        mailbox: String,

        /// Message id.
        id: String,
    },

    /// Submit a message over SMTP right now.
    SubmitMessage {
        /// Raw RFC 5322 message.
        raw: Vec<u8>,

        /// SMTP envelope.
        envelope: SubmitEnvelope,
    },

    /// Queue a message for durable background submission.
    QueueMessage {
        /// Raw RFC 5322 message.
        raw: Vec<u8>,

        /// SMTP envelope.
        envelope: SubmitEnvelope,
    },

    /// Append a message to a mailbox.
    UploadMessage {
        /// Mailbox name.
        mailbox: String,

        /// Raw RFC 5322 message.
        raw: Vec<u8>,

        /// Initial flags.
        flags: Vec<String>,
    },

    /// Create a mailbox.
    CreateMailbox {
        /// Mailbox name.
        mailbox: String,
    },

    /// Delete a mailbox.
    DeleteMailbox {
        /// Mailbox name.
        mailbox: String,
    },

    /// Build a contact list from mailbox traffic.
    BuildContacts,
}

/// A successful response to an [`AccountRequest`].
#[derive(Debug, Clone)]
pub enum AccountResponse {
    /// A page of envelopes.
    MessageList(MessageList),

    /// One envelope.
    Message(MessageEnvelope),

    /// Text content.
    Text(MessageText),

    /// Raw message bytes.
    Raw(Vec<u8>),

    /// One attachment.
    Attachment(Attachment),

    /// A completed submission.
    Submitted(SubmitReceipt),

    /// A durably queued submission.
    Queued {
        /// Queue entry id; also the blob key.
        queue_id: String,
    },

    /// An uploaded message id.
    Uploaded {
        /// New message id.
        id: String,
    },

    /// A contact list.
    Contacts(Vec<Contact>),

    /// Nothing to report beyond success.
    Done,
}

/// Result type of account-scoped RPC.
pub type CallResult = Result<AccountResponse, OpError>;

/// The error returned when an account is not owned by the called worker.
pub fn no_active_handler() -> OpError {
    OpError {
        code: "ENOHANDLER".to_string(),
        status_code: 503,
        message: "No active handler for requested account".to_string(),
    }
}

/// The error returned when an RPC misses its deadline.
pub fn timeout() -> OpError {
    OpError {
        code: "Timeout".to_string(),
        status_code: 504,
        message: "RPC did not complete within its budget".to_string(),
    }
}

/// Runtime settings pushed to workers.
#[derive(Debug, Clone, Default)]
pub struct SettingsUpdate {
    /// New per-account log-ring cap.
    pub max_log_lines: Option<usize>,

    /// New queue retention bound.
    pub queue_keep: Option<u32>,
}

/// Messages from the supervisor to a worker.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Take ownership of an account and open its session.
    Assign {
        /// Account id.
        account: String,
    },

    /// Close and drop an account; it is being deleted.
    Delete {
        /// Account id.
        account: String,
    },

    /// Connection-affecting account fields changed; reconnect.
    Update {
        /// Account id.
        account: String,
    },

    /// Runtime settings changed.
    Settings(SettingsUpdate),

    /// A command expecting a `Resp` with the same correlation id.
    Call {
        /// Correlation id.
        mid: u64,

        /// Target account.
        account: String,

        /// The request.
        request: AccountRequest,
    },

    /// Report current connection counts through the metrics path.
    CountConnections,
}

/// Messages from workers (and internal timers) into the supervisor loop.
#[derive(Debug)]
pub enum Inbound {
    /// A worker finished its setup and accepts assignments.
    Ready {
        /// Worker id.
        worker: String,
    },

    /// A response to an outstanding `Call`.
    Resp {
        /// Correlation id.
        mid: u64,

        /// The outcome.
        result: CallResult,
    },

    /// An account-visible state change to broadcast.
    Change {
        /// Account id.
        account: String,

        /// Change kind, e.g. `state`.
        kind: String,

        /// Kind-specific payload.
        payload: serde_json::Value,
    },

    /// A worker dropped an account's connection; reassign it after the
    /// damping delay.
    Released {
        /// Account id.
        account: String,

        /// The transport failure that caused the release, if any.
        error: Option<String>,
    },

    /// A metric counter increment.
    Metrics {
        /// Counter name.
        counter: String,

        /// Increment.
        delta: i64,
    },

    /// A request duration observation for the histogram counters.
    Duration {
        /// Histogram name.
        name: String,

        /// Observed duration in milliseconds.
        millis: u64,
    },

    /// An account-scoped RPC from a handle.
    AccountCall {
        /// Target account.
        account: String,

        /// The request.
        request: AccountRequest,

        /// Where to deliver the outcome.
        reply: tokio::sync::oneshot::Sender<CallResult>,
    },

    /// Push a settings change to every worker.
    BroadcastSettings(SettingsUpdate),

    /// An outstanding call passed its deadline.
    CallExpired {
        /// Correlation id.
        mid: u64,
    },

    /// A control-channel message from the account registry.
    Control(account_registry::ControlMessage),

    /// A damping delay elapsed; run an assignment cycle.
    AssignWake,
}
