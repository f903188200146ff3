//! Account records and credential types.

use chrono::{DateTime, Utc};

/// Connection lifecycle state of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccountState {
    /// Record loaded, not yet connecting.
    Init,

    /// TCP/TLS and login in progress.
    Connecting,

    /// Initial mailbox discovery.
    Syncing,

    /// Steady-state IDLE/poll.
    Connected,

    /// Credentials rejected by the server.
    AuthenticationError,

    /// Transport failure.
    ConnectError,

    /// Credentials removed; terminal until the account is re-created.
    Unset,

    /// Gracefully closed.
    Disconnected,
}

impl AccountState {
    /// The camelCase wire name of this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Connecting => "connecting",
            Self::Syncing => "syncing",
            Self::Connected => "connected",
            Self::AuthenticationError => "authenticationError",
            Self::ConnectError => "connectError",
            Self::Unset => "unset",
            Self::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for AccountState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The last error recorded against an account.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    /// Machine-readable error code.
    pub code: String,

    /// Human-readable description.
    pub message: String,

    /// When the error was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Transport security of a mail server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SecurityMode {
    /// Implicit TLS.
    Tls,

    /// Plaintext upgraded with STARTTLS.
    StartTls,

    /// No transport security.
    Plain,
}

/// IMAP server credentials.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImapCredentials {
    /// Server hostname.
    pub host: String,

    /// Server port.
    pub port: u16,

    /// Transport security.
    pub security: SecurityMode,

    /// Login username.
    pub user: String,

    /// Login secret; sealed at rest, plaintext in memory.
    pub secret: String,
}

/// SMTP submission credentials.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmtpCredentials {
    /// Server hostname.
    pub host: String,

    /// Server port.
    pub port: u16,

    /// Transport security.
    pub security: SecurityMode,

    /// Login username.
    pub user: String,

    /// Login secret; sealed at rest, plaintext in memory.
    pub secret: String,
}

/// OAuth2-backed credentials.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuth2Credentials {
    /// OAuth2 provider id.
    pub provider: String,

    /// Account user, typically the email address.
    pub user: String,

    /// Refresh token; sealed at rest.
    pub refresh_token: String,

    /// Cached access token; sealed at rest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    /// Cached access token expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// How an account authenticates.
#[derive(Debug, Clone, PartialEq)]
pub enum Credentials {
    /// Explicit IMAP and SMTP server credentials.
    ImapSmtp {
        /// IMAP side.
        imap: ImapCredentials,

        /// SMTP side.
        smtp: SmtpCredentials,
    },

    /// OAuth2 provider-backed credentials covering both directions.
    OAuth2(OAuth2Credentials),
}

/// Operator-facing account metadata.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountMeta {
    /// Display name.
    pub name: String,

    /// Account email address.
    pub email: String,

    /// Watermark: `messageNew` events are not emitted for messages
    /// received before this instant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify_from: Option<DateTime<Utc>>,

    /// Whether submitted messages are copied to the sent mailbox.
    pub copy_on_send: bool,

    /// Whether per-account logging is enabled.
    pub logs: bool,
}

/// A full account record.
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    /// Account id.
    pub id: String,

    /// Credentials; `None` once tombstoned.
    pub credentials: Option<Credentials>,

    /// Connection lifecycle state.
    pub state: AccountState,

    /// Last recorded error.
    pub last_error: Option<LastError>,

    /// Metadata.
    pub meta: AccountMeta,

    /// Creation time.
    pub created: DateTime<Utc>,
}

/// Fields accepted when registering an account.
#[derive(Debug, Clone)]
pub struct NewAccount {
    /// Account id; opaque, at most 256 characters.
    pub id: String,

    /// Credentials.
    pub credentials: Credentials,

    /// Metadata.
    pub meta: AccountMeta,
}

/// A partial update to an account.
///
/// `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct AccountPatch {
    /// Replace the display name.
    pub name: Option<String>,

    /// Replace the email address.
    pub email: Option<String>,

    /// Replace the notify-from watermark.
    pub notify_from: Option<Option<DateTime<Utc>>>,

    /// Replace the copy-on-send flag.
    pub copy_on_send: Option<bool>,

    /// Replace the per-account logging flag.
    pub logs: Option<bool>,

    /// Replace the credentials. Connection-affecting.
    pub credentials: Option<Credentials>,
}

impl AccountPatch {
    /// Whether applying this patch can affect a live connection.
    pub fn connection_affecting(&self) -> bool {
        self.credentials.is_some() || self.notify_from.is_some()
    }
}
