//! Durable account catalog.
//!
//! Account records live in `iad:{id}` hashes with ids tracked in the
//! `accounts` set. Every membership or connection-affecting change is
//! published on the control channel so the assignment controller reacts
//! without polling. Credential secrets are sealed through the vault
//! before they touch the store.

use chrono::{DateTime, Utc};
use kv_store::Store;
use secret_store::SecretVault;

mod account;
mod codec;


pub use account::{
    Account, AccountMeta, AccountPatch, AccountState, Credentials, ImapCredentials, LastError,
    NewAccount, OAuth2Credentials, SecurityMode, SmtpCredentials,
};

/// Pub/sub channel carrying account membership changes.
pub const CONTROL_CHANNEL: &str = "control";

/// Key of the set of registered account ids.
const ACCOUNTS_KEY: &str = "accounts";

/// Maximum accepted account id length.
const MAX_ID_LEN: usize = 256;

/// Errors returned by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Store access error.
    #[error("store: {0}")]
    Store(#[from] kv_store::StoreError),

    /// Record field encode/decode error.
    #[error("record codec: {0}")]
    Codec(#[from] serde_json::Error),

    /// Credential seal/open error.
    #[error("credential secret: {0}")]
    Secret(#[from] secret_store::SecretError),

    /// The account id is empty or too long.
    #[error("invalid account id")]
    InvalidId,

    /// The account does not exist.
    #[error("account {0} not found")]
    NotFound(String),
}

/// A control-channel message.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    /// What happened.
    pub cmd: ControlCommand,

    /// The affected account id.
    pub account: String,
}

/// Account membership change kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ControlCommand {
    /// A new account was registered.
    New,

    /// Connection-affecting fields changed.
    Update,

    /// The account was deleted.
    Delete,
}

/// Whether `create` registered a new account or refreshed an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// A new record was written.
    Created,

    /// An existing record was overwritten in place.
    Updated,
}

/// A page of accounts.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountPage {
    /// Accounts on this page.
    pub accounts: Vec<Account>,

    /// Total number of pages.
    pub pages: usize,

    /// This page's zero-based index.
    pub page: usize,
}

/// The durable account catalog.
#[derive(Debug, Clone)]
pub struct Registry {
    /// Backing store.
    store: Store,

    /// Vault sealing credential secrets at rest.
    vault: SecretVault,
}

impl Registry {
    /// Open the catalog over a store.
    pub fn new(store: Store, vault: SecretVault) -> Self {
        Self { store, vault }
    }

    /// Key of an account's record hash.
    fn record_key(id: &str) -> String {
        format!("iad:{id}")
    }

    /// Publish a membership change on the control channel.
    fn publish(&self, cmd: ControlCommand, account: &str) {
        let message = ControlMessage {
            cmd,
            account: account.to_string(),
        };
        match serde_json::to_vec(&message) {
            Ok(payload) => self.store.publish(CONTROL_CHANNEL, payload),
            Err(err) => tracing::error!(%err, "control message encode failed"),
        }
    }

    /// Register an account.
    ///
    /// Idempotent: registering an existing id overwrites the record in
    /// place and publishes an update instead of a new-account message.
    pub async fn create(&self, account: NewAccount) -> Result<CreateOutcome, RegistryError> {
        let NewAccount {
            id,
            credentials,
            meta,
        } = account;

        if id.is_empty() || id.len() > MAX_ID_LEN {
            return Err(RegistryError::InvalidId);
        }

        let existed = !self.store.set_add(ACCOUNTS_KEY, &id).await?;

        let record = Account {
            id: id.clone(),
            credentials: Some(credentials),
            state: AccountState::Init,
            last_error: None,
            meta,
            created: Utc::now(),
        };
        let fields = codec::encode_account(&record, &self.vault)?;
        self.store
            .hash_set_multi(&Self::record_key(&id), fields)
            .await?;

        let (cmd, outcome) = if existed {
            (ControlCommand::Update, CreateOutcome::Updated)
        } else {
            (ControlCommand::New, CreateOutcome::Created)
        };
        self.publish(cmd, &id);

        tracing::info!(account = %id, ?outcome, "account registered");
        Ok(outcome)
    }

    /// Load an account record.
    pub async fn load(&self, id: &str) -> Result<Option<Account>, RegistryError> {
        let fields = self.store.hash_get_all(&Self::record_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        codec::decode_account(id, &fields, &self.vault).map(Some)
    }

    /// Merge a patch into an account record.
    ///
    /// Publishes an update on the control channel when a
    /// connection-affecting field changed.
    pub async fn update(&self, id: &str, patch: AccountPatch) -> Result<(), RegistryError> {
        let mut account = self
            .load(id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let connection_affecting = patch.connection_affecting();

        let AccountPatch {
            name,
            email,
            notify_from,
            copy_on_send,
            logs,
            credentials,
        } = patch;

        if let Some(name) = name {
            account.meta.name = name;
        }
        if let Some(email) = email {
            account.meta.email = email;
        }
        if let Some(notify_from) = notify_from {
            account.meta.notify_from = notify_from;
        }
        if let Some(copy_on_send) = copy_on_send {
            account.meta.copy_on_send = copy_on_send;
        }
        if let Some(logs) = logs {
            account.meta.logs = logs;
        }
        if let Some(credentials) = credentials {
            account.credentials = Some(credentials);
        }

        let fields = codec::encode_account(&account, &self.vault)?;
        self.store
            .hash_set_multi(&Self::record_key(id), fields)
            .await?;

        if connection_affecting {
            self.publish(ControlCommand::Update, id);
        }
        Ok(())
    }

    /// Delete an account and all its per-account state.
    ///
    /// Credentials are tombstoned first so an in-flight worker read sees
    /// auth gone before the record disappears. Idempotent: deleting a
    /// missing account is a no-op returning `false`.
    pub async fn delete(&self, id: &str) -> Result<bool, RegistryError> {
        let record_key = Self::record_key(id);
        self.store
            .hash_del(&record_key, &[codec::F_IMAP, codec::F_SMTP, codec::F_OAUTH2])
            .await?;
        self.store
            .hash_set(&record_key, codec::F_STATE, AccountState::Unset.as_str())
            .await?;

        let existed = self.store.set_remove(ACCOUNTS_KEY, id).await?;
        if !existed {
            self.store.delete_key(&record_key).await?;
            return Ok(false);
        }

        self.publish(ControlCommand::Delete, id);

        self.store.delete_key(&record_key).await?;
        self.store.delete_key(&format!("iah:{id}")).await?;
        self.store.delete_key(&format!("iaq:{id}")).await?;

        tracing::info!(account = %id, "account deleted");
        Ok(true)
    }

    /// List registered account ids.
    pub async fn ids(&self) -> Result<Vec<String>, RegistryError> {
        Ok(self.store.set_members(ACCOUNTS_KEY).await?)
    }

    /// List accounts, optionally filtered by state, one page at a time.
    pub async fn list(
        &self,
        state_filter: Option<AccountState>,
        page: usize,
        page_size: usize,
    ) -> Result<AccountPage, RegistryError> {
        let page_size = page_size.max(1);
        let mut accounts = Vec::new();
        for id in self.ids().await? {
            if let Some(account) = self.load(&id).await?
                && state_filter.is_none_or(|state| account.state == state)
            {
                accounts.push(account);
            }
        }

        let pages = accounts.len().div_ceil(page_size).max(1);
        let page = page.min(pages - 1);
        let accounts = accounts
            .into_iter()
            .skip(page * page_size)
            .take(page_size)
            .collect();

        Ok(AccountPage {
            accounts,
            pages,
            page,
        })
    }

    /// Record a state transition. Worker write path.
    pub async fn set_state(&self, id: &str, state: AccountState) -> Result<(), RegistryError> {
        self.store
            .hash_set(&Self::record_key(id), codec::F_STATE, state.as_str())
            .await?;
        Ok(())
    }

    /// Record the last error. Worker write path.
    pub async fn set_last_error(
        &self,
        id: &str,
        error: Option<&LastError>,
    ) -> Result<(), RegistryError> {
        let record_key = Self::record_key(id);
        match error {
            Some(error) => {
                let encoded = serde_json::to_vec(error)?;
                self.store
                    .hash_set(&record_key, codec::F_LAST_ERROR, encoded)
                    .await?;
            }
            None => {
                self.store
                    .hash_del(&record_key, &[codec::F_LAST_ERROR])
                    .await?;
            }
        }
        Ok(())
    }

    /// Cache a refreshed OAuth2 access token. Worker write path.
    pub async fn store_access_token(
        &self,
        id: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), RegistryError> {
        let mut account = self
            .load(id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let Some(Credentials::OAuth2(oauth2)) = &mut account.credentials else {
            return Ok(());
        };
        oauth2.access_token = Some(access_token.to_string());
        oauth2.refresh_token = refresh_token.to_string();
        oauth2.expires_at = expires_at;

        let fields = codec::encode_account(&account, &self.vault)?;
        self.store
            .hash_set_multi(&Self::record_key(id), fields)
            .await?;
        Ok(())
    }
}
