//! Typed access to the global `settings` hash.
//!
//! Settings entries are stored as JSON strings; plain scalars written by
//! older tooling are accepted on read.

use event_core::EventKind;
use kv_store::Store;

/// Key of the settings hash.
const SETTINGS_KEY: &str = "settings";

/// Default retention for completed and failed queue entries.
pub const DEFAULT_QUEUE_KEEP: u32 = 100;

/// Default cap on per-account log ring length.
pub const DEFAULT_MAX_LOG_LINES: usize = 10_000;

/// Default cap on notification text payloads, in bytes.
const DEFAULT_NOTIFY_TEXT_SIZE: usize = 1024 * 1024;

/// Entropy of a generated service secret, in bytes.
const SERVICE_SECRET_BYTES: usize = 32;

/// Errors returned by settings access.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// Store access error.
    #[error("store: {0}")]
    Store(#[from] kv_store::StoreError),

    /// A settings entry could not be encoded.
    #[error("settings encode: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Webhook delivery settings.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookSettings {
    /// Whether webhook delivery is enabled at all.
    pub enabled: bool,

    /// Target URL; may embed Basic credentials.
    pub url: String,

    /// Subscribed event names; `*` subscribes to everything.
    pub events: Vec<String>,

    /// Extra headers added to every delivery.
    pub custom_headers: Vec<(String, String)>,

    /// Whether to include message text in `messageNew` payloads.
    pub notify_text: bool,

    /// Cap on included text, in bytes.
    pub notify_text_size: usize,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            events: vec!["*".to_string()],
            custom_headers: Vec::new(),
            notify_text: false,
            notify_text_size: DEFAULT_NOTIFY_TEXT_SIZE,
        }
    }
}

impl WebhookSettings {
    /// Whether deliveries for this event kind are subscribed.
    pub fn subscribes(&self, kind: EventKind) -> bool {
        self.events
            .iter()
            .any(|name| name == "*" || name == kind.as_str())
    }
}

/// Typed settings accessor over a store.
#[derive(Debug, Clone)]
pub struct Settings {
    /// The backing store.
    store: Store,
}

impl Settings {
    /// Wrap a store.
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Read a settings entry.
    ///
    /// Entries are JSON strings; a raw scalar that fails to parse as JSON
    /// is retried as a JSON string value.
    pub async fn get<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, SettingsError> {
        let Some(raw) = self.store.hash_get(SETTINGS_KEY, key).await? else {
            return Ok(None);
        };
        let raw = String::from_utf8_lossy(&raw).into_owned();
        if let Ok(value) = serde_json::from_str(&raw) {
            return Ok(Some(value));
        }
        Ok(serde_json::from_value(serde_json::Value::String(raw)).ok())
    }

    /// Write a settings entry as JSON.
    pub async fn set<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<(), SettingsError> {
        let encoded = serde_json::to_string(value).map_err(SettingsError::Encode)?;
        self.store
            .hash_set(SETTINGS_KEY, key, encoded.into_bytes())
            .await?;
        Ok(())
    }

    /// Current webhook settings, defaults when unset.
    pub async fn webhooks(&self) -> Result<WebhookSettings, SettingsError> {
        Ok(self.get("webhooks").await?.unwrap_or_default())
    }

    /// Replace the webhook settings.
    pub async fn set_webhooks(&self, webhooks: &WebhookSettings) -> Result<(), SettingsError> {
        self.set("webhooks", webhooks).await
    }

    /// Flip the webhook enabled flag, keeping the rest of the settings.
    pub async fn set_webhooks_enabled(&self, enabled: bool) -> Result<(), SettingsError> {
        let mut webhooks = self.webhooks().await?;
        webhooks.enabled = enabled;
        self.set_webhooks(&webhooks).await
    }

    /// Queue retention for completed and failed entries.
    ///
    /// `0` retains none; unset retains the default.
    pub async fn queue_keep(&self) -> Result<u32, SettingsError> {
        Ok(self.get("queueKeep").await?.unwrap_or(DEFAULT_QUEUE_KEEP))
    }

    /// Cap on per-account log ring length.
    pub async fn max_log_lines(&self) -> Result<usize, SettingsError> {
        Ok(self
            .get("maxLogLines")
            .await?
            .unwrap_or(DEFAULT_MAX_LOG_LINES))
    }

    /// The service secret, generated and persisted on first access.
    pub async fn service_secret(&self) -> Result<String, SettingsError> {
        if let Some(secret) = self.get::<String>("serviceSecret").await? {
            return Ok(secret);
        }
        let secret = secret_store::generate_secret(SERVICE_SECRET_BYTES);
        self.set("serviceSecret", &secret).await?;
        tracing::info!("generated a new service secret");
        Ok(secret)
    }
}
