//! Queue payload formats and the durable message-blob table.

use kv_store::Store;

/// Payload of a `submit` job.
///
/// The message body itself is not carried here; it lives as a durable
/// blob in the `iaq:{account}` hash so losing the job never loses the
/// message.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitPayload {
    /// Owning account.
    pub account: String,

    /// Queue entry id, the blob hash field.
    #[serde(alias = "qId")]
    pub queue_id: String,

    /// RFC 5322 message id of the queued message.
    pub message_id: String,
}

/// Key of an account's message-blob hash.
fn blob_key(account: &str) -> String {
    format!("iaq:{account}")
}

/// Store a message blob under `iaq:{account}`, replacing any prior blob
/// with the same queue id.
pub async fn store_message_blob(
    store: &Store,
    account: &str,
    queue_id: &str,
    blob: Vec<u8>,
) -> Result<(), kv_store::StoreError> {
    store.hash_set(&blob_key(account), queue_id, blob).await
}

/// Load a message blob, `None` when it was already removed.
pub async fn load_message_blob(
    store: &Store,
    account: &str,
    queue_id: &str,
) -> Result<Option<Vec<u8>>, kv_store::StoreError> {
    store.hash_get(&blob_key(account), queue_id).await
}

/// Delete a message blob once its job is terminal.
pub async fn delete_message_blob(
    store: &Store,
    account: &str,
    queue_id: &str,
) -> Result<bool, kv_store::StoreError> {
    Ok(store.hash_del(&blob_key(account), &[queue_id]).await? > 0)
}
