//! Hash-field codec for account records.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use secret_store::SecretVault;

use crate::account::{
    Account, AccountMeta, AccountState, Credentials, ImapCredentials, LastError,
    OAuth2Credentials, SmtpCredentials,
};
use crate::RegistryError;

/// Field: display name.
const F_NAME: &str = "name";

/// Field: email address.
const F_EMAIL: &str = "email";

/// Field: lifecycle state.
pub(crate) const F_STATE: &str = "state";

/// Field: last error, JSON.
pub(crate) const F_LAST_ERROR: &str = "lastError";

/// Field: notify-from watermark, RFC 3339.
const F_NOTIFY_FROM: &str = "notifyFrom";

/// Field: copy-on-send flag.
const F_COPY_ON_SEND: &str = "copyOnSend";

/// Field: per-account logging flag.
const F_LOGS: &str = "logs";

/// Field: IMAP credentials, JSON with sealed secret.
pub(crate) const F_IMAP: &str = "imap";

/// Field: SMTP credentials, JSON with sealed secret.
pub(crate) const F_SMTP: &str = "smtp";

/// Field: OAuth2 credentials, JSON with sealed secrets.
pub(crate) const F_OAUTH2: &str = "oauth2";

/// Field: creation time, RFC 3339.
const F_CREATED: &str = "created";

/// Encode an account into hash fields, sealing secrets.
pub(crate) fn encode_account(
    account: &Account,
    vault: &SecretVault,
) -> Result<Vec<(String, Vec<u8>)>, RegistryError> {
    let mut fields: Vec<(String, Vec<u8>)> = vec![
        (F_NAME.into(), account.meta.name.clone().into_bytes()),
        (F_EMAIL.into(), account.meta.email.clone().into_bytes()),
        (F_STATE.into(), account.state.as_str().into()),
        (
            F_COPY_ON_SEND.into(),
            account.meta.copy_on_send.to_string().into_bytes(),
        ),
        (F_LOGS.into(), account.meta.logs.to_string().into_bytes()),
        (
            F_CREATED.into(),
            account.created.to_rfc3339().into_bytes(),
        ),
    ];

    if let Some(notify_from) = &account.meta.notify_from {
        fields.push((F_NOTIFY_FROM.into(), notify_from.to_rfc3339().into_bytes()));
    }
    if let Some(last_error) = &account.last_error {
        fields.push((F_LAST_ERROR.into(), serde_json::to_vec(last_error)?));
    }

    match &account.credentials {
        Some(Credentials::ImapSmtp { imap, smtp }) => {
            let mut imap = imap.clone();
            imap.secret = vault.seal(&imap.secret)?;
            fields.push((F_IMAP.into(), serde_json::to_vec(&imap)?));

            let mut smtp = smtp.clone();
            smtp.secret = vault.seal(&smtp.secret)?;
            fields.push((F_SMTP.into(), serde_json::to_vec(&smtp)?));
        }
        Some(Credentials::OAuth2(oauth2)) => {
            let mut oauth2 = oauth2.clone();
            oauth2.refresh_token = vault.seal(&oauth2.refresh_token)?;
            if let Some(access_token) = &oauth2.access_token {
                oauth2.access_token = Some(vault.seal(access_token)?);
            }
            fields.push((F_OAUTH2.into(), serde_json::to_vec(&oauth2)?));
        }
        None => {}
    }

    Ok(fields)
}

/// Decode hash fields into an account, opening sealed secrets.
pub(crate) fn decode_account(
    id: &str,
    fields: &HashMap<String, Vec<u8>>,
    vault: &SecretVault,
) -> Result<Account, RegistryError> {
    let text = |field: &str| -> Option<String> {
        fields
            .get(field)
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
    };

    let state = text(F_STATE)
        .and_then(|raw| serde_json::from_value(serde_json::Value::String(raw)).ok())
        .unwrap_or(AccountState::Init);

    let last_error: Option<LastError> = match fields.get(F_LAST_ERROR) {
        Some(raw) => Some(serde_json::from_slice(raw)?),
        None => None,
    };

    let notify_from = text(F_NOTIFY_FROM)
        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc));

    let created = text(F_CREATED)
        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let credentials = if let Some(raw) = fields.get(F_OAUTH2) {
        let mut oauth2: OAuth2Credentials = serde_json::from_slice(raw)?;
        oauth2.refresh_token = vault.open(&oauth2.refresh_token)?.0;
        if let Some(access_token) = &oauth2.access_token {
            oauth2.access_token = Some(vault.open(access_token)?.0);
        }
        Some(Credentials::OAuth2(oauth2))
    } else if let (Some(raw_imap), Some(raw_smtp)) = (fields.get(F_IMAP), fields.get(F_SMTP)) {
        let mut imap: ImapCredentials = serde_json::from_slice(raw_imap)?;
        imap.secret = vault.open(&imap.secret)?.0;
        let mut smtp: SmtpCredentials = serde_json::from_slice(raw_smtp)?;
        smtp.secret = vault.open(&smtp.secret)?.0;
        Some(Credentials::ImapSmtp { imap, smtp })
    } else {
        None
    };

    Ok(Account {
        id: id.to_string(),
        credentials,
        state,
        last_error,
        meta: AccountMeta {
            name: text(F_NAME).unwrap_or_default(),
            email: text(F_EMAIL).unwrap_or_default(),
            notify_from,
            copy_on_send: text(F_COPY_ON_SEND).is_some_and(|raw| raw == "true"),
            logs: text(F_LOGS).is_some_and(|raw| raw == "true"),
        },
        created,
    })
}
