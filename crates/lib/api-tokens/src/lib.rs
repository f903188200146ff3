//! API access tokens and the admin password.
//!
//! Tokens are issued with a random key whose SHA-256 digest is persisted;
//! export and import move whole token records as base64url-wrapped
//! MessagePack so authorization survives the round trip. The admin
//! password is hashed with Argon2id.

use std::collections::BTreeSet;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::RngCore as _;
use sha2::{Digest as _, Sha256};

/// Minimum accepted admin password length.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Entropy of a generated token key, in bytes.
const TOKEN_KEY_BYTES: usize = 32;

/// An authorization scope a token may carry.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum Scope {
    /// Full access.
    #[serde(rename = "*")]
    All,

    /// Account and message API access.
    #[serde(rename = "api")]
    Api,

    /// Metrics read access.
    #[serde(rename = "metrics")]
    Metrics,
}

impl std::str::FromStr for Scope {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "*" => Ok(Self::All),
            "api" => Ok(Self::Api),
            "metrics" => Ok(Self::Metrics),
            other => Err(TokenError::UnknownScope(other.to_string())),
        }
    }
}

/// Errors returned by token operations.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// A scope string outside the accepted set.
    #[error("unknown scope: {0}")]
    UnknownScope(String),

    /// Import data is not valid base64url.
    #[error("token import is not valid base64url")]
    BadEncoding,

    /// Import data is not a valid token record.
    #[error("token import decode: {0}")]
    Decode(#[source] rmp_serde::decode::Error),

    /// Token record encode error.
    #[error("token export encode: {0}")]
    Encode(#[source] rmp_serde::encode::Error),

    /// The password does not meet the minimum length.
    #[error("password must be at least {MIN_PASSWORD_LEN} characters")]
    PasswordTooShort,

    /// Password hashing error.
    #[error("password hashing failed")]
    Hashing,
}

/// A persisted token record.
///
/// The key itself is never stored; only its SHA-256 digest is.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TokenRecord {
    /// Token id.
    pub id: String,

    /// Authorized scopes.
    pub scopes: BTreeSet<Scope>,

    /// Operator-supplied description.
    pub description: String,

    /// Issue time.
    pub created: DateTime<Utc>,

    /// SHA-256 digest of the token key.
    pub key_digest: [u8; 32],
}

impl TokenRecord {
    /// Whether the presented key matches this record.
    pub fn authorizes(&self, presented_key: &str) -> bool {
        let Ok(raw) = URL_SAFE_NO_PAD.decode(presented_key) else {
            return false;
        };
        let digest: [u8; 32] = Sha256::digest(&raw).into();
        // Constant-time enough for an offline CLI check; API-side checks go
        // through the same digest comparison.
        digest == self.key_digest
    }
}

/// An issued token: the record to persist plus the one-time-visible key.
#[derive(Debug)]
pub struct IssuedToken {
    /// The record to persist.
    pub record: TokenRecord,

    /// The base64url key to hand to the operator. Not recoverable later.
    pub key: String,
}

/// Issue a new token with the given scopes.
pub fn issue(scopes: BTreeSet<Scope>, description: impl Into<String>) -> IssuedToken {
    let mut raw = [0u8; TOKEN_KEY_BYTES];
    rand::rng().fill_bytes(&mut raw);

    let record = TokenRecord {
        id: uuid::Uuid::new_v4().simple().to_string(),
        scopes,
        description: description.into(),
        created: Utc::now(),
        key_digest: Sha256::digest(raw).into(),
    };

    IssuedToken {
        record,
        key: URL_SAFE_NO_PAD.encode(raw),
    }
}

/// Export a token record as base64url-wrapped MessagePack.
pub fn export(record: &TokenRecord) -> Result<String, TokenError> {
    let packed = rmp_serde::to_vec_named(record).map_err(TokenError::Encode)?;
    Ok(URL_SAFE_NO_PAD.encode(packed))
}

/// Import a token record previously produced by [`export`].
pub fn import(exported: &str) -> Result<TokenRecord, TokenError> {
    let packed = URL_SAFE_NO_PAD
        .decode(exported.trim())
        .map_err(|_| TokenError::BadEncoding)?;
    rmp_serde::from_slice(&packed).map_err(TokenError::Decode)
}

/// Hash an admin password with Argon2id, producing a PHC string.
pub fn hash_password(password: &str) -> Result<String, TokenError> {
    use argon2::password_hash::{PasswordHasher as _, SaltString};

    if password.len() < MIN_PASSWORD_LEN {
        return Err(TokenError::PasswordTooShort);
    }

    let salt = SaltString::generate(&mut argon2::password_hash::rand_core::OsRng);
    let hash = argon2::Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|_| TokenError::Hashing)?;
    Ok(hash.to_string())
}

/// Verify an admin password against a stored PHC string.
pub fn verify_password(password: &str, stored: &str) -> bool {
    use argon2::password_hash::{PasswordHash, PasswordVerifier as _};

    let Ok(parsed) = PasswordHash::new(stored) else {
        return false;
    };
    argon2::Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Generate a random admin password.
pub fn generate_password() -> String {
    let mut raw = [0u8; 12];
    rand::rng().fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}

/// Base64url of the SHA-256 digest of a stored hash, for `--hash` output.
pub fn hash_fingerprint(stored: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(stored.as_bytes()))
}
