//! Credential encryption at rest.
//!
//! Secrets are encrypted with AES-256-GCM under a key derived from the
//! process-supplied encryption secret. Stored values carry a format marker
//! so plaintext and encrypted values can be told apart on read; without a
//! configured secret, values are stored as explicitly-plaintext.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore as _;
use sha2::{Digest as _, Sha256};

/// Marker prefix on encrypted stored values.
const ENCRYPTED_PREFIX: &str = "$aes-gcm$";

/// Nonce size for AES-GCM.
const NONCE_SIZE: usize = 12;

/// Errors returned while sealing or opening secrets.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    /// The stored value is encrypted but no encryption secret is configured.
    #[error("stored secret is encrypted but no encryption secret is configured")]
    MissingKey,

    /// The stored value is not valid for the encrypted format.
    #[error("malformed encrypted secret")]
    Malformed,

    /// Decryption failed, usually meaning a wrong key or corrupted data.
    #[error("secret decryption failed")]
    Decrypt,

    /// Encryption failed.
    #[error("secret encryption failed")]
    Encrypt,
}

/// How a stored secret was found on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredForm {
    /// The value carried the encrypted marker.
    Encrypted,

    /// The value was stored as plaintext.
    Plaintext,
}

/// Seals and opens stored secrets.
///
/// With no configured encryption secret the vault passes values through
/// unchanged, but still refuses to open values that carry the encrypted
/// marker.
#[derive(Clone)]
pub struct SecretVault {
    /// The cipher, present when an encryption secret is configured.
    cipher: Option<Aes256Gcm>,
}

impl SecretVault {
    /// Build a vault from an optional process-supplied encryption secret.
    pub fn new(encryption_secret: Option<&str>) -> Self {
        let cipher = encryption_secret.map(|secret| {
            let key = Sha256::digest(secret.as_bytes());
            Aes256Gcm::new(&key.into())
        });
        Self { cipher }
    }

    /// Whether this vault encrypts values it seals.
    pub fn encrypts(&self) -> bool {
        self.cipher.is_some()
    }

    /// Seal a secret for storage.
    pub fn seal(&self, plaintext: &str) -> Result<String, SecretError> {
        let Some(cipher) = &self.cipher else {
            return Ok(plaintext.to_string());
        };

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| SecretError::Encrypt)?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(format!("{ENCRYPTED_PREFIX}{}", URL_SAFE_NO_PAD.encode(combined)))
    }

    /// Open a stored secret, reporting which form it was stored in.
    ///
    /// Databases mixing encrypted values with a key-less process are
    /// detected here: the marker is present but the vault has no cipher.
    pub fn open(&self, stored: &str) -> Result<(String, StoredForm), SecretError> {
        let Some(encoded) = stored.strip_prefix(ENCRYPTED_PREFIX) else {
            return Ok((stored.to_string(), StoredForm::Plaintext));
        };

        let cipher = self.cipher.as_ref().ok_or(SecretError::MissingKey)?;

        let combined = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| SecretError::Malformed)?;
        if combined.len() < NONCE_SIZE {
            return Err(SecretError::Malformed);
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext_bytes = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| SecretError::Decrypt)?;
        let plaintext = String::from_utf8(plaintext_bytes).map_err(|_| SecretError::Decrypt)?;

        Ok((plaintext, StoredForm::Encrypted))
    }

    /// Re-seal a stored secret under another vault's key.
    ///
    /// Used by the `encrypt` CLI command to rotate the encryption secret
    /// over existing records.
    pub fn reseal_into(&self, stored: &str, target: &SecretVault) -> Result<String, SecretError> {
        let (plaintext, _) = self.open(stored)?;
        target.seal(&plaintext)
    }
}

impl std::fmt::Debug for SecretVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretVault")
            .field("encrypts", &self.encrypts())
            .finish()
    }
}

/// Whether a stored value carries the encrypted marker.
pub fn is_encrypted(stored: &str) -> bool {
    stored.starts_with(ENCRYPTED_PREFIX)
}

/// Generate a random base64url secret of the given entropy in bytes.
///
/// Used to bootstrap the service secret on first start.
pub fn generate_secret(entropy_bytes: usize) -> String {
    let mut buf = vec![0u8; entropy_bytes];
    rand::rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let vault = SecretVault::new(Some("test-key"));

        let stored = vault.seal("hunter2!").unwrap();
        assert!(is_encrypted(&stored));

        let (plaintext, form) = vault.open(&stored).unwrap();
        assert_eq!(plaintext, "hunter2!");
        assert_eq!(form, StoredForm::Encrypted);
    }

    #[test]
    fn same_plaintext_seals_differently() {
        let vault = SecretVault::new(Some("test-key"));

        let a = vault.seal("password").unwrap();
        let b = vault.seal("password").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn keyless_vault_stores_plaintext() {
        let vault = SecretVault::new(None);

        let stored = vault.seal("password").unwrap();
        assert_eq!(stored, "password");
        assert!(!is_encrypted(&stored));

        let (plaintext, form) = vault.open(&stored).unwrap();
        assert_eq!(plaintext, "password");
        assert_eq!(form, StoredForm::Plaintext);
    }

    #[test]
    fn encrypted_value_without_key_is_detected() {
        let sealing = SecretVault::new(Some("test-key"));
        let stored = sealing.seal("password").unwrap();

        let keyless = SecretVault::new(None);
        assert!(matches!(
            keyless.open(&stored),
            Err(SecretError::MissingKey)
        ));
    }

    #[test]
    fn plaintext_value_with_key_reads_as_plaintext() {
        let vault = SecretVault::new(Some("test-key"));

        let (plaintext, form) = vault.open("legacy-password").unwrap();
        assert_eq!(plaintext, "legacy-password");
        assert_eq!(form, StoredForm::Plaintext);
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let sealing = SecretVault::new(Some("old-key"));
        let stored = sealing.seal("password").unwrap();

        let other = SecretVault::new(Some("new-key"));
        assert!(matches!(other.open(&stored), Err(SecretError::Decrypt)));
    }

    #[test]
    fn reseal_rotates_the_key() {
        let old = SecretVault::new(Some("old-key"));
        let new = SecretVault::new(Some("new-key"));

        let stored = old.seal("password").unwrap();
        let rotated = old.reseal_into(&stored, &new).unwrap();

        let (plaintext, _) = new.open(&rotated).unwrap();
        assert_eq!(plaintext, "password");
        assert!(old.open(&rotated).is_err());
    }

    #[test]
    fn generated_secrets_are_unique() {
        let a = generate_secret(32);
        let b = generate_secret(32);
        assert_ne!(a, b);
        assert!(a.len() >= 40);
    }
}
