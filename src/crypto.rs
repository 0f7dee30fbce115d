//! Symmetric authenticated encryption for at-rest token storage.
//!
//! Generalizes the encrypt/decrypt-with-graceful-degradation pattern: every
//! stored value is tagged with a prefix that records whether it is
//! encrypted, so legacy plaintext rows (or a deployment that never
//! configured a key) keep reading correctly.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use secrecy::{ExposeSecret, SecretBox};
use sha2::{Digest, Sha256};

const ENCRYPTED_PREFIX: &str = "enc:";

/// Wraps a 32-byte AES-256-GCM key. Construct via [`Encryptor::from_hex`]
/// or [`Encryptor::from_passphrase`] (SHA-256-derived, for keys of
/// arbitrary length).
pub struct Encryptor {
    key: SecretBox<[u8; 32]>,
}

impl Encryptor {
    pub fn from_hex(hex_key: &str) -> Result<Self, String> {
        let bytes = hex::decode(hex_key).map_err(|e| format!("invalid hex key: {e}"))?;
        if bytes.len() != 32 {
            return Err(format!("key must be 32 bytes, got {}", bytes.len()));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(Self {
            key: SecretBox::new(Box::new(key)),
        })
    }

    /// Derive a fixed-length key from an arbitrary-length passphrase via
    /// SHA-256, so a human-chosen secret can seed the cipher directly.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let hash = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&hash);
        Self {
            key: SecretBox::new(Box::new(key)),
        }
    }

    /// Encrypt `plaintext`, returning `"enc:<base64(nonce || ciphertext)>"`.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, String> {
        let cipher = Aes256Gcm::new_from_slice(self.key.expose_secret())
            .map_err(|e| format!("cipher init failed: {e}"))?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| format!("encryption failed: {e}"))?;

        let mut combined = nonce.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(format!("{ENCRYPTED_PREFIX}{}", STANDARD.encode(&combined)))
    }

    /// Decrypt a value produced by [`Encryptor::encrypt`]. Values without
    /// the `enc:` prefix are returned unchanged (legacy plaintext).
    pub fn decrypt(&self, stored: &str) -> Result<String, String> {
        let Some(encoded) = stored.strip_prefix(ENCRYPTED_PREFIX) else {
            return Ok(stored.to_string());
        };

        let combined = STANDARD
            .decode(encoded)
            .map_err(|e| format!("invalid base64: {e}"))?;
        if combined.len() < 12 {
            return Err("ciphertext too short to contain a nonce".into());
        }

        let (nonce_bytes, ciphertext) = combined.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        let cipher = Aes256Gcm::new_from_slice(self.key.expose_secret())
            .map_err(|e| format!("cipher init failed: {e}"))?;

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| format!("decryption failed: {e}"))?;
        String::from_utf8(plaintext).map_err(|e| format!("decrypted data is not utf-8: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let enc = Encryptor::from_passphrase("test-passphrase");
        let ciphertext = enc.encrypt("super-secret-token").unwrap();
        assert!(ciphertext.starts_with(ENCRYPTED_PREFIX));
        assert_eq!(enc.decrypt(&ciphertext).unwrap(), "super-secret-token");
    }

    #[test]
    fn legacy_plaintext_passes_through() {
        let enc = Encryptor::from_passphrase("test-passphrase");
        assert_eq!(enc.decrypt("plain-value").unwrap(), "plain-value");
    }

    #[test]
    fn nonce_differs_per_encryption() {
        let enc = Encryptor::from_passphrase("test-passphrase");
        let a = enc.encrypt("value").unwrap();
        let b = enc.encrypt("value").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_wrong_key_length() {
        assert!(Encryptor::from_hex("abcd").is_err());
    }
}
