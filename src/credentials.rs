//! Credential-at-rest encryption (A4, SPEC_FULL.md §4.11).
//!
//! Replaces the teacher's Vault-HTTP client and `pgp_sym_decrypt` secret
//! path with a single in-process AES-256-GCM primitive keyed by
//! `ENCRYPTION_KEY`. A random 96-bit nonce is generated per call and
//! prepended to the ciphertext; decryption splits it back off.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("ENCRYPTION_KEY is not configured")]
    KeyMissing,
    #[error("ENCRYPTION_KEY must decode to 32 bytes")]
    BadKeyLength,
    #[error("ciphertext is truncated")]
    Truncated,
    #[error("decryption failed")]
    DecryptFailed,
}

pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    /// Parses `ENCRYPTION_KEY` (hex or base64, 32 raw bytes either way) once
    /// at construction so a bad key fails fast rather than on first use.
    pub fn from_env() -> Result<Self, CredentialError> {
        let raw = crate::config::ENCRYPTION_KEY
            .as_ref()
            .ok_or(CredentialError::KeyMissing)?;
        Self::from_str(raw)
    }

    pub fn from_str(raw: &str) -> Result<Self, CredentialError> {
        let bytes = hex::decode(raw)
            .or_else(|_| {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD
                    .decode(raw)
                    .map_err(|_| ())
            })
            .map_err(|_| CredentialError::BadKeyLength)?;
        if bytes.len() != 32 {
            return Err(CredentialError::BadKeyLength);
        }
        let key = Key::<Aes256Gcm>::from_slice(&bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Seals `plaintext`, returning `nonce || ciphertext`.
    pub fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let mut out = self
            .cipher
            .encrypt(nonce, plaintext)
            .expect("AES-GCM encryption of bounded in-memory secret cannot fail");
        let mut sealed = nonce_bytes.to_vec();
        sealed.append(&mut out);
        sealed
    }

    /// Splits the nonce back off `sealed` and opens it.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CredentialError> {
        if sealed.len() < 12 {
            return Err(CredentialError::Truncated);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CredentialError::DecryptFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> CredentialCipher {
        CredentialCipher::from_str(&hex::encode([7u8; 32])).unwrap()
    }

    #[test]
    fn round_trips() {
        let cipher = test_key();
        let sealed = cipher.seal(b"sk-super-secret");
        let opened = cipher.open(&sealed).unwrap();
        assert_eq!(opened, b"sk-super-secret");
    }

    #[test]
    fn rejects_bad_key_length() {
        assert!(matches!(
            CredentialCipher::from_str("not-32-bytes"),
            Err(CredentialError::BadKeyLength)
        ));
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let cipher = test_key();
        let mut sealed = cipher.seal(b"hello");
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(cipher.open(&sealed).is_err());
    }
}
