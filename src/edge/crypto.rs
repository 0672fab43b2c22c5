//! Envelope encryption for stored provider credentials.
//!
//! AES-256-GCM with a process-wide master key. Each encrypted blob is stored
//! as `base64( [12-byte nonce][ciphertext+tag] )`; the nonce is generated per
//! write via `OsRng`, so encrypting the same plaintext twice yields distinct
//! blobs. Plaintext API keys exist only transiently inside encrypt/decrypt.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use thiserror::Error;

/// AES-256-GCM nonce length (96 bits).
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("master key must be 32 bytes (got {0})")]
    InvalidKeyLength(usize),
    #[error("master key is not valid base64")]
    InvalidKeyEncoding,
    #[error("encryption failed")]
    EncryptFailed,
    /// Wrong key, tampered blob, or truncated nonce. Surfaced as DECRYPT_FAILED.
    #[error("decryption failed")]
    DecryptFailed,
}

/// Authenticated encryption around a 32-byte master key.
#[derive(Clone)]
pub struct Envelope {
    cipher: Aes256Gcm,
}

impl Envelope {
    pub fn new(key_bytes: &[u8]) -> Result<Self, CryptoError> {
        if key_bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength(key_bytes.len()));
        }
        let key = Key::<Aes256Gcm>::from_slice(key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Parses a base64-encoded 32-byte master key (the `DEVSMITH_MASTER_KEY` format).
    pub fn from_base64_key(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = B64
            .decode(encoded.trim())
            .map_err(|_| CryptoError::InvalidKeyEncoding)?;
        Self::new(&bytes)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::EncryptFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(B64.encode(blob))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, CryptoError> {
        let blob = B64.decode(encoded).map_err(|_| CryptoError::DecryptFailed)?;
        if blob.len() <= NONCE_LEN {
            return Err(CryptoError::DecryptFailed);
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptFailed)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptFailed)
    }
}
