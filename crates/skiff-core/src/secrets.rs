use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, OsRng},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("encryption failed: {0}")]
    Encrypt(String),
    #[error("decryption failed: {0}")]
    Decrypt(String),
    #[error("malformed ciphertext: {0}")]
    Malformed(String),
}

const NONCE_LEN: usize = 12;

/// Encrypts credentials and console history at rest with AES-256-GCM.
/// Ciphertext is `base64(nonce || ciphertext)`, a fresh random nonce per
/// call, so encrypting the same plaintext twice yields different strings.
#[derive(Clone)]
pub struct SecretStore {
    cipher: Aes256Gcm,
}

impl SecretStore {
    /// Key is derived from the `SKIFF_SECRET_KEY` environment variable.
    /// Deployments without one fall back to a fixed development key.
    pub fn new() -> Self {
        let passphrase = std::env::var("SKIFF_SECRET_KEY")
            .unwrap_or_else(|_| "skiff-development-key-change-me".to_string());
        Self::with_passphrase(&passphrase)
    }

    pub fn with_passphrase(passphrase: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(passphrase.as_bytes());
        let key: [u8; 32] = hasher.finalize().into();
        SecretStore {
            cipher: Aes256Gcm::new(&key.into()),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, SecretError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| SecretError::Encrypt(e.to_string()))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(&combined))
    }

    pub fn decrypt(&self, encrypted: &str) -> Result<String, SecretError> {
        let data = BASE64
            .decode(encrypted)
            .map_err(|e| SecretError::Malformed(e.to_string()))?;
        if data.len() < NONCE_LEN {
            return Err(SecretError::Malformed("ciphertext too short".into()));
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| SecretError::Decrypt(e.to_string()))?;
        String::from_utf8(plaintext).map_err(|e| SecretError::Malformed(e.to_string()))
    }
}

impl Default for SecretStore {
    fn default() -> Self {
        Self::new()
    }
}
