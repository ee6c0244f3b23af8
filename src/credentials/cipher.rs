//! AES-256-GCM encryption for the credential store.
//!
//! The key is 32 random bytes kept base64-encoded in its own owner-only key file,
//! separate from the ciphertext. Every encryption uses a fresh random nonce which
//! is prepended to the output: `nonce (12 bytes) || ciphertext + tag`.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use rand::RngCore;
use std::fs;
use std::path::Path;
use tracing::{info, warn};
use zeroize::Zeroizing;

use super::fs::write_atomic;

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Ciphertext could not be decrypted.
///
/// Wrong key, truncated input and tampered bytes all collapse into this one
/// kind so callers cannot tell them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stored credentials could not be decrypted")]
pub struct DecryptionError;

/// Validates that a base64 key decodes to exactly 32 bytes.
///
/// # Returns
/// * `Ok(bytes)` - Decoded key bytes (32 bytes)
/// * `Err` - If key is invalid length or invalid base64
pub fn validate_key(key_base64: &str) -> Result<Zeroizing<Vec<u8>>> {
    let key_bytes = Zeroizing::new(
        BASE64
            .decode(key_base64.trim())
            .context("Failed to decode base64 encryption key")?,
    );

    if key_bytes.len() != KEY_SIZE {
        return Err(anyhow!(
            "Encryption key must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            key_bytes.len()
        ));
    }

    Ok(key_bytes)
}

/// Symmetric cipher bound to one key.
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    /// Builds a cipher from raw key bytes.
    pub fn from_key(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_SIZE {
            return Err(anyhow!("Encryption key must be {} bytes", KEY_SIZE));
        }

        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

        Ok(Self { cipher })
    }

    /// Loads the key from `key_path`, generating it on first use.
    ///
    /// A key file that exists but does not hold a valid key is moved aside to
    /// `<name>.invalid-<timestamp>` and replaced with a fresh key. Anything
    /// encrypted under the old key stays unreadable.
    pub fn load_or_create(key_path: &Path) -> Result<Self> {
        if key_path.exists() {
            let encoded = Zeroizing::new(
                fs::read_to_string(key_path)
                    .with_context(|| format!("Failed to read key file {}", key_path.display()))?,
            );

            match validate_key(&encoded) {
                Ok(key) => return Self::from_key(&key),
                Err(e) => {
                    let aside = key_path.with_file_name(format!(
                        "{}.invalid-{}",
                        key_path
                            .file_name()
                            .and_then(|n| n.to_str())
                            .unwrap_or("key"),
                        Utc::now().format("%Y%m%dT%H%M%S")
                    ));
                    warn!(
                        error = %e,
                        key_file = %key_path.display(),
                        moved_to = %aside.display(),
                        "Key file is unreadable, generating a new key"
                    );
                    fs::rename(key_path, &aside)
                        .context("Failed to move invalid key file aside")?;
                }
            }
        }

        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        OsRng.fill_bytes(&mut key[..]);
        let encoded = Zeroizing::new(BASE64.encode(&key[..]));

        write_atomic(key_path, encoded.as_bytes()).context("Failed to write key file")?;
        info!(key_file = %key_path.display(), "Generated new credential encryption key");

        Self::from_key(&key[..])
    }

    /// Encrypts `plaintext` under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        // Generate random nonce (never reuse!)
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;

        let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        output.extend_from_slice(&nonce);
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }

    /// Decrypts output of [`SecretCipher::encrypt`].
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptionError> {
        if ciphertext.len() < NONCE_SIZE {
            return Err(DecryptionError);
        }

        let (nonce_bytes, payload) = ciphertext.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, payload)
            .map_err(|_| DecryptionError)
    }
}
