//! Encrypted credential storage in a single file.
//!
//! The whole identity → record mapping is serialized, encrypted and written as
//! one blob. Every mutation is a read-modify-encrypt-write cycle guarded by a
//! mutex and finished with an atomic rename, so concurrent tool calls cannot
//! lose each other's updates and a crash mid-write leaves the previous file.

use super::cipher::SecretCipher;
use super::fs::write_atomic;
use super::{CredentialRecord, Identity};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Leading bytes of every store file.
const STORE_MAGIC: &[u8; 4] = b"SFMC";

/// Current on-disk format. Files with any other version are not parsed.
const FORMAT_VERSION: u8 = 1;

const HEADER_LEN: usize = STORE_MAGIC.len() + 1;

/// Capability interface over saved credentials.
///
/// The resolver and the tools only see this trait, so the encrypted-file
/// backend can be swapped for a secret-manager backed one.
pub trait CredentialStore: Send + Sync {
    /// Inserts or replaces the record for `record.identity`.
    fn upsert(&self, record: CredentialRecord) -> Result<()>;

    /// Returns the record for `identity`, if any.
    fn get(&self, identity: &Identity) -> Result<Option<CredentialRecord>>;

    /// Lists saved identities in (account, user) order. Never returns secrets.
    fn list(&self) -> Result<Vec<Identity>>;

    /// Removes one record. Returns `true` if it existed.
    fn delete(&self, identity: &Identity) -> Result<bool>;

    /// Removes every record. Returns how many were removed.
    fn delete_all(&self) -> Result<usize>;

    /// Refreshes `last_used_at`. Returns `false` if the identity is unknown.
    fn mark_used(&self, identity: &Identity) -> Result<bool>;
}

/// Plaintext layout of the store, before encryption.
#[derive(Serialize, Deserialize, Default)]
struct StoreDocument {
    records: Vec<CredentialRecord>,
}

type RecordMap = BTreeMap<Identity, CredentialRecord>;

/// Credential store backed by one AES-256-GCM encrypted file.
///
/// # File format
/// ```text
/// "SFMC" | version (1 byte) | nonce (12 bytes) | ciphertext + tag
/// ```
///
/// # Failure semantics
/// - Missing file: empty store
/// - Unknown header, wrong key, corrupt ciphertext or bad JSON: warning, empty store.
///   The next mutation rewrites the file in the current format.
/// - Other IO errors are returned to the caller
pub struct EncryptedFileStore {
    path: PathBuf,
    cipher: SecretCipher,
    write_lock: Mutex<()>,
}

impl EncryptedFileStore {
    /// Opens the store at `store_path`, loading or generating the key at `key_path`.
    ///
    /// The store file itself is not read until first use.
    pub fn open(store_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cipher = SecretCipher::load_or_create(key_path.as_ref())
            .context("Failed to initialize credential encryption key")?;

        Ok(Self::with_cipher(store_path, cipher))
    }

    /// Opens the store with an already loaded cipher.
    pub fn with_cipher(store_path: impl AsRef<Path>, cipher: SecretCipher) -> Self {
        Self {
            path: store_path.as_ref().to_path_buf(),
            cipher,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<RecordMap> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(RecordMap::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read credential store {}", self.path.display())
                })
            }
        };

        match self.decode(&bytes) {
            Ok(records) => Ok(records),
            Err(reason) => {
                warn!(
                    path = %self.path.display(),
                    reason = reason,
                    "Credential store is unreadable, treating it as empty"
                );
                Ok(RecordMap::new())
            }
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<RecordMap, &'static str> {
        if bytes.len() < HEADER_LEN || &bytes[..STORE_MAGIC.len()] != STORE_MAGIC {
            return Err("unrecognized file header");
        }
        if bytes[STORE_MAGIC.len()] != FORMAT_VERSION {
            return Err("unsupported format version");
        }

        let plaintext = Zeroizing::new(
            self.cipher
                .decrypt(&bytes[HEADER_LEN..])
                .map_err(|_| "decryption failed")?,
        );

        let document: StoreDocument =
            serde_json::from_slice(&plaintext).map_err(|_| "malformed contents")?;

        Ok(document
            .records
            .into_iter()
            .map(|record| (record.identity.clone(), record))
            .collect())
    }

    fn save(&self, records: &RecordMap) -> Result<()> {
        let document = StoreDocument {
            records: records.values().cloned().collect(),
        };
        let plaintext = Zeroizing::new(
            serde_json::to_vec(&document).context("Failed to serialize credential store")?,
        );

        let ciphertext = self
            .cipher
            .encrypt(&plaintext)
            .context("Failed to encrypt credential store")?;

        let mut blob = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        blob.extend_from_slice(STORE_MAGIC);
        blob.push(FORMAT_VERSION);
        blob.extend_from_slice(&ciphertext);

        write_atomic(&self.path, &blob).context("Failed to write credential store")
    }

    /// Runs one serialized read-modify-write cycle.
    ///
    /// `apply` returns its result and whether the map changed; unchanged maps
    /// are not rewritten.
    fn mutate<T>(&self, apply: impl FnOnce(&mut RecordMap) -> (T, bool)) -> Result<T> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut records = self.load()?;
        let (result, changed) = apply(&mut records);
        if changed {
            self.save(&records)?;
        }

        Ok(result)
    }
}

impl CredentialStore for EncryptedFileStore {
    fn upsert(&self, mut record: CredentialRecord) -> Result<()> {
        let identity = record.identity.clone();

        self.mutate(|records| {
            if let Some(existing) = records.get(&record.identity) {
                record.created_at = existing.created_at;
            }
            records.insert(record.identity.clone(), record);
            ((), true)
        })?;

        debug!(account = %identity.account(), user = %identity.user(), "Saved credentials");
        Ok(())
    }

    fn get(&self, identity: &Identity) -> Result<Option<CredentialRecord>> {
        Ok(self.load()?.remove(identity))
    }

    fn list(&self) -> Result<Vec<Identity>> {
        Ok(self.load()?.into_keys().collect())
    }

    fn delete(&self, identity: &Identity) -> Result<bool> {
        let removed = self.mutate(|records| {
            let removed = records.remove(identity).is_some();
            (removed, removed)
        })?;

        if removed {
            debug!(account = %identity.account(), user = %identity.user(), "Deleted saved credentials");
        }
        Ok(removed)
    }

    fn delete_all(&self) -> Result<usize> {
        let count = self.mutate(|records| {
            let count = records.len();
            records.clear();
            (count, count > 0)
        })?;

        debug!(count = count, "Deleted all saved credentials");
        Ok(count)
    }

    fn mark_used(&self, identity: &Identity) -> Result<bool> {
        self.mutate(|records| match records.get_mut(identity) {
            Some(record) => {
                record.last_used_at = Utc::now();
                (true, true)
            }
            None => (false, false),
        })
    }
}
