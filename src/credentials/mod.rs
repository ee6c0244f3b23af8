//! Snowflake credential model and encrypted-at-rest storage.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore (trait)            │
//! │  - upsert / get / list / delete          │
//! │  - EncryptedFileStore implementation     │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (encrypt)            (decrypt)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       SecretCipher                       │
//! │  - AES-256-GCM, fresh nonce per write    │
//! │  - key lives in its own 0600 key file    │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       credentials.enc                    │
//! │  - single versioned ciphertext blob      │
//! │  - replaced atomically (tmp + rename)    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use snowflake_mcp::credentials::{
//!     ConnectionOptions, CredentialRecord, CredentialStore, EncryptedFileStore, Identity,
//! };
//!
//! # fn main() -> anyhow::Result<()> {
//! let store = EncryptedFileStore::open("/tmp/snowflake-mcp/credentials.enc", "/tmp/snowflake-mcp/.key")?;
//!
//! let identity = Identity::new("acme-x", "alice");
//! let record = CredentialRecord::new(identity.clone(), "p1".to_string().into(), ConnectionOptions::default());
//! store.upsert(record)?;
//!
//! assert!(store.get(&identity)?.is_some());
//! assert_eq!(store.list()?, vec![identity]);
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - Passwords are `SecretString` from the moment they are received; `Debug` is redacted
//! - The whole mapping is encrypted as one blob, never one field at a time
//! - The key file and the store file are always separate files
//! - Losing the key file makes every prior store permanently unreadable

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

pub mod cipher;
pub(crate) mod fs;
mod storage;

pub use cipher::{DecryptionError, SecretCipher};
pub use storage::{CredentialStore, EncryptedFileStore};

/// The (account, user) pair that keys a stored credential record.
///
/// Account identifiers are case-insensitive on Snowflake's side, so the account
/// is lowercased on construction. Usernames are kept as provided (only trimmed).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity {
    account: String,
    user: String,
}

impl Identity {
    pub fn new(account: impl AsRef<str>, user: impl AsRef<str>) -> Self {
        Self {
            account: account.as_ref().trim().to_lowercase(),
            user: user.as_ref().trim().to_string(),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn user(&self) -> &str {
        &self.user
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.account)
    }
}

/// Optional session defaults sent with the login handshake.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warehouse: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl ConnectionOptions {
    /// Fill every unset field from `fallback`; fields already set are kept.
    pub fn or(self, fallback: &ConnectionOptions) -> Self {
        Self {
            warehouse: self.warehouse.or_else(|| fallback.warehouse.clone()),
            database: self.database.or_else(|| fallback.database.clone()),
            schema: self.schema.or_else(|| fallback.schema.clone()),
            role: self.role.or_else(|| fallback.role.clone()),
        }
    }

    /// Drops empty strings so that `Some("")` never reaches the handshake.
    pub fn normalized(self) -> Self {
        Self {
            warehouse: non_empty(self.warehouse),
            database: non_empty(self.database),
            schema: non_empty(self.schema),
            role: non_empty(self.role),
        }
    }
}

pub(crate) fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// A saved credential set for one identity.
///
/// The password is only ever exposed when the store serializes the record into
/// the plaintext buffer it is about to encrypt, and when the connector builds
/// the login request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub identity: Identity,

    #[serde(with = "secret_string")]
    pub password: SecretString,

    #[serde(default)]
    pub options: ConnectionOptions,

    pub created_at: DateTime<Utc>,

    pub last_used_at: DateTime<Utc>,
}

impl CredentialRecord {
    /// Creates a record stamped with the current time.
    pub fn new(identity: Identity, password: SecretString, options: ConnectionOptions) -> Self {
        let now = Utc::now();
        Self {
            identity,
            password,
            options,
            created_at: now,
            last_used_at: now,
        }
    }

    /// Builds the record to persist after a successful connection.
    pub fn from_resolved(resolved: &ResolvedCredentials) -> Self {
        Self::new(
            resolved.identity.clone(),
            resolved.password.clone(),
            resolved.options.clone(),
        )
    }
}

/// Which source produced a resolved credential set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    ConfigFile,
    Cli,
    Env,
    Store,
    Interactive,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::ConfigFile => "config_file",
            Provenance::Cli => "cli",
            Provenance::Env => "env",
            Provenance::Store => "store",
            Provenance::Interactive => "interactive",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The credential set used for one connection attempt.
///
/// Lives only for the duration of the attempt; persisting it is an explicit
/// decision of the caller (see [`CredentialRecord::from_resolved`]).
#[derive(Clone, Debug)]
pub struct ResolvedCredentials {
    pub identity: Identity,
    pub password: SecretString,
    pub options: ConnectionOptions,
    pub provenance: Provenance,
}

impl ResolvedCredentials {
    pub fn from_record(record: &CredentialRecord) -> Self {
        Self {
            identity: record.identity.clone(),
            password: record.password.clone(),
            options: record.options.clone(),
            provenance: Provenance::Store,
        }
    }

    /// Names of required fields that are empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.identity.account().is_empty() {
            missing.push("account");
        }
        if self.identity.user().is_empty() {
            missing.push("user");
        }
        if self.password.expose_secret().is_empty() {
            missing.push("password");
        }
        missing
    }
}

/// Replaces every occurrence of `password` in `message` with a mask.
///
/// Applied to any text that may echo request data back (server error bodies,
/// transport errors) before it leaves the crate.
pub fn scrub(message: &str, password: &SecretString) -> String {
    let secret = password.expose_secret();
    if secret.is_empty() {
        return message.to_string();
    }
    message.replace(secret, "********")
}

pub(crate) mod secret_string {
    use super::*;

    pub fn empty() -> SecretString {
        SecretString::from(String::new())
    }

    pub fn serialize<S: Serializer>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(secret.expose_secret())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SecretString, D::Error> {
        String::deserialize(deserializer).map(SecretString::from)
    }
}
