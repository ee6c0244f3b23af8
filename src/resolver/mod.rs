//! Credential resolution across the static sources.
//!
//! Precedence, first complete source wins:
//! 1. JSON config file (`account`, `user`, `password` required)
//! 2. CLI flags given at process start
//! 3. `SNOWFLAKE_*` environment variables
//!
//! Every source is all-or-nothing for the required fields: a source missing any
//! of them is skipped, never partially used. Optional fields left unset by the
//! winning source are filled from the lower sources in the same order.
//!
//! When no static source resolves, the caller gets the saved identities so it
//! can prompt for `authenticate_snowflake` or `use_saved_credentials`. A source
//! that resolves but later fails to connect is not retried against the next one.

use crate::credentials::{
    non_empty, ConnectionOptions, CredentialStore, Identity, Provenance, ResolvedCredentials,
};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};


pub const ENV_ACCOUNT: &str = "SNOWFLAKE_ACCOUNT";
pub const ENV_USER: &str = "SNOWFLAKE_USER";
pub const ENV_PASSWORD: &str = "SNOWFLAKE_PASSWORD";
pub const ENV_WAREHOUSE: &str = "SNOWFLAKE_WAREHOUSE";
pub const ENV_DATABASE: &str = "SNOWFLAKE_DATABASE";
pub const ENV_SCHEMA: &str = "SNOWFLAKE_SCHEMA";
pub const ENV_ROLE: &str = "SNOWFLAKE_ROLE";

/// Credentials as one source supplied them, possibly incomplete.
#[derive(Clone, Debug, Default)]
pub struct PartialCredentials {
    pub account: Option<String>,
    pub user: Option<String>,
    pub password: Option<SecretString>,
    pub options: ConnectionOptions,
}

impl PartialCredentials {
    /// Reads the `SNOWFLAKE_*` variables of the current process.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds from any name → value lookup using the `SNOWFLAKE_*` names.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            account: lookup(ENV_ACCOUNT),
            user: lookup(ENV_USER),
            password: lookup(ENV_PASSWORD).map(SecretString::from),
            options: ConnectionOptions {
                warehouse: lookup(ENV_WAREHOUSE),
                database: lookup(ENV_DATABASE),
                schema: lookup(ENV_SCHEMA),
                role: lookup(ENV_ROLE),
            },
        }
    }

    /// Required fields that are absent or blank.
    pub fn missing_required(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if non_empty(self.account.clone()).is_none() {
            missing.push("account");
        }
        if non_empty(self.user.clone()).is_none() {
            missing.push("user");
        }
        let password_set = self
            .password
            .as_ref()
            .map(|p| !p.expose_secret().is_empty())
            .unwrap_or(false);
        if !password_set {
            missing.push("password");
        }
        missing
    }

    /// `true` if the source supplied nothing at all.
    pub fn is_empty(&self) -> bool {
        self.missing_required().len() == 3
            && self.options.clone().normalized() == ConnectionOptions::default()
    }

    /// Completes into resolved credentials only if every required field is set.
    fn complete(&self, provenance: Provenance) -> Option<ResolvedCredentials> {
        if !self.missing_required().is_empty() {
            return None;
        }

        Some(ResolvedCredentials {
            identity: Identity::new(self.account.as_deref()?, self.user.as_deref()?),
            password: self.password.clone()?,
            options: self.options.clone().normalized(),
            provenance,
        })
    }
}

/// Malformed connection config file. Logged and treated as absent.
#[derive(Debug, thiserror::Error)]
pub enum ConfigParseError {
    #[error("failed to read {path}: {message}")]
    Unreadable { path: String, message: String },

    #[error("{path} is not a JSON object ({detail})")]
    InvalidJson { path: String, detail: String },

    #[error("{path} is missing required keys: {}", .missing.join(", "))]
    MissingFields {
        path: String,
        missing: Vec<&'static str>,
    },
}

/// Reads the JSON connection config file.
///
/// Returns `Ok(None)` when the file does not exist. Error messages carry only
/// the path and the JSON position, never field values.
pub fn load_config_file(path: &Path) -> Result<Option<PartialCredentials>, ConfigParseError> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(path).map_err(|e| ConfigParseError::Unreadable {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let object: Map<String, Value> =
        serde_json::from_str(&contents).map_err(|e| ConfigParseError::InvalidJson {
            path: path.display().to_string(),
            detail: format!("{:?} error at line {} column {}", e.classify(), e.line(), e.column()),
        })?;

    let field = |key: &str| object.get(key).and_then(Value::as_str).map(str::to_string);

    let credentials = PartialCredentials {
        account: field("account"),
        user: field("user"),
        password: field("password").map(SecretString::from),
        options: ConnectionOptions {
            warehouse: field("warehouse"),
            database: field("database"),
            schema: field("schema"),
            role: field("role"),
        },
    };

    let missing = credentials.missing_required();
    if !missing.is_empty() {
        return Err(ConfigParseError::MissingFields {
            path: path.display().to_string(),
            missing,
        });
    }

    Ok(Some(credentials))
}

/// The static credential sources known to this process.
///
/// CLI flags and environment are captured once at startup; the config file is
/// re-read on every resolution so edits apply to the next connection attempt.
#[derive(Clone, Debug, Default)]
pub struct CredentialSources {
    pub config_file: Option<PathBuf>,
    pub cli: PartialCredentials,
    pub env: PartialCredentials,
}

/// Outcome of one resolution attempt.
#[derive(Debug)]
pub enum Resolution {
    Resolved(ResolvedCredentials),
    /// No static source is complete. Carries the saved identities to offer.
    Unresolved { saved: Vec<Identity> },
}

/// Picks the authoritative credential set for a connection attempt.
pub struct CredentialResolver {
    sources: CredentialSources,
    store: Arc<dyn CredentialStore>,
}

impl CredentialResolver {
    pub fn new(sources: CredentialSources, store: Arc<dyn CredentialStore>) -> Self {
        Self { sources, store }
    }

    pub fn sources(&self) -> &CredentialSources {
        &self.sources
    }

    pub fn resolve(&self) -> Resolution {
        let file = self.sources.config_file.as_deref().and_then(|path| {
            load_config_file(path).unwrap_or_else(|e| {
                warn!(error = %e, "Ignoring connection config file");
                None
            })
        });

        let candidates = [
            (file.as_ref(), Provenance::ConfigFile),
            (Some(&self.sources.cli), Provenance::Cli),
            (Some(&self.sources.env), Provenance::Env),
        ];

        for (index, (source, provenance)) in candidates.iter().enumerate() {
            let Some(source) = source else {
                continue;
            };

            match source.complete(*provenance) {
                Some(mut resolved) => {
                    for (lower, _) in &candidates[index + 1..] {
                        if let Some(lower) = lower {
                            resolved.options = resolved.options.or(&lower.options.clone().normalized());
                        }
                    }

                    info!(
                        account = %resolved.identity.account(),
                        user = %resolved.identity.user(),
                        provenance = %resolved.provenance,
                        "Resolved Snowflake credentials"
                    );
                    return Resolution::Resolved(resolved);
                }
                None if !source.is_empty() => {
                    debug!(
                        source = %provenance,
                        missing = ?source.missing_required(),
                        "Skipping incomplete credential source"
                    );
                }
                None => {}
            }
        }

        let saved = self.store.list().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to list saved credentials");
            Vec::new()
        });

        debug!(saved = saved.len(), "No static credential source resolved");
        Resolution::Unresolved { saved }
    }
}
