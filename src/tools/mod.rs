//! Chat-invocable authentication tools and the status resource.
//!
//! `AuthTools` is the only place that composes the store, the resolver and
//! the session manager. Query tooling sits on the other side of
//! [`AuthTools::ensure_connected`] and never sees the store.
//!
//! Store and config file IO runs on the blocking pool, never on the
//! runtime's worker threads.

use crate::credentials::{
    non_empty, scrub, secret_string, ConnectionOptions, CredentialRecord, CredentialStore,
    Identity, Provenance, ResolvedCredentials,
};
use crate::resolver::{CredentialResolver, Resolution};
use crate::session::{ConnectionError, SessionManager, SessionStatus};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::task;
use tracing::{info, warn};

#[cfg(test)]
mod tests;

pub const AUTHENTICATE_SNOWFLAKE: &str = "authenticate_snowflake";
pub const USE_SAVED_CREDENTIALS: &str = "use_saved_credentials";
pub const LIST_SAVED_CREDENTIALS: &str = "list_saved_credentials";
pub const DELETE_SAVED_CREDENTIALS: &str = "delete_saved_credentials";

pub const TOOL_NAMES: [&str; 4] = [
    AUTHENTICATE_SNOWFLAKE,
    USE_SAVED_CREDENTIALS,
    LIST_SAVED_CREDENTIALS,
    DELETE_SAVED_CREDENTIALS,
];

/// Errors surfaced to the caller of a tool.
///
/// Messages never contain a password.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("no saved credentials for {requested}")]
    CredentialsNotFound {
        requested: Identity,
        available: Vec<Identity>,
    },

    #[error("not connected to Snowflake. {hint}")]
    NotAuthenticated { saved: Vec<Identity>, hint: String },

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("credential storage failed: {0}")]
    Storage(String),

    #[error("tool `{0}` is disabled on this server")]
    ToolExcluded(String),
}

impl ToolError {
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::InvalidArguments(_) => "invalid_arguments",
            ToolError::CredentialsNotFound { .. } => "credentials_not_found",
            ToolError::NotAuthenticated { .. } => "not_authenticated",
            ToolError::Connection(e) => e.kind(),
            ToolError::Storage(_) => "storage_error",
            ToolError::ToolExcluded(_) => "tool_excluded",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ToolError::Connection(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Identities worth offering to the user alongside this error.
    pub fn available(&self) -> Option<&[Identity]> {
        match self {
            ToolError::CredentialsNotFound { available, .. } => Some(available),
            ToolError::NotAuthenticated { saved, .. } => Some(saved),
            _ => None,
        }
    }
}

/// Arguments of `authenticate_snowflake`.
#[derive(Debug, Deserialize)]
pub struct AuthenticateArgs {
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub user: String,
    #[serde(
        default = "secret_string::empty",
        deserialize_with = "secret_string::deserialize"
    )]
    pub password: SecretString,
    #[serde(flatten)]
    pub options: ConnectionOptions,
    #[serde(default = "default_save_credentials")]
    pub save_credentials: bool,
}

fn default_save_credentials() -> bool {
    true
}

/// Arguments of `use_saved_credentials`.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityArgs {
    pub account: String,
    pub user: String,
}

/// Arguments of `delete_saved_credentials`. Both or neither.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeleteArgs {
    pub account: Option<String>,
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthenticateOutcome {
    #[serde(flatten)]
    pub status: SessionStatus,
    /// `false` if saving was not requested or the store write failed
    pub saved: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SavedCredentials {
    pub credentials: Vec<Identity>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteOutcome {
    pub deleted: usize,
}

/// The status resource: the session view plus, when disconnected, what the
/// user can do about it.
#[derive(Debug, Clone, Serialize)]
pub struct AuthStatus {
    #[serde(flatten)]
    pub session: SessionStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub saved: Vec<Identity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl AuthStatus {
    /// Plain-text rendering for hosts that show resources verbatim.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let session = &self.session;

        if session.connected {
            let _ = writeln!(out, "Connected to Snowflake");
            if let Some(identity) = &session.identity {
                let _ = writeln!(out, "  Account:   {}", identity.account());
                let _ = writeln!(out, "  User:      {}", identity.user());
            }
            if let Some(provenance) = session.provenance {
                let _ = writeln!(out, "  Source:    {}", provenance);
            }

            let info = session.session.clone().unwrap_or_default();
            let requested = session.options.clone().unwrap_or_default();
            let rows = [
                ("Warehouse", info.warehouse.or(requested.warehouse)),
                ("Database", info.database.or(requested.database)),
                ("Schema", info.schema.or(requested.schema)),
                ("Role", info.role.or(requested.role)),
            ];
            for (label, value) in rows {
                if let Some(value) = value {
                    let _ = writeln!(out, "  {:<10} {}", format!("{}:", label), value);
                }
            }
            if let Some(connected_at) = session.connected_at {
                let _ = writeln!(out, "  Since:     {}", connected_at.to_rfc3339());
            }
            return out;
        }

        let _ = writeln!(out, "Not connected to Snowflake");
        if !self.saved.is_empty() {
            let mut by_account: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
            for identity in &self.saved {
                by_account
                    .entry(identity.account())
                    .or_default()
                    .push(identity.user());
            }
            let _ = writeln!(out, "Saved credentials:");
            for (account, users) in by_account {
                let _ = writeln!(out, "  {}: {}", account, users.join(", "));
            }
        }
        if let Some(last_error) = &session.last_error {
            let _ = writeln!(out, "Last error: {}", last_error);
        }
        if let Some(hint) = &self.hint {
            let _ = writeln!(out, "{}", hint);
        }
        out
    }
}

/// What to tell a user who has no live session.
pub fn reconnect_hint(saved: &[Identity]) -> String {
    if saved.is_empty() {
        format!(
            "Call {} with account, user and password to connect.",
            AUTHENTICATE_SNOWFLAKE
        )
    } else {
        format!(
            "Call {} with one of the saved identities, or {} with new credentials.",
            USE_SAVED_CREDENTIALS, AUTHENTICATE_SNOWFLAKE
        )
    }
}

/// The authentication tool surface.
pub struct AuthTools {
    store: Arc<dyn CredentialStore>,
    resolver: Arc<CredentialResolver>,
    sessions: Arc<SessionManager>,
    excluded: HashSet<String>,
}

impl AuthTools {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        resolver: CredentialResolver,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            store,
            resolver: Arc::new(resolver),
            sessions,
            excluded: HashSet::new(),
        }
    }

    /// Disables the named tools. Unknown names are logged and ignored.
    pub fn with_excluded<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            let name = name.into();
            if TOOL_NAMES.contains(&name.as_str()) {
                info!(tool = %name, "Tool disabled");
                self.excluded.insert(name);
            } else {
                warn!(tool = %name, "Ignoring exclusion of unknown tool");
            }
        }
        self
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Names of the tools this server offers.
    pub fn enabled_tools(&self) -> Vec<&'static str> {
        TOOL_NAMES
            .into_iter()
            .filter(|name| !self.excluded.contains(*name))
            .collect()
    }

    fn check_enabled(&self, tool: &str) -> Result<(), ToolError> {
        if self.excluded.contains(tool) {
            return Err(ToolError::ToolExcluded(tool.to_string()));
        }
        Ok(())
    }

    /// Connects with user-supplied credentials and saves them on success.
    pub async fn authenticate_snowflake(
        &self,
        args: AuthenticateArgs,
    ) -> Result<AuthenticateOutcome, ToolError> {
        self.check_enabled(AUTHENTICATE_SNOWFLAKE)?;

        let credentials = ResolvedCredentials {
            identity: Identity::new(&args.account, &args.user),
            password: args.password,
            options: args.options.normalized(),
            provenance: Provenance::Interactive,
        };

        let status = self.sessions.connect(&credentials).await?;

        // Once started, the save finishes even if this call is cancelled
        let saved = args.save_credentials && self.save(&credentials).await;

        Ok(AuthenticateOutcome { status, saved })
    }

    async fn save(&self, credentials: &ResolvedCredentials) -> bool {
        let record = CredentialRecord::from_resolved(credentials);
        match self.with_store(move |store| store.upsert(record)).await {
            Ok(()) => {
                info!(identity = %credentials.identity, "Saved Snowflake credentials");
                true
            }
            Err(e) => {
                warn!(
                    identity = %credentials.identity,
                    error = %scrub(&format!("{:#}", e), &credentials.password),
                    "Failed to save Snowflake credentials"
                );
                false
            }
        }
    }

    /// Connects with a saved identity.
    pub async fn use_saved_credentials(
        &self,
        args: IdentityArgs,
    ) -> Result<SessionStatus, ToolError> {
        self.check_enabled(USE_SAVED_CREDENTIALS)?;

        let identity = Identity::new(&args.account, &args.user);
        let lookup = identity.clone();
        let record = self
            .with_store(move |store| store.get(&lookup))
            .await
            .map_err(|e| ToolError::Storage(format!("{:#}", e)))?;

        let Some(record) = record else {
            return Err(ToolError::CredentialsNotFound {
                requested: identity,
                available: self.saved_identities().await,
            });
        };

        let status = self
            .sessions
            .connect(&ResolvedCredentials::from_record(&record))
            .await?;

        let used = identity.clone();
        if let Err(e) = self.with_store(move |store| store.mark_used(&used)).await {
            warn!(identity = %identity, error = %format!("{:#}", e), "Failed to refresh last_used_at");
        }

        Ok(status)
    }

    /// Lists saved identities. An unreadable store lists as empty.
    pub async fn list_saved_credentials(&self) -> Result<SavedCredentials, ToolError> {
        self.check_enabled(LIST_SAVED_CREDENTIALS)?;

        let credentials = self.saved_identities().await;
        Ok(SavedCredentials {
            count: credentials.len(),
            credentials,
        })
    }

    /// Deletes one identity when both fields are given, everything when neither is.
    pub async fn delete_saved_credentials(
        &self,
        args: DeleteArgs,
    ) -> Result<DeleteOutcome, ToolError> {
        self.check_enabled(DELETE_SAVED_CREDENTIALS)?;

        let storage = |e: anyhow::Error| ToolError::Storage(format!("{:#}", e));

        let deleted = match (non_empty(args.account), non_empty(args.user)) {
            (Some(account), Some(user)) => {
                let identity = Identity::new(account, user);
                let target = identity.clone();
                let removed = self
                    .with_store(move |store| store.delete(&target))
                    .await
                    .map_err(storage)?;
                info!(identity = %identity, removed, "Deleted saved credentials");
                usize::from(removed)
            }
            (None, None) => {
                let count = self
                    .with_store(|store| store.delete_all())
                    .await
                    .map_err(storage)?;
                info!(count, "Deleted all saved credentials");
                count
            }
            _ => {
                return Err(ToolError::InvalidArguments(
                    "give both account and user to delete one identity, or neither to delete all"
                        .to_string(),
                ))
            }
        };

        Ok(DeleteOutcome { deleted })
    }

    /// The status resource.
    pub async fn auth_status(&self) -> AuthStatus {
        let session = self.sessions.status().await;
        if session.connected {
            return AuthStatus {
                session,
                saved: Vec::new(),
                hint: None,
            };
        }

        let saved = self.saved_identities().await;
        AuthStatus {
            session,
            hint: Some(reconnect_hint(&saved)),
            saved,
        }
    }

    /// Entry point for query tooling: returns the live session, connecting
    /// from the static sources first if there is none.
    ///
    /// A source that resolves but fails to connect is reported as is; lower
    /// sources are not tried.
    pub async fn ensure_connected(&self) -> Result<SessionStatus, ToolError> {
        if self.sessions.is_connected().await {
            return Ok(self.sessions.status().await);
        }

        let resolver = Arc::clone(&self.resolver);
        let resolution = task::spawn_blocking(move || resolver.resolve())
            .await
            .map_err(|e| ToolError::Storage(format!("credential resolution failed: {}", e)))?;

        match resolution {
            Resolution::Resolved(credentials) => Ok(self.sessions.connect(&credentials).await?),
            Resolution::Unresolved { saved } => Err(ToolError::NotAuthenticated {
                hint: reconnect_hint(&saved),
                saved,
            }),
        }
    }

    async fn saved_identities(&self) -> Vec<Identity> {
        self.with_store(|store| store.list()).await.unwrap_or_else(|e| {
            warn!(error = %format!("{:#}", e), "Failed to list saved credentials");
            Vec::new()
        })
    }

    /// Runs `op` against the store on the blocking pool. The operation
    /// completes even if the returned future is dropped.
    async fn with_store<T, F>(&self, op: F) -> anyhow::Result<T>
    where
        F: FnOnce(&dyn CredentialStore) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|e| anyhow::anyhow!("credential store task failed: {}", e))?
    }
}
