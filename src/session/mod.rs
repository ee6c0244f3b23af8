//! The process-wide Snowflake session.
//!
//! At most one session is active. Connecting with new credentials logs in
//! first and only then swaps the new session in, so a failed or cancelled
//! attempt leaves the previous session untouched. The replaced session is
//! logged out afterwards on a best-effort basis, on its own task so the
//! logout still happens if the caller goes away.

pub mod client;

#[cfg(test)]
pub(crate) mod fake;

pub use client::{RestConnector, SessionHandle, SessionInfo, SnowflakeConnector};

use crate::credentials::{scrub, ConnectionOptions, Identity, Provenance, ResolvedCredentials};
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Why a connection attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// Snowflake rejected the account, user or password.
    #[error("authentication failed: {message}")]
    AuthenticationFailed { message: String },

    /// Snowflake could not be reached, or did not answer in time.
    #[error("Snowflake is unreachable: {message}")]
    NetworkUnreachable { message: String },

    /// Required fields are missing or the requested context does not exist.
    #[error("invalid connection configuration: {message}")]
    ConfigurationInvalid { message: String },
}

impl ConnectionError {
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionError::AuthenticationFailed { .. } => "authentication_failed",
            ConnectionError::NetworkUnreachable { .. } => "network_unreachable",
            ConnectionError::ConfigurationInvalid { .. } => "configuration_invalid",
        }
    }

    /// Only transport problems are worth retrying unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectionError::NetworkUnreachable { .. })
    }

    /// Masks every occurrence of `password` in the message.
    pub fn scrubbed(self, password: &SecretString) -> Self {
        match self {
            ConnectionError::AuthenticationFailed { message } => {
                ConnectionError::AuthenticationFailed {
                    message: scrub(&message, password),
                }
            }
            ConnectionError::NetworkUnreachable { message } => {
                ConnectionError::NetworkUnreachable {
                    message: scrub(&message, password),
                }
            }
            ConnectionError::ConfigurationInvalid { message } => {
                ConnectionError::ConfigurationInvalid {
                    message: scrub(&message, password),
                }
            }
        }
    }
}

/// Snapshot of the session state, safe to serialize.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
    /// Context requested at login
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<ConnectionOptions>,
    /// Context Snowflake reported back
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

struct ActiveSession {
    identity: Identity,
    provenance: Provenance,
    options: ConnectionOptions,
    handle: Arc<SessionHandle>,
    connected_at: DateTime<Utc>,
}

impl ActiveSession {
    fn status(&self) -> SessionStatus {
        SessionStatus {
            connected: true,
            identity: Some(self.identity.clone()),
            provenance: Some(self.provenance),
            options: Some(self.options.clone()),
            session: Some(self.handle.info.clone()),
            connected_at: Some(self.connected_at),
            last_error: None,
        }
    }
}

/// Owns the single active Snowflake session.
pub struct SessionManager {
    connector: Arc<dyn SnowflakeConnector>,
    login_timeout: Duration,
    active: Mutex<Option<ActiveSession>>,
    last_error: StdMutex<Option<String>>,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn SnowflakeConnector>, login_timeout: Duration) -> Self {
        Self {
            connector,
            login_timeout,
            active: Mutex::new(None),
            last_error: StdMutex::new(None),
        }
    }

    /// Opens a session for `credentials` and makes it the active one.
    ///
    /// On failure the previous session, if any, stays active.
    pub async fn connect(
        &self,
        credentials: &ResolvedCredentials,
    ) -> Result<SessionStatus, ConnectionError> {
        let missing = credentials.missing_fields();
        if !missing.is_empty() {
            let err = ConnectionError::ConfigurationInvalid {
                message: format!("missing required fields: {}", missing.join(", ")),
            };
            self.record_error(&err);
            return Err(err);
        }

        info!(
            account = %credentials.identity.account(),
            user = %credentials.identity.user(),
            provenance = %credentials.provenance,
            "Connecting to Snowflake"
        );

        let login = tokio::time::timeout(self.login_timeout, self.connector.login(credentials));
        let handle = match login.await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                let err = e.scrubbed(&credentials.password);
                warn!(
                    account = %credentials.identity.account(),
                    user = %credentials.identity.user(),
                    kind = err.kind(),
                    error = %err,
                    "Snowflake login failed"
                );
                self.record_error(&err);
                return Err(err);
            }
            Err(_) => {
                let err = ConnectionError::NetworkUnreachable {
                    message: format!(
                        "login did not complete within {}s",
                        self.login_timeout.as_secs()
                    ),
                };
                warn!(account = %credentials.identity.account(), error = %err, "Snowflake login timed out");
                self.record_error(&err);
                return Err(err);
            }
        };

        let session = ActiveSession {
            identity: credentials.identity.clone(),
            provenance: credentials.provenance,
            options: credentials.options.clone(),
            handle: Arc::new(handle),
            connected_at: Utc::now(),
        };
        let status = session.status();

        let previous = self.active.lock().await.replace(session);
        let logout = previous.map(|previous| self.spawn_logout(previous));
        self.clear_error();

        info!(
            account = %credentials.identity.account(),
            user = %credentials.identity.user(),
            warehouse = ?status.session.as_ref().and_then(|s| s.warehouse.as_deref()),
            "Connected to Snowflake"
        );

        if let Some(logout) = logout {
            join_logout(logout).await;
        }

        Ok(status)
    }

    /// Runs `SELECT 1` on the active session. `false` when disconnected.
    pub async fn test(&self) -> bool {
        // The lock is released before the round trip
        let (identity, handle) = match self.active.lock().await.as_ref() {
            Some(session) => (session.identity.clone(), Arc::clone(&session.handle)),
            None => return false,
        };

        match tokio::time::timeout(self.login_timeout, self.connector.heartbeat(&handle)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(identity = %identity, error = %e, "Connection test failed");
                false
            }
            Err(_) => {
                warn!(identity = %identity, "Connection test timed out");
                false
            }
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.active.lock().await.is_some()
    }

    pub async fn status(&self) -> SessionStatus {
        let mut status = self
            .active
            .lock()
            .await
            .as_ref()
            .map(ActiveSession::status)
            .unwrap_or_default();
        status.last_error = self.last_error();
        status
    }

    /// Closes the active session. Calling it again is a no-op.
    pub async fn close(&self) {
        let previous = self.active.lock().await.take();
        if let Some(previous) = previous {
            join_logout(self.spawn_logout(previous)).await;
        }
    }

    /// Most recent connection failure, cleared by the next successful connect.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Records a failure that happened outside [`SessionManager::connect`],
    /// such as a startup resolution that found nothing to connect with.
    pub fn record_error(&self, err: &dyn std::fmt::Display) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err.to_string());
    }

    fn clear_error(&self) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn spawn_logout(&self, session: ActiveSession) -> JoinHandle<()> {
        let connector = Arc::clone(&self.connector);
        let timeout = self.login_timeout;

        tokio::spawn(async move {
            match tokio::time::timeout(timeout, connector.logout(&session.handle)).await {
                Ok(Ok(())) => info!(identity = %session.identity, "Closed Snowflake session"),
                Ok(Err(e)) => {
                    warn!(identity = %session.identity, error = %e, "Snowflake logout failed")
                }
                Err(_) => warn!(identity = %session.identity, "Snowflake logout timed out"),
            }
        })
    }
}

async fn join_logout(task: JoinHandle<()>) {
    if let Err(e) = task.await {
        warn!(error = %e, "Snowflake logout task failed");
    }
}
