//! In-memory Snowflake stand-in for unit tests.

use super::{ConnectionError, SessionHandle, SessionInfo, SnowflakeConnector};
use crate::credentials::{Identity, ResolvedCredentials};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub(crate) struct FakeConnector {
    accounts: Mutex<HashMap<Identity, String>>,
    pub login_delay: Mutex<Option<Duration>>,
    pub heartbeat_delay: Mutex<Option<Duration>>,
    pub logout_delay: Mutex<Option<Duration>>,
    pub unreachable: AtomicBool,
    pub heartbeat_fails: AtomicBool,
    pub logins: AtomicUsize,
    pub logouts: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(self, account: &str, user: &str, password: &str) -> Self {
        self.accounts
            .lock()
            .unwrap()
            .insert(Identity::new(account, user), password.to_string());
        self
    }

    pub fn logged_out(&self) -> Vec<String> {
        self.logouts.lock().unwrap().clone()
    }
}

#[async_trait]
impl SnowflakeConnector for FakeConnector {
    async fn login(&self, credentials: &ResolvedCredentials) -> Result<SessionHandle, ConnectionError> {
        let delay = *self.login_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ConnectionError::NetworkUnreachable {
                message: "connection refused".to_string(),
            });
        }

        let expected = self
            .accounts
            .lock()
            .unwrap()
            .get(&credentials.identity)
            .cloned();
        match expected {
            Some(password) if password == credentials.password.expose_secret() => {
                let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(SessionHandle {
                    endpoint: format!("fake://{}", credentials.identity.account()),
                    token: SecretString::from(format!("token-{}-{}", credentials.identity, n)),
                    master_token: SecretString::from(format!("master-{}", n)),
                    info: SessionInfo {
                        warehouse: credentials.options.warehouse.clone(),
                        database: credentials.options.database.clone(),
                        schema: credentials.options.schema.clone(),
                        role: credentials.options.role.clone().or(Some("PUBLIC".to_string())),
                    },
                })
            }
            _ => Err(ConnectionError::AuthenticationFailed {
                message: format!(
                    "Incorrect username or password was specified (tried {})",
                    credentials.password.expose_secret()
                ),
            }),
        }
    }

    async fn heartbeat(&self, _session: &SessionHandle) -> Result<(), ConnectionError> {
        let delay = *self.heartbeat_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.heartbeat_fails.load(Ordering::SeqCst) {
            Err(ConnectionError::AuthenticationFailed {
                message: "session expired".to_string(),
            })
        } else {
            Ok(())
        }
    }

    async fn logout(&self, session: &SessionHandle) -> Result<(), ConnectionError> {
        let delay = *self.logout_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.logouts
            .lock()
            .unwrap()
            .push(session.endpoint.clone());
        Ok(())
    }
}
