//! Snowflake login handshake over the REST session API.
//!
//! `RestConnector` speaks the same endpoints the official drivers use:
//! `POST /session/v1/login-request` to authenticate, `POST /queries/v1/query-request`
//! for the liveness check and `POST /session?delete=true` to log out.

use super::ConnectionError;
use crate::config::ConnectionConfig;
use crate::credentials::ResolvedCredentials;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Session settings Snowflake reports back after login.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warehouse: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// A live, authenticated Snowflake session.
#[derive(Debug)]
pub struct SessionHandle {
    /// Base URL the session was opened against
    pub endpoint: String,
    pub token: SecretString,
    pub master_token: SecretString,
    pub info: SessionInfo,
}

/// Opens, checks and closes Snowflake sessions.
///
/// Implementations must classify every failure into a [`ConnectionError`] and
/// must not put the password into any error message.
#[async_trait]
pub trait SnowflakeConnector: Send + Sync {
    /// Performs the login handshake.
    async fn login(&self, credentials: &ResolvedCredentials) -> Result<SessionHandle, ConnectionError>;

    /// Runs a trivial query on the session.
    async fn heartbeat(&self, session: &SessionHandle) -> Result<(), ConnectionError>;

    /// Ends the session on the server side.
    async fn logout(&self, session: &SessionHandle) -> Result<(), ConnectionError>;
}

/// Snowflake REST response envelope.
#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    success: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponseData {
    token: String,
    master_token: String,
    #[serde(default)]
    session_info: Option<WireSessionInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSessionInfo {
    database_name: Option<String>,
    schema_name: Option<String>,
    warehouse_name: Option<String>,
    role_name: Option<String>,
}

/// HTTP client for Snowflake's session endpoints.
pub struct RestConnector {
    http_client: Client,
    base_url: String,
    client_app_id: String,
}

impl RestConnector {
    /// Builds a connector from the `[connection]` settings.
    ///
    /// The base URL may contain `{account}`, replaced by the account identifier.
    pub fn new(config: &ConnectionConfig) -> Result<Self> {
        let http_client = Client::builder()
            .user_agent(format!("{}/{}", config.client_app_id, env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(config.login_timeout_seconds))
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http_client,
            base_url: config.base_url.clone(),
            client_app_id: config.client_app_id.clone(),
        })
    }

    /// Accounts are limited to letters, digits, `.`, `_` and `-` so they can
    /// only ever fill the host label of the URL.
    fn endpoint_for(&self, account: &str) -> Result<String, ConnectionError> {
        let valid = !account.is_empty()
            && account
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !valid {
            return Err(ConnectionError::ConfigurationInvalid {
                message: format!("invalid account identifier {:?}", account),
            });
        }

        Ok(self
            .base_url
            .replace("{account}", account)
            .trim_end_matches('/')
            .to_string())
    }

    async fn post_authorized(
        &self,
        session: &SessionHandle,
        path: &str,
        body: &Value,
    ) -> Result<ApiResponse, ConnectionError> {
        let url = format!("{}{}", session.endpoint, path);
        let response = self
            .http_client
            .post(&url)
            .header("Accept", "application/snowflake")
            .header(
                "Authorization",
                format!("Snowflake Token=\"{}\"", session.token.expose_secret()),
            )
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;

        read_envelope(response).await
    }
}

#[async_trait]
impl SnowflakeConnector for RestConnector {
    async fn login(&self, credentials: &ResolvedCredentials) -> Result<SessionHandle, ConnectionError> {
        let endpoint = self.endpoint_for(credentials.identity.account())?;
        let url = format!("{}/session/v1/login-request", endpoint);

        let mut query = vec![("request_id", Uuid::new_v4().to_string())];
        let options = &credentials.options;
        if let Some(warehouse) = &options.warehouse {
            query.push(("warehouse", warehouse.clone()));
        }
        if let Some(database) = &options.database {
            query.push(("databaseName", database.clone()));
        }
        if let Some(schema) = &options.schema {
            query.push(("schemaName", schema.clone()));
        }
        if let Some(role) = &options.role {
            query.push(("roleName", role.clone()));
        }

        // Account locator without region/cloud suffix
        let account_name = credentials
            .identity
            .account()
            .split('.')
            .next()
            .unwrap_or_default()
            .to_uppercase();

        let body = json!({
            "data": {
                "CLIENT_APP_ID": self.client_app_id,
                "CLIENT_APP_VERSION": env!("CARGO_PKG_VERSION"),
                "ACCOUNT_NAME": account_name,
                "LOGIN_NAME": credentials.identity.user(),
                "PASSWORD": credentials.password.expose_secret(),
            }
        });

        debug!(url = %url, user = %credentials.identity.user(), "Sending login request");

        let response = self
            .http_client
            .post(&url)
            .query(&query)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(transport_error)
            .map_err(|e| e.scrubbed(&credentials.password))?;

        let envelope = read_envelope(response)
            .await
            .map_err(|e| e.scrubbed(&credentials.password))?;

        if !envelope.success {
            return Err(rejection(&envelope).scrubbed(&credentials.password));
        }

        let data: LoginResponseData = envelope
            .data
            .map(serde_json::from_value::<LoginResponseData>)
            .transpose()
            .ok()
            .flatten()
            .ok_or_else(|| ConnectionError::NetworkUnreachable {
                message: "Snowflake returned an incomplete login response".to_string(),
            })?;

        let info = data
            .session_info
            .map(|wire| SessionInfo {
                warehouse: wire.warehouse_name,
                database: wire.database_name,
                schema: wire.schema_name,
                role: wire.role_name,
            })
            .unwrap_or_default();

        Ok(SessionHandle {
            endpoint,
            token: SecretString::from(data.token),
            master_token: SecretString::from(data.master_token),
            info,
        })
    }

    async fn heartbeat(&self, session: &SessionHandle) -> Result<(), ConnectionError> {
        let path = format!("/queries/v1/query-request?requestId={}", Uuid::new_v4());
        let body = json!({
            "sqlText": "SELECT 1",
            "asyncExec": false,
            "sequenceId": 1,
            "querySubmissionTime": Utc::now().timestamp_millis(),
        });

        let envelope = self.post_authorized(session, &path, &body).await?;
        if envelope.success {
            Ok(())
        } else {
            Err(rejection(&envelope))
        }
    }

    async fn logout(&self, session: &SessionHandle) -> Result<(), ConnectionError> {
        let envelope = self
            .post_authorized(session, "/session?delete=true", &json!({}))
            .await?;
        if envelope.success {
            Ok(())
        } else {
            Err(rejection(&envelope))
        }
    }
}

/// Maps a transport failure (DNS, connect, TLS, timeout, broken body).
fn transport_error(e: reqwest::Error) -> ConnectionError {
    let message = if e.is_timeout() {
        "request to Snowflake timed out".to_string()
    } else {
        format!("request to Snowflake failed: {}", e.without_url())
    };
    ConnectionError::NetworkUnreachable { message }
}

async fn read_envelope(response: reqwest::Response) -> Result<ApiResponse, ConnectionError> {
    let status = response.status();

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ConnectionError::AuthenticationFailed {
            message: format!("Snowflake rejected the request (HTTP {})", status.as_u16()),
        });
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ConnectionError::NetworkUnreachable {
            message: format!("Snowflake is unavailable (HTTP {})", status.as_u16()),
        });
    }
    if !status.is_success() {
        return Err(ConnectionError::ConfigurationInvalid {
            message: format!(
                "Snowflake endpoint returned HTTP {}; check the account identifier",
                status.as_u16()
            ),
        });
    }

    response
        .json::<ApiResponse>()
        .await
        .map_err(|_| ConnectionError::NetworkUnreachable {
            message: "Snowflake returned a malformed response".to_string(),
        })
}

/// Classifies a `success: false` envelope by its Snowflake error code.
///
/// 3902xx codes and 390189 concern the requested database/schema/warehouse/role
/// rather than the login itself.
fn rejection(envelope: &ApiResponse) -> ConnectionError {
    let code = envelope.code.as_deref().unwrap_or("unknown");
    let message = format!(
        "{} (code {})",
        envelope
            .message
            .as_deref()
            .unwrap_or("Snowflake rejected the request"),
        code
    );

    if code.starts_with("3902") || code == "390189" {
        ConnectionError::ConfigurationInvalid { message }
    } else {
        ConnectionError::AuthenticationFailed { message }
    }
}
