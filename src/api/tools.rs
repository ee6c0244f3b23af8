//! Tool, resource and session endpoints.
//!
//! Every tool is a `POST /tools/<name>` taking its arguments as a JSON object.
//! Failures come back as `{error, message, retryable, available?}` with a
//! status code chosen by error kind.

use crate::credentials::Identity;
use crate::session::SessionStatus;
use crate::tools::{
    AuthStatus, AuthTools, AuthenticateArgs, AuthenticateOutcome, DeleteArgs, DeleteOutcome,
    IdentityArgs, SavedCredentials, ToolError,
};
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared application state for the tools API
#[derive(Clone)]
pub struct ToolsAppState {
    pub tools: Arc<AuthTools>,
}

/// Response for GET /tools
#[derive(Serialize)]
pub struct ListToolsResponse {
    pub tools: Vec<&'static str>,
}

/// Response for POST /session/test
#[derive(Serialize)]
pub struct TestConnectionResponse {
    pub ok: bool,
}

/// Query for GET /resources/auth/status
#[derive(Deserialize, Default)]
pub struct StatusQuery {
    pub format: Option<String>,
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    available: Option<Vec<Identity>>,
}

/// Create tools API router
pub fn create_tools_router(state: ToolsAppState) -> Router {
    Router::new()
        .route("/tools", get(list_tools))
        .route("/tools/authenticate_snowflake", post(authenticate_snowflake))
        .route("/tools/use_saved_credentials", post(use_saved_credentials))
        .route("/tools/list_saved_credentials", post(list_saved_credentials))
        .route("/tools/delete_saved_credentials", post(delete_saved_credentials))
        .route("/resources/auth/status", get(auth_status))
        .route("/session/ensure", post(ensure_connected))
        .route("/session/test", post(test_connection))
        .route("/session/close", post(close_session))
        .with_state(Arc::new(state))
}

/// GET /tools - Names of the enabled tools
async fn list_tools(State(state): State<Arc<ToolsAppState>>) -> Json<ListToolsResponse> {
    Json(ListToolsResponse {
        tools: state.tools.enabled_tools(),
    })
}

/// POST /tools/authenticate_snowflake
async fn authenticate_snowflake(
    State(state): State<Arc<ToolsAppState>>,
    body: Result<Json<AuthenticateArgs>, JsonRejection>,
) -> Result<Json<AuthenticateOutcome>, AppError> {
    let args = arguments(body)?;
    debug!(account = %args.account, user = %args.user, "authenticate_snowflake called");

    Ok(Json(state.tools.authenticate_snowflake(args).await?))
}

/// POST /tools/use_saved_credentials
async fn use_saved_credentials(
    State(state): State<Arc<ToolsAppState>>,
    body: Result<Json<IdentityArgs>, JsonRejection>,
) -> Result<Json<SessionStatus>, AppError> {
    let args = arguments(body)?;
    debug!(account = %args.account, user = %args.user, "use_saved_credentials called");

    Ok(Json(state.tools.use_saved_credentials(args).await?))
}

/// POST /tools/list_saved_credentials - Takes no arguments
async fn list_saved_credentials(
    State(state): State<Arc<ToolsAppState>>,
) -> Result<Json<SavedCredentials>, AppError> {
    Ok(Json(state.tools.list_saved_credentials().await?))
}

/// POST /tools/delete_saved_credentials
///
/// `{}` deletes every saved identity, so a body is required.
async fn delete_saved_credentials(
    State(state): State<Arc<ToolsAppState>>,
    body: Result<Json<DeleteArgs>, JsonRejection>,
) -> Result<Json<DeleteOutcome>, AppError> {
    let args = arguments(body)?;
    Ok(Json(state.tools.delete_saved_credentials(args).await?))
}

/// GET /resources/auth/status - JSON by default, `?format=text` for text
async fn auth_status(
    State(state): State<Arc<ToolsAppState>>,
    Query(query): Query<StatusQuery>,
) -> Response {
    let status: AuthStatus = state.tools.auth_status().await;

    match query.format.as_deref() {
        Some("text") => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            status.render_text(),
        )
            .into_response(),
        _ => Json(status).into_response(),
    }
}

/// POST /session/ensure - Live session, connecting from static sources if needed
async fn ensure_connected(
    State(state): State<Arc<ToolsAppState>>,
) -> Result<Json<SessionStatus>, AppError> {
    Ok(Json(state.tools.ensure_connected().await?))
}

/// POST /session/test - Runs a trivial query on the live session
async fn test_connection(State(state): State<Arc<ToolsAppState>>) -> Json<TestConnectionResponse> {
    Json(TestConnectionResponse {
        ok: state.tools.sessions().test().await,
    })
}

/// POST /session/close
async fn close_session(State(state): State<Arc<ToolsAppState>>) -> Json<SessionStatus> {
    let sessions = state.tools.sessions();
    sessions.close().await;
    Json(sessions.status().await)
}

/// Unwraps a JSON body. Rejection details are not echoed since serde messages
/// can quote the offending value.
fn arguments<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    body.map(|Json(args)| args).map_err(|rejection| {
        let message = match rejection {
            JsonRejection::MissingJsonContentType(_) => "expected Content-Type: application/json",
            JsonRejection::JsonSyntaxError(_) => "request body is not valid JSON",
            JsonRejection::JsonDataError(_) => "request body does not match the tool's arguments",
            _ => "request body could not be read",
        };
        AppError::InvalidBody(message.to_string())
    })
}

/// Application error types
enum AppError {
    Tool(ToolError),
    InvalidBody(String),
}

impl From<ToolError> for AppError {
    fn from(e: ToolError) -> Self {
        AppError::Tool(e)
    }
}

fn status_for(error: &ToolError) -> StatusCode {
    use crate::session::ConnectionError;

    match error {
        ToolError::InvalidArguments(_) => StatusCode::BAD_REQUEST,
        ToolError::CredentialsNotFound { .. } => StatusCode::NOT_FOUND,
        ToolError::NotAuthenticated { .. } => StatusCode::CONFLICT,
        ToolError::ToolExcluded(_) => StatusCode::FORBIDDEN,
        ToolError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        ToolError::Connection(ConnectionError::AuthenticationFailed { .. }) => {
            StatusCode::UNAUTHORIZED
        }
        ToolError::Connection(ConnectionError::ConfigurationInvalid { .. }) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ToolError::Connection(ConnectionError::NetworkUnreachable { .. }) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::Tool(e) => {
                let status = status_for(&e);
                if status.is_server_error() {
                    warn!(kind = e.kind(), error = %e, "Tool call failed");
                } else {
                    debug!(kind = e.kind(), error = %e, "Tool call rejected");
                }
                (
                    status,
                    ErrorResponse {
                        error: e.kind(),
                        message: e.to_string(),
                        retryable: e.is_retryable(),
                        available: e.available().map(<[Identity]>::to_vec),
                    },
                )
            }
            AppError::InvalidBody(message) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse {
                    error: "invalid_arguments",
                    message,
                    retryable: false,
                    available: None,
                },
            ),
        };

        (status, Json(body)).into_response()
    }
}
