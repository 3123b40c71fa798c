use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use mcpgate_auth::{AuthInfo, BearerRejection, SessionAuthInfo, authenticate_bearer};
use serde::Serialize;
use serde_json::Value;

use crate::server::AppState;
use crate::session::protocol::{INTERNAL_ERROR, INVALID_REQUEST, JSONRPC_VERSION, PARSE_ERROR};
use crate::session::{JsonRpcRequest, JsonRpcResponse, LiveInstance, SessionError};

/// Header carrying the protocol session id in both directions.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// JSON-RPC error code for an unknown or expired session.
pub const SESSION_NOT_FOUND: i32 = -32001;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    providers: usize,
    cached_sessions: usize,
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// Ready when the shared session store answers.
pub async fn readyz(State(state): State<AppState>) -> Response {
    match state.registry.stores().session_metadata.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                providers: state.registry.len(),
                cached_sessions: state.sessions.get_stats().cached_instances,
            }),
        )
            .into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "session store health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unavailable",
                }),
            )
                .into_response()
        }
    }
}

fn rpc_error(status: StatusCode, id: Value, code: i32, message: impl Into<String>) -> Response {
    (status, Json(JsonRpcResponse::error(id, code, message))).into_response()
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        match &self {
            SessionError::NotFound { .. } | SessionError::Expired { .. } => {
                tracing::debug!(error = %self, "rejected request for unknown session");
                rpc_error(
                    StatusCode::NOT_FOUND,
                    Value::Null,
                    SESSION_NOT_FOUND,
                    "Session not found",
                )
            }
            SessionError::Storage(e) => {
                tracing::error!(error = %e, "session store unavailable");
                rpc_error(
                    StatusCode::SERVICE_UNAVAILABLE,
                    Value::Null,
                    INTERNAL_ERROR,
                    "Session store unavailable",
                )
            }
            SessionError::Transport(message) => {
                tracing::error!(error = %message, "failed to build session transport");
                rpc_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Value::Null,
                    INTERNAL_ERROR,
                    "Internal error",
                )
            }
        }
    }
}

fn session_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// Resolves the caller when bearer enforcement is on.
async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<Option<AuthInfo>, Response> {
    if !state.config.auth.enabled {
        return Ok(None);
    }
    authenticate_bearer(&state.registry, headers)
        .await
        .map(Some)
        .map_err(IntoResponse::into_response)
}

fn check_origin(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if state.sessions.config().transport.permits(host, origin) {
        Ok(())
    } else {
        tracing::warn!(host = ?host, origin = ?origin, "request rejected by DNS rebinding protection");
        Err(rpc_error(
            StatusCode::FORBIDDEN,
            Value::Null,
            INVALID_REQUEST,
            "Forbidden: host or origin not allowed",
        ))
    }
}

/// A session created by one user must not be driven by another.
fn check_owner(instance: &LiveInstance, caller: Option<&AuthInfo>) -> Result<(), Response> {
    let (Some(owner), Some(caller)) = (instance.transport().auth_info(), caller) else {
        return Ok(());
    };
    if owner.provider == caller.provider && owner.user_id == caller.user_info.sub {
        return Ok(());
    }
    tracing::warn!(
        session_id = %instance.session_id(),
        owner.provider = %owner.provider,
        caller.provider = %caller.provider,
        "session used by a different principal"
    );
    Err(BearerRejection {
        status: StatusCode::FORBIDDEN,
        message: "Session belongs to a different user".to_string(),
    }
    .into_response())
}

/// `POST /mcp`: one JSON-RPC message, routed to the session's instance.
///
/// Without an `mcp-session-id` header only `initialize` is accepted; it
/// creates the session. With the header the instance is taken from the
/// local cache or rebuilt from shared metadata.
pub async fn mcp_post(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(rejection) = check_origin(&state, &headers) {
        return rejection;
    }
    let caller = match authorize(&state, &headers).await {
        Ok(caller) => caller,
        Err(rejection) => return rejection,
    };

    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return rpc_error(
                StatusCode::BAD_REQUEST,
                Value::Null,
                PARSE_ERROR,
                format!("Parse error: {e}"),
            );
        }
    };
    let id = request.id.clone().unwrap_or(Value::Null);
    if request.jsonrpc != JSONRPC_VERSION {
        return rpc_error(
            StatusCode::BAD_REQUEST,
            id,
            INVALID_REQUEST,
            "Invalid Request: jsonrpc must be \"2.0\"",
        );
    }

    let instance = match session_id(&headers) {
        Some(session_id) => match state.sessions.get_or_recreate_instance(session_id, None).await {
            Ok(instance) => instance,
            Err(e) => return e.into_response(),
        },
        None if request.method == "initialize" => {
            let auth_info = caller.as_ref().map(SessionAuthInfo::from);
            match state.sessions.create_instance(auth_info, None).await {
                Ok(instance) => instance,
                Err(e) => return e.into_response(),
            }
        }
        None => {
            return rpc_error(
                StatusCode::BAD_REQUEST,
                id,
                INVALID_REQUEST,
                "Bad Request: No valid session ID provided",
            );
        }
    };

    if let Err(rejection) = check_owner(&instance, caller.as_ref()) {
        return rejection;
    }

    let reply = instance
        .server()
        .handle(instance.transport(), request)
        .await;
    let mut response = match reply {
        Some(reply) => (StatusCode::OK, Json(reply)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    };
    if let Ok(value) = HeaderValue::from_str(instance.session_id()) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

/// `DELETE /mcp`: ends the session on every instance.
pub async fn mcp_delete(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(rejection) = check_origin(&state, &headers) {
        return rejection;
    }
    let caller = match authorize(&state, &headers).await {
        Ok(caller) => caller,
        Err(rejection) => return rejection,
    };
    let Some(session_id) = session_id(&headers) else {
        return rpc_error(
            StatusCode::BAD_REQUEST,
            Value::Null,
            INVALID_REQUEST,
            "Bad Request: No valid session ID provided",
        );
    };

    let instance = match state.sessions.get_or_recreate_instance(session_id, None).await {
        Ok(instance) => instance,
        Err(e) => return e.into_response(),
    };
    if let Err(rejection) = check_owner(&instance, caller.as_ref()) {
        return rejection;
    }

    match state.sessions.close_session(session_id).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}
