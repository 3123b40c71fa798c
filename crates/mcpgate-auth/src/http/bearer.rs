//! Bearer token authentication for protocol requests.
//!
//! Protocol endpoints speak JSON-RPC, so a rejected token is answered with
//! a JSON-RPC error rather than an OAuth error object:
//!
//! ```json
//! {"jsonrpc": "2.0", "error": {"code": -32000, "message": "..."}, "id": null}
//! ```

use axum::{
    Json,
    extract::{FromRef, FromRequestParts},
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use serde_json::json;

use super::AuthHttpState;
use crate::registry::ProviderRegistry;
use crate::types::AuthInfo;

/// JSON-RPC error code for authentication failures.
pub const JSONRPC_AUTH_ERROR: i32 = -32000;

/// Extracts the token from an `Authorization: Bearer` header.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Rejection of a protocol request.
#[derive(Debug, Clone)]
pub struct BearerRejection {
    pub status: StatusCode,
    pub message: String,
}

impl BearerRejection {
    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }
}

impl IntoResponse for BearerRejection {
    fn into_response(self) -> Response {
        let body = json!({
            "jsonrpc": "2.0",
            "error": {"code": JSONRPC_AUTH_ERROR, "message": self.message},
            "id": null,
        });
        let mut response = (self.status, Json(body)).into_response();
        if self.status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer error=\"invalid_token\""),
            );
        }
        response
    }
}

/// Verifies the request's bearer token through the registry.
///
/// # Errors
///
/// Returns a 401 rejection for a missing or invalid token and a 503
/// rejection when verification could not be completed.
pub async fn authenticate_bearer(
    registry: &ProviderRegistry,
    headers: &HeaderMap,
) -> Result<AuthInfo, BearerRejection> {
    let token = bearer_token(headers)
        .ok_or_else(|| BearerRejection::unauthorized("Missing or invalid Authorization header"))?;

    registry.verify_access_token(token).await.map_err(|e| {
        if e.is_server_error() {
            tracing::error!(error = %e, "bearer verification failed");
            BearerRejection {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: "Authentication is temporarily unavailable".to_string(),
            }
        } else {
            tracing::debug!(error = %e, "bearer token rejected");
            BearerRejection::unauthorized("Invalid or expired token")
        }
    })
}

/// Axum extractor yielding the verified [`AuthInfo`].
#[derive(Debug, Clone)]
pub struct BearerAuth(pub AuthInfo);

impl<S> FromRequestParts<S> for BearerAuth
where
    S: Send + Sync,
    AuthHttpState: FromRef<S>,
{
    type Rejection = BearerRejection;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = AuthHttpState::from_ref(state);
        let info = authenticate_bearer(&state.registry, &parts.headers).await?;
        Ok(Self(info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, "Bearer abc.def".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def"));

        headers.insert(header::AUTHORIZATION, "bearer xyz".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("xyz"));

        headers.insert(header::AUTHORIZATION, "Basic Zm9vOmJhcg==".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, "Bearer ".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }

    #[tokio::test]
    async fn test_rejection_is_jsonrpc() {
        let response = BearerRejection::unauthorized("Invalid or expired token").into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["jsonrpc"], "2.0");
        assert_eq!(body["error"]["code"], -32000);
        assert!(body["id"].is_null());
    }
}
