//! OAuth error responses.
//!
//! `AuthError` renders as an RFC 6749 error object:
//!
//! ```json
//! {"error": "invalid_grant", "error_description": "unknown refresh token"}
//! ```
//!
//! Infrastructure failures are logged here and answered with a fixed
//! description, so nothing from a store or an identity provider reaches the
//! client.

use axum::{
    Json,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::error::AuthError;

/// Body of an OAuth error response.
#[derive(Debug, Clone, Serialize)]
pub struct OAuthErrorBody {
    pub error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        let error = self.oauth_error_code();

        let description = if self.is_server_error() {
            tracing::error!(category = %self.category(), error = %self, "auth request failed");
            "The server could not complete the request".to_string()
        } else {
            tracing::debug!(category = %self.category(), error = %self, "auth request rejected");
            client_description(&self)
        };

        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        if status == StatusCode::UNAUTHORIZED
            && let Ok(value) = HeaderValue::from_str(&www_authenticate(error, &description))
        {
            headers.insert(header::WWW_AUTHENTICATE, value);
        }

        let body = OAuthErrorBody {
            error,
            error_description: Some(description),
        };
        (status, headers, Json(body)).into_response()
    }
}

/// HTTP status for an error variant.
#[must_use]
pub fn status_for(error: &AuthError) -> StatusCode {
    match error {
        AuthError::InvalidRequest { .. }
        | AuthError::InvalidGrant { .. }
        | AuthError::InvalidState { .. }
        | AuthError::UnsupportedGrantType { .. }
        | AuthError::AccessDenied { .. }
        | AuthError::PkceVerificationFailed => StatusCode::BAD_REQUEST,
        AuthError::InvalidToken { .. } | AuthError::Unauthorized { .. } => {
            StatusCode::UNAUTHORIZED
        }
        AuthError::ProviderNotFound { .. } => StatusCode::NOT_FOUND,
        AuthError::Storage { .. } => StatusCode::SERVICE_UNAVAILABLE,
        AuthError::IdentityProvider { .. }
        | AuthError::Configuration { .. }
        | AuthError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn client_description(error: &AuthError) -> String {
    match error {
        AuthError::InvalidRequest { message }
        | AuthError::InvalidGrant { message }
        | AuthError::InvalidState { message }
        | AuthError::InvalidToken { message }
        | AuthError::Unauthorized { message }
        | AuthError::AccessDenied { message } => message.clone(),
        AuthError::UnsupportedGrantType { grant_type } => {
            format!("grant_type '{grant_type}' is not supported")
        }
        AuthError::PkceVerificationFailed => "PKCE verification failed".to_string(),
        AuthError::ProviderNotFound { provider } => {
            format!("identity provider '{provider}' is not available")
        }
        other => other.to_string(),
    }
}

fn www_authenticate(error: &str, description: &str) -> String {
    let escaped = description.replace('\\', "\\\\").replace('"', "\\\"");
    format!("Bearer error=\"{error}\", error_description=\"{escaped}\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_invalid_state_response() {
        let response =
            AuthError::invalid_state("oauth_state_error: unknown or expired state").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(response).await;
        assert_eq!(body["error"], "invalid_state");
        assert!(
            body["error_description"]
                .as_str()
                .unwrap()
                .contains("oauth_state_error")
        );
    }

    #[tokio::test]
    async fn test_invalid_token_sets_www_authenticate() {
        let response = AuthError::invalid_token("Invalid or expired token").into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(challenge.starts_with("Bearer error=\"invalid_token\""));
    }

    #[tokio::test]
    async fn test_server_errors_hide_details() {
        let response =
            AuthError::identity_provider("google", "upstream said: secret body").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = body_json(response).await;
        assert_eq!(body["error"], "server_error");
        assert!(!body.to_string().contains("secret body"));
        assert!(!body.to_string().contains("google"));

        let response = AuthError::storage("redis down").into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&AuthError::PkceVerificationFailed), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&AuthError::provider_not_found("okta")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&AuthError::access_denied("denied")),
            StatusCode::BAD_REQUEST
        );
    }
}
