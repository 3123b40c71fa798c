//! Authorization server metadata (RFC 8414).

use axum::{Json, extract::State, response::IntoResponse};
use serde::Serialize;

use super::AuthHttpState;
use crate::config::AuthConfig;

/// The `/.well-known/oauth-authorization-server` document.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub revocation_endpoint: String,
    pub response_types_supported: Vec<&'static str>,
    pub grant_types_supported: Vec<&'static str>,
    pub code_challenge_methods_supported: Vec<&'static str>,
    pub token_endpoint_auth_methods_supported: Vec<&'static str>,
    pub revocation_endpoint_auth_methods_supported: Vec<&'static str>,
    /// Provider types clients may pass as `provider` to the authorize
    /// endpoint.
    pub identity_providers: Vec<String>,
}

impl AuthorizationServerMetadata {
    #[must_use]
    pub fn build(config: &AuthConfig, providers: Vec<String>) -> Self {
        Self {
            issuer: config.base_url.trim_end_matches('/').to_string(),
            authorization_endpoint: config.route_url("/authorize"),
            token_endpoint: config.route_url("/token"),
            revocation_endpoint: config.route_url("/revoke"),
            response_types_supported: vec!["code"],
            grant_types_supported: vec!["authorization_code", "refresh_token"],
            code_challenge_methods_supported: vec!["S256"],
            token_endpoint_auth_methods_supported: vec!["none"],
            revocation_endpoint_auth_methods_supported: vec!["none"],
            identity_providers: providers,
        }
    }
}

/// `GET /.well-known/oauth-authorization-server`.
pub async fn authorization_server_metadata_handler(
    State(state): State<AuthHttpState>,
) -> impl IntoResponse {
    let providers = state
        .registry
        .provider_types()
        .into_iter()
        .map(|p| p.to_string())
        .collect();
    Json(AuthorizationServerMetadata::build(
        state.registry.config(),
        providers,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_urls() {
        let config = AuthConfig {
            base_url: "https://mcp.example.com/".into(),
            ..AuthConfig::default()
        };
        let metadata = AuthorizationServerMetadata::build(&config, vec!["github".into()]);
        assert_eq!(metadata.issuer, "https://mcp.example.com");
        assert_eq!(metadata.token_endpoint, "https://mcp.example.com/auth/token");
        assert_eq!(metadata.code_challenge_methods_supported, vec!["S256"]);
    }
}
