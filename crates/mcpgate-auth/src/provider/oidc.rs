//! Generic OpenID Connect issuer.
//!
//! Endpoints come from configuration, or from the issuer's
//! `/.well-known/openid-configuration` document for those not configured.
//! Access tokens are verified with RFC 7662 introspection when the issuer
//! advertises it, otherwise through the user-info endpoint.

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use super::backend::{Endpoints, IdentityBackend};
use super::error::IdpError;
use crate::config::ProviderConfig;
use crate::types::ProviderType;

/// Subset of the OIDC discovery document this server uses.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    #[serde(default)]
    pub jwks_uri: Option<String>,
    #[serde(default)]
    pub introspection_endpoint: Option<String>,
    #[serde(default)]
    pub revocation_endpoint: Option<String>,
}

/// A standards-compliant OIDC issuer.
#[derive(Debug, Clone)]
pub struct OidcBackend {
    provider_type: ProviderType,
    endpoints: Endpoints,
    display_name: String,
}

impl OidcBackend {
    /// Builds the backend from configured endpoints only.
    ///
    /// # Errors
    ///
    /// Returns an error if the authorization or token endpoint is missing
    /// or any endpoint is not a valid URL.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, IdpError> {
        let authorization = config
            .authorization_endpoint
            .as_deref()
            .ok_or(IdpError::Unsupported("authorization_endpoint not configured"))?;
        let token = config
            .token_endpoint
            .as_deref()
            .ok_or(IdpError::Unsupported("token_endpoint not configured"))?;

        let endpoints = Endpoints {
            authorization: Url::parse(authorization)?,
            token: Url::parse(token)?,
            userinfo: None,
            introspection: None,
            revocation: None,
            jwks_uri: None,
            issuer: None,
        }
        .with_overrides(config)?;

        Ok(Self::with_endpoints(config, endpoints))
    }

    /// Builds the backend, discovering endpoints that are not configured.
    ///
    /// Discovery is skipped when both the authorization and token endpoints
    /// are configured.
    ///
    /// # Errors
    ///
    /// Returns an error if discovery fails, the document's issuer does not
    /// match the configured one, or an endpoint is invalid.
    pub async fn discover(
        config: &ProviderConfig,
        http: &reqwest::Client,
        allow_http: bool,
    ) -> Result<Self, IdpError> {
        if config.authorization_endpoint.is_some() && config.token_endpoint.is_some() {
            return Self::from_config(config);
        }

        let issuer = config
            .issuer
            .as_deref()
            .ok_or(IdpError::Unsupported("issuer not configured"))?;
        let issuer_url = Url::parse(issuer)?;
        if issuer_url.scheme() != "https" && !(allow_http && issuer_url.scheme() == "http") {
            return Err(IdpError::invalid_response(
                "discovery",
                format!("issuer scheme '{}' is not allowed", issuer_url.scheme()),
            ));
        }

        let url = discovery_url(&issuer_url);
        tracing::debug!(issuer, "fetching OIDC discovery document");
        let response = http
            .get(url.as_str())
            .header("Accept", "application/json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(IdpError::UnexpectedStatus {
                endpoint: "discovery",
                status: response.status().as_u16(),
            });
        }
        let document: DiscoveryDocument = response
            .json()
            .await
            .map_err(|e| IdpError::invalid_response("discovery", e.to_string()))?;

        if document.issuer.trim_end_matches('/') != issuer.trim_end_matches('/') {
            return Err(IdpError::invalid_response(
                "discovery",
                format!("issuer mismatch: expected {issuer}, got {}", document.issuer),
            ));
        }

        let endpoints = Endpoints {
            authorization: Url::parse(&document.authorization_endpoint)?,
            token: Url::parse(&document.token_endpoint)?,
            userinfo: document.userinfo_endpoint.as_deref().map(Url::parse).transpose()?,
            introspection: document
                .introspection_endpoint
                .as_deref()
                .map(Url::parse)
                .transpose()?,
            revocation: document
                .revocation_endpoint
                .as_deref()
                .map(Url::parse)
                .transpose()?,
            jwks_uri: document.jwks_uri.as_deref().map(Url::parse).transpose()?,
            issuer: Some(document.issuer.trim_end_matches('/').to_string()),
        }
        .with_overrides(config)?;

        Ok(Self::with_endpoints(config, endpoints))
    }

    fn with_endpoints(config: &ProviderConfig, endpoints: Endpoints) -> Self {
        Self {
            provider_type: config.provider_type.clone(),
            endpoints,
            display_name: config
                .display_name
                .clone()
                .unwrap_or_else(|| "Single Sign-On".to_string()),
        }
    }
}

fn discovery_url(issuer: &Url) -> Url {
    let mut url = issuer.clone();
    let path = issuer.path().trim_end_matches('/');
    url.set_path(&format!("{path}/.well-known/openid-configuration"));
    url
}

#[async_trait]
impl IdentityBackend for OidcBackend {
    fn provider_type(&self) -> ProviderType {
        self.provider_type.clone()
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    fn default_scopes(&self) -> Vec<String> {
        vec!["openid".into(), "email".into(), "profile".into()]
    }
}
