//! Google accounts.

use async_trait::async_trait;
use url::Url;

use super::backend::{
    ClientCredentials, Endpoints, IdentityBackend, Introspection, json_string, read_json,
    split_scopes,
};
use super::error::IdpError;
use crate::config::ProviderConfig;
use crate::types::{ProviderType, UserInfo};

const AUTHORIZATION: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN: &str = "https://oauth2.googleapis.com/token";
const USERINFO: &str = "https://openidconnect.googleapis.com/v1/userinfo";
const TOKENINFO: &str = "https://oauth2.googleapis.com/tokeninfo";
const REVOKE: &str = "https://oauth2.googleapis.com/revoke";
const JWKS: &str = "https://www.googleapis.com/oauth2/v3/certs";
const ISSUER: &str = "https://accounts.google.com";

/// Google OpenID Connect.
///
/// Requests `access_type=offline` so a refresh token is issued, verifies
/// access tokens through the `tokeninfo` endpoint and revokes through
/// Google's RFC 7009 endpoint.
#[derive(Debug, Clone)]
pub struct GoogleBackend {
    endpoints: Endpoints,
    client_id: String,
    display_name: String,
}

impl GoogleBackend {
    /// Creates the backend from provider configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if an endpoint override is not a valid URL.
    pub fn new(config: &ProviderConfig) -> Result<Self, url::ParseError> {
        let endpoints = Endpoints {
            authorization: Url::parse(AUTHORIZATION)?,
            token: Url::parse(TOKEN)?,
            userinfo: Some(Url::parse(USERINFO)?),
            introspection: Some(Url::parse(TOKENINFO)?),
            revocation: Some(Url::parse(REVOKE)?),
            jwks_uri: Some(Url::parse(JWKS)?),
            issuer: Some(ISSUER.to_string()),
        }
        .with_overrides(config)?;

        Ok(Self {
            endpoints,
            client_id: config.client_id.clone(),
            display_name: config
                .display_name
                .clone()
                .unwrap_or_else(|| "Google".to_string()),
        })
    }
}

#[async_trait]
impl IdentityBackend for GoogleBackend {
    fn provider_type(&self) -> ProviderType {
        ProviderType::GOOGLE
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

    fn extra_authorize_params(&self) -> Vec<(&'static str, String)> {
        vec![
            ("access_type", "offline".to_string()),
            ("prompt", "consent".to_string()),
        ]
    }

    /// Uses `tokeninfo`; a token minted for another client is inactive.
    async fn introspect(
        &self,
        http: &reqwest::Client,
        _credentials: &ClientCredentials,
        token: &str,
    ) -> Result<Option<Introspection>, IdpError> {
        let Some(endpoint) = self.endpoints.introspection.as_ref() else {
            return Ok(None);
        };

        let response = http
            .get(endpoint.as_str())
            .query(&[("access_token", token)])
            .send()
            .await?;
        let info: serde_json::Value = read_json(response, "tokeninfo").await?;

        let audience = info
            .get("aud")
            .or_else(|| info.get("azp"))
            .and_then(json_string);
        if audience.as_deref() != Some(self.client_id.as_str()) {
            tracing::debug!("tokeninfo audience does not match this client");
            return Ok(Some(Introspection::inactive()));
        }

        let Some(sub) = info.get("sub").and_then(json_string) else {
            return Ok(Some(Introspection::inactive()));
        };

        Ok(Some(Introspection {
            active: true,
            user_info: Some(UserInfo {
                sub,
                email: info.get("email").and_then(json_string),
                name: None,
                provider: ProviderType::GOOGLE,
            }),
            scopes: split_scopes(info.get("scope").and_then(|v| v.as_str())),
            expires_in: info
                .get("expires_in")
                .and_then(json_string)
                .and_then(|s| s.parse().ok()),
        }))
    }
}
