//! GitHub OAuth apps.

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use super::backend::{Endpoints, IdentityBackend, json_string, read_json};
use super::error::IdpError;
use crate::config::ProviderConfig;
use crate::types::{ProviderType, UserInfo};

const AUTHORIZATION: &str = "https://github.com/login/oauth/authorize";
const TOKEN: &str = "https://github.com/login/oauth/access_token";
const USER: &str = "https://api.github.com/user";

/// GitHub OAuth.
///
/// GitHub issues no ID token and, for classic OAuth apps, no refresh
/// token. A refresh request for a known token is therefore a no-op that
/// returns the current record. Access tokens are verified through
/// `GET /user`; the primary verified address from `GET /user/emails` fills
/// in a private email.
#[derive(Debug, Clone)]
pub struct GitHubBackend {
    endpoints: Endpoints,
    emails: Url,
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct GitHubEmail {
    email: String,
    #[serde(default)]
    primary: bool,
    #[serde(default)]
    verified: bool,
}

impl GitHubBackend {
    /// Creates the backend from provider configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if an endpoint override is not a valid URL.
    pub fn new(config: &ProviderConfig) -> Result<Self, url::ParseError> {
        let endpoints = Endpoints {
            authorization: Url::parse(AUTHORIZATION)?,
            token: Url::parse(TOKEN)?,
            userinfo: Some(Url::parse(USER)?),
            introspection: None,
            revocation: None,
            jwks_uri: None,
            issuer: None,
        }
        .with_overrides(config)?;

        let user = endpoints
            .userinfo
            .clone()
            .map_or_else(|| Url::parse(USER), Ok)?;
        let emails = Url::parse(&format!("{}/emails", user.as_str().trim_end_matches('/')))?;

        Ok(Self {
            endpoints,
            emails,
            display_name: config
                .display_name
                .clone()
                .unwrap_or_else(|| "GitHub".to_string()),
        })
    }

    async fn primary_email(
        &self,
        http: &reqwest::Client,
        access_token: &str,
    ) -> Result<Option<String>, IdpError> {
        let response = http
            .get(self.emails.as_str())
            .bearer_auth(access_token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;
        let emails: Vec<GitHubEmail> = read_json(response, "user/emails").await?;
        Ok(emails
            .into_iter()
            .find(|e| e.primary && e.verified)
            .map(|e| e.email))
    }
}

#[async_trait]
impl IdentityBackend for GitHubBackend {
    fn provider_type(&self) -> ProviderType {
        ProviderType::GITHUB
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    fn default_scopes(&self) -> Vec<String> {
        vec!["read:user".into(), "user:email".into()]
    }

    fn supports_refresh(&self) -> bool {
        false
    }

    fn map_user_info(&self, value: &serde_json::Value) -> Result<UserInfo, IdpError> {
        let sub = value
            .get("id")
            .and_then(json_string)
            .ok_or_else(|| IdpError::invalid_response("user", "missing 'id'"))?;
        Ok(UserInfo {
            sub,
            email: value.get("email").and_then(json_string),
            name: value
                .get("name")
                .and_then(json_string)
                .or_else(|| value.get("login").and_then(json_string)),
            provider: ProviderType::GITHUB,
        })
    }

    async fn fetch_user_info(
        &self,
        http: &reqwest::Client,
        access_token: &str,
    ) -> Result<UserInfo, IdpError> {
        let endpoint = self
            .endpoints
            .userinfo
            .as_ref()
            .ok_or(IdpError::Unsupported("userinfo"))?;
        let response = http
            .get(endpoint.as_str())
            .bearer_auth(access_token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;
        let value: serde_json::Value = read_json(response, "user").await?;
        let mut user = self.map_user_info(&value)?;

        if user.email.is_none() {
            match self.primary_email(http, access_token).await {
                Ok(email) => user.email = email,
                Err(e) => tracing::debug!(error = %e, "could not read GitHub emails"),
            }
        }
        Ok(user)
    }
}
