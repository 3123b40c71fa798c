//! The seam between the shared federated flow and one concrete IdP.
//!
//! [`FederatedProvider`](super::FederatedProvider) implements the
//! authorization-code + PKCE flow once. Everything that differs between
//! identity providers (endpoints, user-info shape, introspection, refresh
//! support) lives behind [`IdentityBackend`].

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use super::error::IdpError;
use crate::config::ProviderConfig;
use crate::types::{ProviderType, UserInfo};

/// Endpoints of one identity provider.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub authorization: Url,
    pub token: Url,
    pub userinfo: Option<Url>,
    /// RFC 7662 introspection, or a provider-specific equivalent.
    pub introspection: Option<Url>,
    /// RFC 7009 revocation.
    pub revocation: Option<Url>,
    pub jwks_uri: Option<Url>,
    /// Expected `iss` of ID tokens; `None` disables the issuer check.
    pub issuer: Option<String>,
}

impl Endpoints {
    /// Applies endpoint overrides from `config` on top of built-in defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if an override is not a valid URL.
    pub fn with_overrides(mut self, config: &ProviderConfig) -> Result<Self, url::ParseError> {
        if let Some(url) = &config.authorization_endpoint {
            self.authorization = Url::parse(url)?;
        }
        if let Some(url) = &config.token_endpoint {
            self.token = Url::parse(url)?;
        }
        if let Some(url) = &config.userinfo_endpoint {
            self.userinfo = Some(Url::parse(url)?);
        }
        if let Some(url) = &config.introspection_endpoint {
            self.introspection = Some(Url::parse(url)?);
        }
        if let Some(url) = &config.revocation_endpoint {
            self.revocation = Some(Url::parse(url)?);
        }
        if let Some(url) = &config.jwks_uri {
            self.jwks_uri = Some(Url::parse(url)?);
        }
        if let Some(issuer) = &config.issuer {
            self.issuer = Some(issuer.trim_end_matches('/').to_string());
        }
        Ok(self)
    }
}

/// Client credentials sent to the IdP.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Option<String>,
}

/// Result of a remote token introspection.
#[derive(Debug, Clone)]
pub struct Introspection {
    pub active: bool,
    pub user_info: Option<UserInfo>,
    pub scopes: Vec<String>,
    /// Seconds until expiry, when reported.
    pub expires_in: Option<u64>,
}

impl Introspection {
    #[must_use]
    pub fn inactive() -> Self {
        Self {
            active: false,
            user_info: None,
            scopes: Vec::new(),
            expires_in: None,
        }
    }
}

/// Provider-specific behavior plugged into the shared flow.
#[async_trait]
pub trait IdentityBackend: Send + Sync + 'static {
    /// Provider type (store namespace).
    fn provider_type(&self) -> ProviderType;

    /// Name shown on the login page.
    fn display_name(&self) -> &str;

    fn endpoints(&self) -> &Endpoints;

    /// Scopes requested when neither configuration nor client names any.
    fn default_scopes(&self) -> Vec<String>;

    /// Extra query parameters for the authorization URL.
    fn extra_authorize_params(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    /// Whether the IdP implements the refresh-token grant.
    fn supports_refresh(&self) -> bool {
        true
    }

    /// Maps a user-info document to [`UserInfo`]. Defaults to OIDC claims.
    ///
    /// # Errors
    ///
    /// Returns an error if the document has no subject.
    fn map_user_info(&self, value: &serde_json::Value) -> Result<UserInfo, IdpError> {
        let sub = value
            .get("sub")
            .and_then(json_string)
            .ok_or_else(|| IdpError::invalid_response("userinfo", "missing 'sub'"))?;
        Ok(UserInfo {
            sub,
            email: value.get("email").and_then(json_string),
            name: value.get("name").and_then(json_string),
            provider: self.provider_type(),
        })
    }

    /// Fetches the user-info document for an access token.
    ///
    /// # Errors
    ///
    /// Returns an error if the IdP has no user-info endpoint, rejects the
    /// token, or answers with an unusable document.
    async fn fetch_user_info(
        &self,
        http: &reqwest::Client,
        access_token: &str,
    ) -> Result<UserInfo, IdpError> {
        let endpoint = self
            .endpoints()
            .userinfo
            .as_ref()
            .ok_or(IdpError::Unsupported("userinfo"))?;
        let response = http
            .get(endpoint.as_str())
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .send()
            .await?;
        let value: serde_json::Value = read_json(response, "userinfo").await?;
        self.map_user_info(&value)
    }

    /// Introspects an access token. `Ok(None)` means the IdP offers no
    /// introspection; the caller then falls back to user info.
    ///
    /// The default implementation speaks RFC 7662 when an introspection
    /// endpoint is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the introspection call fails.
    async fn introspect(
        &self,
        http: &reqwest::Client,
        credentials: &ClientCredentials,
        token: &str,
    ) -> Result<Option<Introspection>, IdpError> {
        let Some(endpoint) = self.endpoints().introspection.as_ref() else {
            return Ok(None);
        };

        let response = http
            .post(endpoint.as_str())
            .basic_auth(&credentials.client_id, credentials.client_secret.as_deref())
            .header("Accept", "application/json")
            .form(&[("token", token), ("token_type_hint", "access_token")])
            .send()
            .await?;
        let body: IntrospectionResponse = read_json(response, "introspection").await?;

        if !body.active {
            return Ok(Some(Introspection::inactive()));
        }

        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        Ok(Some(Introspection {
            active: true,
            user_info: body.sub.map(|sub| UserInfo {
                sub,
                email: body.email,
                name: body.username,
                provider: self.provider_type(),
            }),
            scopes: split_scopes(body.scope.as_deref()),
            expires_in: body.exp.map(|exp| (exp - now).max(0) as u64),
        }))
    }
}

#[derive(Debug, Deserialize)]
struct IntrospectionResponse {
    active: bool,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    exp: Option<i64>,
}

/// Accepts string or numeric JSON ids (GitHub user ids are numbers).
pub(crate) fn json_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn split_scopes(scope: Option<&str>) -> Vec<String> {
    scope
        .map(|s| {
            s.split([' ', ','])
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct OAuthErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Reads a JSON body, turning error statuses and OAuth error objects into
/// [`IdpError`]. Upstream bodies are logged at debug level only.
pub(crate) async fn read_json<T: DeserializeOwned>(
    response: reqwest::Response,
    endpoint: &'static str,
) -> Result<T, IdpError> {
    let status = response.status();
    let body = response.text().await?;

    if let Ok(err) = serde_json::from_str::<OAuthErrorResponse>(&body) {
        tracing::debug!(endpoint, status = status.as_u16(), error = %err.error, "IdP returned OAuth error");
        return Err(IdpError::oauth_error(
            err.error,
            err.error_description.unwrap_or_default(),
        ));
    }

    if !status.is_success() {
        tracing::debug!(endpoint, status = status.as_u16(), "IdP returned error status");
        return Err(IdpError::UnexpectedStatus {
            endpoint,
            status: status.as_u16(),
        });
    }

    serde_json::from_str(&body).map_err(|e| IdpError::invalid_response(endpoint, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_string_accepts_numbers() {
        assert_eq!(json_string(&json!(12345)), Some("12345".to_string()));
        assert_eq!(json_string(&json!("abc")), Some("abc".to_string()));
        assert_eq!(json_string(&json!("")), None);
        assert_eq!(json_string(&json!(null)), None);
    }

    #[test]
    fn test_split_scopes() {
        assert_eq!(split_scopes(Some("openid email")), vec!["openid", "email"]);
        assert_eq!(split_scopes(Some("repo,user")), vec!["repo", "user"]);
        assert!(split_scopes(None).is_empty());
    }

    #[test]
    fn test_endpoint_overrides() {
        let endpoints = Endpoints {
            authorization: Url::parse("https://idp.example.com/authorize").unwrap(),
            token: Url::parse("https://idp.example.com/token").unwrap(),
            userinfo: None,
            introspection: None,
            revocation: None,
            jwks_uri: None,
            issuer: None,
        };
        let config = ProviderConfig::new(ProviderType::OIDC, "c")
            .with_endpoint_base("http://127.0.0.1:9999/")
            .with_issuer("https://idp.example.com/");

        let endpoints = endpoints.with_overrides(&config).unwrap();
        assert_eq!(endpoints.token.as_str(), "http://127.0.0.1:9999/token");
        assert_eq!(
            endpoints.userinfo.unwrap().as_str(),
            "http://127.0.0.1:9999/userinfo"
        );
        assert_eq!(endpoints.issuer.as_deref(), Some("https://idp.example.com"));
    }
}
