//! Authentication configuration.
//!
//! [`AuthConfig`] holds flow timings and the ordered list of provider
//! configurations. When that list is empty, providers are discovered from
//! process environment variables through [`ProviderEnvironment`].
//!
//! # Example (TOML)
//!
//! ```toml
//! [auth]
//! base_url = "https://mcp.example.com"
//! pre_auth_session_ttl = "10m"
//! default_token_ttl = "1h"
//!
//! [[auth.providers]]
//! type = "github"
//! client_id = "Iv1.abc"
//! client_secret = "secret"
//! ```

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::types::ProviderType;

/// Root authentication configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Enable/disable bearer-token enforcement on protocol requests.
    pub enabled: bool,

    /// Public base URL of this server. IdP callbacks are registered as
    /// `{base_url}{path_prefix}/{provider}/callback`.
    pub base_url: String,

    /// Mount point of the OAuth routes.
    pub path_prefix: String,

    /// Lifetime of an in-flight authorization (`state`).
    #[serde(with = "humantime_serde")]
    pub pre_auth_session_ttl: Duration,

    /// Lifetime of a stored PKCE verifier, keyed by authorization code.
    #[serde(with = "humantime_serde")]
    pub verifier_ttl: Duration,

    /// Token lifetime used when the IdP does not report `expires_in`.
    #[serde(with = "humantime_serde")]
    pub default_token_ttl: Duration,

    /// How long a token record that carries a refresh token is retained,
    /// so the refresh grant keeps working after the access token expires.
    #[serde(with = "humantime_serde")]
    pub refresh_token_ttl: Duration,

    /// Timeout for every outbound IdP request.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Leeway applied to id token `exp`/`nbf` checks.
    #[serde(with = "humantime_serde")]
    pub clock_skew: Duration,

    /// How long fetched JWKS documents are cached.
    #[serde(with = "humantime_serde")]
    pub jwks_cache_ttl: Duration,

    /// Allow plain-HTTP base URLs on non-loopback hosts (testing only).
    pub allow_http: bool,

    /// Providers to register, in routing order.
    pub providers: Vec<ProviderConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://localhost:3000".to_string(),
            path_prefix: "/auth".to_string(),
            pre_auth_session_ttl: Duration::from_secs(600), // 10 minutes
            verifier_ttl: Duration::from_secs(600),
            default_token_ttl: Duration::from_secs(3600), // 1 hour
            refresh_token_ttl: Duration::from_secs(30 * 24 * 3600), // 30 days
            request_timeout: Duration::from_secs(30),
            clock_skew: Duration::from_secs(60),
            jwks_cache_ttl: Duration::from_secs(3600),
            allow_http: false,
            providers: Vec::new(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An invalid configuration value was provided.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// A required configuration value is missing.
    #[error("Missing required configuration: {0}")]
    Missing(String),
}

impl AuthConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if:
    /// - `base_url` is not an absolute URL
    /// - `base_url` is plain HTTP on a non-loopback host and `allow_http` is off
    /// - any lifetime is zero
    /// - a provider type is listed twice or a provider entry is incomplete
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = Url::parse(&self.base_url).map_err(|e| {
            ConfigError::InvalidValue(format!("base_url '{}': {}", self.base_url, e))
        })?;

        if base.scheme() == "http" && !self.allow_http && !is_loopback(&base) {
            return Err(ConfigError::InvalidValue(format!(
                "base_url '{}' must use https (set allow_http for testing)",
                self.base_url
            )));
        }

        if !self.path_prefix.is_empty() && !self.path_prefix.starts_with('/') {
            return Err(ConfigError::InvalidValue(
                "path_prefix must start with '/'".to_string(),
            ));
        }

        for (name, value) in [
            ("pre_auth_session_ttl", self.pre_auth_session_ttl),
            ("verifier_ttl", self.verifier_ttl),
            ("default_token_ttl", self.default_token_ttl),
            ("request_timeout", self.request_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue(format!("{name} must be > 0")));
            }
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.provider_type.clone()) {
                return Err(ConfigError::InvalidValue(format!(
                    "provider '{}' is configured more than once",
                    provider.provider_type
                )));
            }
            provider.validate()?;
        }

        Ok(())
    }

    /// Callback URL registered with the IdP for `provider`.
    #[must_use]
    pub fn callback_url(&self, provider: &ProviderType) -> String {
        format!(
            "{}{}/{}/callback",
            self.base_url.trim_end_matches('/'),
            self.path_prefix.trim_end_matches('/'),
            provider
        )
    }

    /// Absolute URL of a route under the OAuth prefix.
    #[must_use]
    pub fn route_url(&self, path: &str) -> String {
        format!(
            "{}{}{}",
            self.base_url.trim_end_matches('/'),
            self.path_prefix.trim_end_matches('/'),
            path
        )
    }
}

fn is_loopback(url: &Url) -> bool {
    matches!(
        url.host_str(),
        Some("localhost") | Some("127.0.0.1") | Some("[::1]")
    )
}

// =============================================================================
// Provider configuration
// =============================================================================

/// Configuration of one identity provider.
///
/// Endpoint fields override the provider's built-in endpoints; they are
/// required for the generic OIDC provider (except when derivable from
/// `issuer`) and optional for the others.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    /// Provider type; also the store namespace.
    #[serde(rename = "type")]
    pub provider_type: ProviderType,

    /// OAuth client id registered with the IdP.
    pub client_id: String,

    /// OAuth client secret.
    #[serde(default, skip_serializing)]
    pub client_secret: Option<String>,

    /// Scopes to request. Empty means the provider's defaults.
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Issuer URL (generic OIDC; optional elsewhere).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,

    /// Entra ID tenant (Microsoft only, default `common`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userinfo_endpoint: Option<String>,

    /// RFC 7662 token introspection endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub introspection_endpoint: Option<String>,

    /// RFC 7009 token revocation endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,

    /// Human-readable name shown on the login page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl ProviderConfig {
    /// Creates a provider configuration with the required fields.
    #[must_use]
    pub fn new(provider_type: ProviderType, client_id: impl Into<String>) -> Self {
        Self {
            provider_type,
            client_id: client_id.into(),
            client_secret: None,
            scopes: Vec::new(),
            issuer: None,
            tenant_id: None,
            authorization_endpoint: None,
            token_endpoint: None,
            userinfo_endpoint: None,
            introspection_endpoint: None,
            revocation_endpoint: None,
            jwks_uri: None,
            display_name: None,
        }
    }

    /// Sets the client secret.
    #[must_use]
    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    /// Sets the requested scopes.
    #[must_use]
    pub fn with_scopes(mut self, scopes: Vec<impl Into<String>>) -> Self {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the issuer URL.
    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    /// Sets the Entra ID tenant.
    #[must_use]
    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant.into());
        self
    }

    /// Points every IdP endpoint at `base` (`/authorize`, `/token`,
    /// `/userinfo`, `/introspect`, `/revoke`, `/jwks`).
    ///
    /// Mostly useful against a local mock IdP.
    #[must_use]
    pub fn with_endpoint_base(mut self, base: &str) -> Self {
        let base = base.trim_end_matches('/');
        self.authorization_endpoint = Some(format!("{base}/authorize"));
        self.token_endpoint = Some(format!("{base}/token"));
        self.userinfo_endpoint = Some(format!("{base}/userinfo"));
        self.introspection_endpoint = Some(format!("{base}/introspect"));
        self.revocation_endpoint = Some(format!("{base}/revoke"));
        self.jwks_uri = Some(format!("{base}/jwks"));
        self
    }

    /// Validates required fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider type is not a valid route and store
    /// namespace, the client id is empty, the generic OIDC provider has
    /// neither an issuer nor explicit endpoints, or an endpoint is not a
    /// valid URL.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.provider_type.validate().map_err(ConfigError::InvalidValue)?;

        if self.client_id.trim().is_empty() {
            return Err(ConfigError::Missing(format!(
                "{}: client_id",
                self.provider_type
            )));
        }

        if self.provider_type == ProviderType::OIDC
            && self.issuer.is_none()
            && (self.authorization_endpoint.is_none() || self.token_endpoint.is_none())
        {
            return Err(ConfigError::Missing(
                "oidc: issuer (or authorization_endpoint and token_endpoint)".to_string(),
            ));
        }

        for endpoint in [
            &self.issuer,
            &self.authorization_endpoint,
            &self.token_endpoint,
            &self.userinfo_endpoint,
            &self.introspection_endpoint,
            &self.revocation_endpoint,
            &self.jwks_uri,
        ]
        .into_iter()
        .flatten()
        {
            Url::parse(endpoint).map_err(|e| {
                ConfigError::InvalidValue(format!(
                    "{}: invalid URL '{}': {}",
                    self.provider_type, endpoint, e
                ))
            })?;
        }

        Ok(())
    }
}

// =============================================================================
// Environment discovery
// =============================================================================

/// Provider credentials read from environment variables.
///
/// | Provider | Variables |
/// |----------|-----------|
/// | google | `GOOGLE_CLIENT_ID`, `GOOGLE_CLIENT_SECRET` |
/// | github | `GITHUB_CLIENT_ID`, `GITHUB_CLIENT_SECRET` |
/// | microsoft | `MICROSOFT_CLIENT_ID`, `MICROSOFT_CLIENT_SECRET`, `MICROSOFT_TENANT_ID` |
/// | oidc | `OAUTH_CLIENT_ID`, `OAUTH_CLIENT_SECRET`, `OAUTH_ISSUER`, `OAUTH_AUTHORIZATION_URL`, `OAUTH_TOKEN_URL`, `OAUTH_USERINFO_URL`, `OAUTH_INTROSPECTION_URL`, `OAUTH_JWKS_URI`, `OAUTH_SCOPES` |
#[derive(Debug, Clone, Default)]
pub struct ProviderEnvironment {
    vars: HashMap<String, String>,
}

impl ProviderEnvironment {
    /// Captures the current process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Builds an environment from explicit pairs.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    fn require(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key)
            .map(str::to_string)
            .ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    /// Provider types this environment knows how to configure, in
    /// registration order.
    #[must_use]
    pub fn supported_types() -> [ProviderType; 4] {
        [
            ProviderType::GOOGLE,
            ProviderType::GITHUB,
            ProviderType::MICROSOFT,
            ProviderType::OIDC,
        ]
    }

    /// Builds the configuration of one provider type from the environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` naming the first absent variable.
    pub fn provider_config(&self, provider_type: &ProviderType) -> Result<ProviderConfig, ConfigError> {
        let prefix = match provider_type.as_str() {
            "google" => "GOOGLE",
            "github" => "GITHUB",
            "microsoft" => "MICROSOFT",
            "oidc" => "OAUTH",
            other => {
                return Err(ConfigError::InvalidValue(format!(
                    "no environment mapping for provider '{other}'"
                )));
            }
        };

        let client_id = self.require(&format!("{prefix}_CLIENT_ID"))?;
        let client_secret = self.require(&format!("{prefix}_CLIENT_SECRET"))?;
        let mut config =
            ProviderConfig::new(provider_type.clone(), client_id).with_client_secret(client_secret);

        if *provider_type == ProviderType::MICROSOFT
            && let Some(tenant) = self.get("MICROSOFT_TENANT_ID")
        {
            config = config.with_tenant(tenant);
        }

        if *provider_type == ProviderType::OIDC {
            config.issuer = self.get("OAUTH_ISSUER").map(str::to_string);
            config.authorization_endpoint = self.get("OAUTH_AUTHORIZATION_URL").map(str::to_string);
            config.token_endpoint = self.get("OAUTH_TOKEN_URL").map(str::to_string);
            config.userinfo_endpoint = self.get("OAUTH_USERINFO_URL").map(str::to_string);
            config.introspection_endpoint =
                self.get("OAUTH_INTROSPECTION_URL").map(str::to_string);
            config.jwks_uri = self.get("OAUTH_JWKS_URI").map(str::to_string);
            if let Some(scopes) = self.get("OAUTH_SCOPES") {
                config.scopes = scopes.split_whitespace().map(str::to_string).collect();
            }
        }

        config.validate()?;
        Ok(config)
    }
}
