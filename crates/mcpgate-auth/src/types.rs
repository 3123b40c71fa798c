//! Core records shared by providers, stores and the session manager.

use std::borrow::Cow;
use std::fmt;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};
use time::{Duration, OffsetDateTime};

/// Generates a high-entropy URL-safe token (32 random bytes, base64url).
///
/// Used for `state` values and generated PKCE verifiers.
#[must_use]
pub fn random_token() -> String {
    let bytes: [u8; 32] = rand::thread_rng().r#gen();
    URL_SAFE_NO_PAD.encode(bytes)
}

// =============================================================================
// Provider Type
// =============================================================================

/// Identifies one registered identity backend.
///
/// The value doubles as the namespace prefix for every shared store key the
/// provider writes, so two providers never read each other's entries.
/// Deserialization goes through [`From<&str>`], so configured names are
/// lowercased like programmatic ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ProviderType(Cow<'static, str>);

/// Path segments owned by the static OAuth routes.
pub const RESERVED_PROVIDER_NAMES: &[&str] = &["login", "authorize", "token", "revoke"];

impl ProviderType {
    /// Google accounts.
    pub const GOOGLE: Self = Self(Cow::Borrowed("google"));
    /// GitHub OAuth apps.
    pub const GITHUB: Self = Self(Cow::Borrowed("github"));
    /// Microsoft identity platform (Entra ID).
    pub const MICROSOFT: Self = Self(Cow::Borrowed("microsoft"));
    /// Any standards-compliant OpenID Connect issuer.
    pub const OIDC: Self = Self(Cow::Borrowed("oidc"));

    /// Creates a custom provider type. The name is lowercased.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into().to_ascii_lowercase()))
    }

    /// Returns the provider type as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Checks that the name is usable as a store namespace and a route
    /// segment: non-empty `[a-z0-9_-]`, and not one of
    /// [`RESERVED_PROVIDER_NAMES`].
    ///
    /// # Errors
    ///
    /// Returns a description of the problem.
    pub fn validate(&self) -> Result<(), String> {
        let name = self.as_str();
        if name.is_empty() {
            return Err("provider type must not be empty".to_string());
        }
        if let Some(c) = name
            .chars()
            .find(|c| !matches!(c, 'a'..='z' | '0'..='9' | '_' | '-'))
        {
            return Err(format!(
                "provider type '{name}' contains '{c}' (allowed: a-z, 0-9, '_', '-')"
            ));
        }
        if RESERVED_PROVIDER_NAMES.contains(&name) {
            return Err(format!("provider type '{name}' is a reserved route name"));
        }
        Ok(())
    }
}

impl<'de> Deserialize<'de> for ProviderType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::from(name.as_str()))
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ProviderType {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProviderType {
    fn from(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "google" => Self::GOOGLE,
            "github" => Self::GITHUB,
            "microsoft" => Self::MICROSOFT,
            "oidc" => Self::OIDC,
            other => Self(Cow::Owned(other.to_string())),
        }
    }
}

// =============================================================================
// Stored records
// =============================================================================

/// PKCE material stored under `{provider}:{authorization_code}`.
///
/// `code_verifier` is `None` in the pass-through flow, where the client
/// keeps the verifier and presents it at the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifierEntry {
    /// The verifier sent to the IdP, when this server generated it.
    pub code_verifier: Option<String>,
    /// S256 challenge derived from the verifier.
    pub code_challenge: String,
    /// The `state` of the flow that produced the code.
    pub state: String,
}

/// In-flight authorization context, keyed by `state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreAuthSession {
    /// Anti-CSRF token round-tripped through the IdP.
    pub state: String,

    /// Verifier generated by this server (direct flow only).
    pub code_verifier: Option<String>,

    /// Challenge sent to the IdP.
    pub code_challenge: String,

    /// Callback URL registered with the IdP.
    pub redirect_uri: String,

    /// Where the client wants the code delivered (pass-through flow).
    pub client_redirect_uri: Option<String>,

    /// The client's own `state`, echoed back on redirect.
    pub client_state: Option<String>,

    /// Scopes requested from the IdP.
    pub scopes: Vec<String>,

    /// Owning provider.
    pub provider_type: ProviderType,

    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,

    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl PreAuthSession {
    /// Returns `true` once `now` is past `expires_at`.
    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now > self.expires_at
    }

    /// Returns `true` if the session has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }

    /// Returns `true` for the pass-through flow.
    #[must_use]
    pub fn is_pass_through(&self) -> bool {
        self.client_redirect_uri.is_some()
    }
}

/// User claims resolved from the IdP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// Stable subject identifier at the IdP.
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Provider that asserted these claims.
    pub provider: ProviderType,
}

/// An issued token, keyed by its access token value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub user_info: UserInfo,
    pub provider_type: ProviderType,
    pub scopes: Vec<String>,
}

impl TokenRecord {
    /// Returns `true` if the token has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        OffsetDateTime::now_utc() >= self.expires_at
    }

    /// Time left before expiry, zero when already expired.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        let remaining = self.expires_at - OffsetDateTime::now_utc();
        if remaining.is_negative() {
            Duration::ZERO
        } else {
            remaining
        }
    }

    /// Remaining lifetime as a std duration, suitable for a store TTL.
    #[must_use]
    pub fn ttl(&self) -> std::time::Duration {
        std::time::Duration::try_from(self.remaining()).unwrap_or_default()
    }

    /// Builds the RFC 6749 token response for this record.
    #[must_use]
    pub fn to_response(&self) -> TokenResponse {
        TokenResponse {
            access_token: self.access_token.clone(),
            token_type: "Bearer".to_string(),
            expires_in: self.remaining().whole_seconds().max(0) as u64,
            refresh_token: self.refresh_token.clone(),
            id_token: self.id_token.clone(),
            scope: (!self.scopes.is_empty()).then(|| self.scopes.join(" ")),
        }
    }
}

/// Identity facts persisted with a protocol session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAuthInfo {
    pub provider: ProviderType,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl SessionAuthInfo {
    #[must_use]
    pub fn new(provider: ProviderType, user_id: impl Into<String>) -> Self {
        Self {
            provider,
            user_id: user_id.into(),
            email: None,
        }
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

impl From<&AuthInfo> for SessionAuthInfo {
    fn from(info: &AuthInfo) -> Self {
        Self {
            provider: info.provider.clone(),
            user_id: info.user_info.sub.clone(),
            email: info.user_info.email.clone(),
        }
    }
}

/// Durable facts needed to rebuild a live protocol session on any instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_info: Option<SessionAuthInfo>,
}

impl SessionMetadata {
    /// Creates metadata starting now and living for `ttl`.
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        auth_info: Option<SessionAuthInfo>,
        ttl: std::time::Duration,
    ) -> Self {
        let created_at = OffsetDateTime::now_utc();
        let ttl = Duration::try_from(ttl).unwrap_or(Duration::DAY);
        Self {
            session_id: session_id.into(),
            created_at,
            expires_at: created_at + ttl,
            auth_info,
        }
    }

    /// Returns `true` if the session has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        OffsetDateTime::now_utc() > self.expires_at
    }
}

/// Result of a successful bearer-token verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthInfo {
    /// The verified access token.
    #[serde(skip_serializing, default)]
    pub token: String,
    pub provider: ProviderType,
    /// OAuth client id of the provider that issued the token.
    pub client_id: String,
    pub scopes: Vec<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub user_info: UserInfo,
}

impl AuthInfo {
    /// Builds verification output from a locally stored record.
    #[must_use]
    pub fn from_record(record: &TokenRecord, client_id: impl Into<String>) -> Self {
        Self {
            token: record.access_token.clone(),
            provider: record.provider_type.clone(),
            client_id: client_id.into(),
            scopes: record.scopes.clone(),
            expires_at: Some(record.expires_at),
            user_info: record.user_info.clone(),
        }
    }
}

/// OAuth 2.0 token endpoint response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}
