//! Identity providers.
//!
//! Every provider implements [`OAuthProvider`], the single interface the
//! registry and the HTTP layer talk to. The concrete providers share one
//! flow implementation, [`FederatedProvider`], parameterized by an
//! [`IdentityBackend`]:
//!
//! - [`GoogleBackend`] - Google accounts (OIDC, tokeninfo introspection)
//! - [`GitHubBackend`] - GitHub OAuth apps (no refresh grant)
//! - [`MicrosoftBackend`] - Microsoft identity platform, tenant aware
//! - [`OidcBackend`] - any OpenID Connect issuer
//!
//! Adding a provider means implementing [`IdentityBackend`] (or
//! [`OAuthProvider`] directly) and registering a [`ProviderFactory`] for its
//! type with the [`ProviderRegistry`](crate::registry::ProviderRegistry).

pub mod backend;
pub mod error;
pub mod factory;
pub mod federated;
pub mod github;
pub mod google;
pub mod id_token;
pub mod microsoft;
pub mod oidc;

use async_trait::async_trait;
use url::Url;

use crate::AuthResult;
use crate::types::{AuthInfo, ProviderType, TokenRecord};

pub use backend::{ClientCredentials, Endpoints, IdentityBackend, Introspection};
pub use error::IdpError;
pub use factory::{
    DynProviderFactory, OidcFactory, PresetFactory, ProviderFactories, ProviderFactory,
};
pub use federated::{FederatedProvider, FlowSettings};
pub use github::GitHubBackend;
pub use google::GoogleBackend;
pub use id_token::{IdTokenClaims, IdTokenVerifier, JwksCache, JwksError};
pub use microsoft::MicrosoftBackend;
pub use oidc::OidcBackend;

/// Parameters of an authorization request as received from the client.
#[derive(Debug, Clone, Default)]
pub struct AuthorizationRequest {
    /// Client redirect URI; present in the pass-through flow.
    pub client_redirect_uri: Option<String>,
    /// Client-supplied PKCE challenge; required with `client_redirect_uri`.
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    /// Client `state`, echoed back on the final redirect.
    pub client_state: Option<String>,
    /// Requested scopes; `None` uses the provider's configured scopes.
    pub scopes: Option<Vec<String>>,
}

/// Where to send the user agent to start the IdP login.
#[derive(Debug, Clone)]
pub struct AuthorizationRedirect {
    pub url: Url,
    /// The freshly generated `state` (pre-auth session key).
    pub state: String,
}

/// Query parameters of an IdP callback.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Result of a successful callback.
#[derive(Debug, Clone)]
pub enum CallbackOutcome {
    /// Direct flow: the code was exchanged and the tokens stored.
    Tokens(TokenRecord),
    /// Pass-through flow: send the user agent back to the client with the
    /// unchanged authorization code.
    Redirect(Url),
}

/// Authorization-code grant as presented at the universal token endpoint.
#[derive(Debug, Clone)]
pub struct CodeExchangeRequest {
    pub code: String,
    pub code_verifier: Option<String>,
}

/// One identity provider integration.
///
/// Implementations own a provider namespace in the shared stores. The
/// `has_*` lookups read only that namespace and never contact the IdP;
/// routing across providers relies on that.
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    /// Provider type; also the store namespace.
    fn provider_type(&self) -> &ProviderType;

    /// Name shown on the login page.
    fn display_name(&self) -> &str;

    /// OAuth client id registered with the IdP.
    fn client_id(&self) -> &str;

    /// Starts an authorization: persists a pre-auth session and returns the
    /// IdP authorization URL (always `code_challenge_method=S256`).
    async fn handle_authorization_request(
        &self,
        request: AuthorizationRequest,
    ) -> AuthResult<AuthorizationRedirect>;

    /// Completes an authorization from the IdP redirect.
    async fn handle_authorization_callback(
        &self,
        params: CallbackParams,
    ) -> AuthResult<CallbackOutcome>;

    /// Exchanges an authorization code held in this provider's namespace.
    async fn handle_token_exchange(&self, request: CodeExchangeRequest)
    -> AuthResult<TokenRecord>;

    /// Exchanges a refresh token, replacing the stored record.
    async fn handle_token_refresh(&self, refresh_token: &str) -> AuthResult<TokenRecord>;

    /// Ends the user's session, revoking the token when one is given.
    async fn handle_logout(&self, access_token: Option<&str>) -> AuthResult<()>;

    /// Revokes an access or refresh token. Returns `false` when the token
    /// is not known to this provider.
    async fn revoke_token(&self, token: &str) -> AuthResult<bool>;

    /// Verifies a bearer token: local store first, then introspection,
    /// then user info.
    async fn verify_access_token(&self, token: &str) -> AuthResult<AuthInfo>;

    /// Local check for a verifier entry under `{provider}:{code}`.
    async fn has_stored_code_for_provider(&self, code: &str) -> AuthResult<bool>;

    /// The stored PKCE verifier for `code`, if this server generated one.
    async fn get_stored_code_verifier(&self, code: &str) -> AuthResult<Option<String>>;

    /// Local check for an access token issued through this provider.
    async fn has_token(&self, token: &str) -> AuthResult<bool>;

    /// Local check for a refresh token issued through this provider.
    async fn has_refresh_token(&self, refresh_token: &str) -> AuthResult<bool>;

    /// Releases per-provider resources. Safe to call more than once.
    async fn dispose(&self) -> AuthResult<()>;
}
