//! The shared authorization-code + PKCE flow.
//!
//! Lifecycle of one authorization:
//!
//! ```text
//! Unauthenticated -> AwaitingCallback -> Exchanged -> Active -> Refreshed
//!                                    \-> Failed      \-> Revoked / Expired
//! ```
//!
//! Failures are terminal; the client restarts from the authorization
//! request. All state lives in the shared stores under this provider's
//! namespace, so any process instance can serve any step.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use time::OffsetDateTime;
use url::Url;

use super::backend::{ClientCredentials, IdentityBackend, read_json, split_scopes};
use super::error::IdpError;
use super::id_token::{IdTokenVerifier, JwksCache};
use super::{
    AuthorizationRedirect, AuthorizationRequest, CallbackOutcome, CallbackParams,
    CodeExchangeRequest, OAuthProvider,
};
use crate::AuthResult;
use crate::config::{AuthConfig, ProviderConfig};
use crate::error::AuthError;
use crate::pkce::{PkceChallenge, PkceChallengeMethod, PkceVerifier};
use crate::storage::{AuthStores, namespaced_key};
use crate::types::{
    AuthInfo, PreAuthSession, ProviderType, TokenRecord, UserInfo, VerifierEntry, random_token,
};

const INVALID_TOKEN: &str = "Invalid or expired token";

/// Flow timings and the callback URL of one provider.
#[derive(Debug, Clone)]
pub struct FlowSettings {
    /// Callback registered with the IdP.
    pub redirect_uri: String,
    pub pre_auth_session_ttl: Duration,
    pub verifier_ttl: Duration,
    pub default_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub request_timeout: Duration,
    pub clock_skew: Duration,
    pub jwks_cache_ttl: Duration,
    pub allow_http: bool,
}

impl FlowSettings {
    #[must_use]
    pub fn from_config(config: &AuthConfig, provider: &ProviderType) -> Self {
        Self {
            redirect_uri: config.callback_url(provider),
            pre_auth_session_ttl: config.pre_auth_session_ttl,
            verifier_ttl: config.verifier_ttl,
            default_token_ttl: config.default_token_ttl,
            refresh_token_ttl: config.refresh_token_ttl,
            request_timeout: config.request_timeout,
            clock_skew: config.clock_skew,
            jwks_cache_ttl: config.jwks_cache_ttl,
            allow_http: config.allow_http,
        }
    }
}

#[derive(Debug, Deserialize)]
struct IdpTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// [`OAuthProvider`] implemented once over an [`IdentityBackend`].
pub struct FederatedProvider<B> {
    backend: B,
    provider_type: ProviderType,
    credentials: ClientCredentials,
    scopes: Vec<String>,
    settings: FlowSettings,
    stores: AuthStores,
    http: reqwest::Client,
    id_tokens: Option<IdTokenVerifier>,
    disposed: AtomicBool,
}

impl<B: IdentityBackend> FederatedProvider<B> {
    /// Creates a provider.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Configuration` if the HTTP client cannot be built.
    pub fn new(
        backend: B,
        config: &ProviderConfig,
        settings: FlowSettings,
        stores: AuthStores,
    ) -> AuthResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .user_agent(concat!("mcpgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AuthError::configuration(format!("HTTP client: {e}")))?;

        let id_tokens = backend.endpoints().jwks_uri.clone().map(|jwks_uri| {
            let cache = JwksCache::new(
                http.clone(),
                jwks_uri,
                settings.jwks_cache_ttl,
                settings.allow_http,
            );
            IdTokenVerifier::new(
                Arc::new(cache),
                config.client_id.clone(),
                backend.endpoints().issuer.clone(),
                settings.clock_skew,
            )
        });

        let scopes = if config.scopes.is_empty() {
            backend.default_scopes()
        } else {
            config.scopes.clone()
        };

        Ok(Self {
            provider_type: backend.provider_type(),
            backend,
            credentials: ClientCredentials {
                client_id: config.client_id.clone(),
                client_secret: config.client_secret.clone(),
            },
            scopes,
            settings,
            stores,
            http,
            id_tokens,
            disposed: AtomicBool::new(false),
        })
    }

    /// The backend this provider drives.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns `true` once [`OAuthProvider::dispose`] has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn key(&self, value: &str) -> String {
        namespaced_key(&self.provider_type, value)
    }

    fn idp_error(&self, operation: &str) -> impl FnOnce(IdpError) -> AuthError + '_ {
        let operation = operation.to_string();
        move |e| e.into_auth_error(&self.provider_type, &operation)
    }

    fn authorization_url(&self, state: &str, challenge: &str, scopes: &[String]) -> Url {
        let mut url = self.backend.endpoints().authorization.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.credentials.client_id)
                .append_pair("redirect_uri", &self.settings.redirect_uri)
                .append_pair("scope", &scopes.join(" "))
                .append_pair("state", state)
                .append_pair("code_challenge", challenge)
                .append_pair("code_challenge_method", PkceChallengeMethod::S256.as_str());
            for (name, value) in self.backend.extra_authorize_params() {
                query.append_pair(name, &value);
            }
        }
        url
    }

    /// POSTs a grant to the IdP token endpoint.
    async fn token_request(
        &self,
        mut params: Vec<(&'static str, String)>,
    ) -> Result<IdpTokenResponse, IdpError> {
        params.push(("client_id", self.credentials.client_id.clone()));
        if let Some(secret) = &self.credentials.client_secret {
            params.push(("client_secret", secret.clone()));
        }

        let response = self
            .http
            .post(self.backend.endpoints().token.as_str())
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await?;
        read_json(response, "token").await
    }

    /// Resolves the user behind a fresh token response. A returned ID
    /// token is verified; without one the user-info endpoint is asked.
    async fn resolve_user(&self, tokens: &IdpTokenResponse) -> Result<UserInfo, IdpError> {
        if let (Some(id_token), Some(verifier)) = (&tokens.id_token, &self.id_tokens) {
            let claims = verifier.verify(id_token).await?;
            return Ok(UserInfo {
                sub: claims.sub,
                email: claims.email,
                name: claims.name.or(claims.preferred_username),
                provider: self.provider_type.clone(),
            });
        }
        self.backend
            .fetch_user_info(&self.http, &tokens.access_token)
            .await
    }

    fn build_record(
        &self,
        tokens: IdpTokenResponse,
        user_info: UserInfo,
        requested_scopes: &[String],
    ) -> TokenRecord {
        let ttl = tokens
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(self.settings.default_token_ttl);
        let scopes = match split_scopes(tokens.scope.as_deref()) {
            granted if !granted.is_empty() => granted,
            _ => requested_scopes.to_vec(),
        };

        TokenRecord {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            id_token: tokens.id_token,
            expires_at: OffsetDateTime::now_utc()
                + time::Duration::try_from(ttl).unwrap_or(time::Duration::HOUR),
            user_info,
            provider_type: self.provider_type.clone(),
            scopes,
        }
    }

    async fn store_record(&self, record: &TokenRecord) -> AuthResult<()> {
        let mut ttl = record.ttl();
        if record.refresh_token.is_some() {
            ttl = ttl.max(self.settings.refresh_token_ttl);
        }
        self.stores
            .tokens
            .set(record, ttl.max(Duration::from_secs(1)))
            .await
    }

    /// Exchanges `code` at the IdP and stores the resulting record.
    async fn exchange_and_store(
        &self,
        code: &str,
        code_verifier: &str,
        requested_scopes: &[String],
    ) -> AuthResult<TokenRecord> {
        let tokens = self
            .token_request(vec![
                ("grant_type", "authorization_code".to_string()),
                ("code", code.to_string()),
                ("redirect_uri", self.settings.redirect_uri.clone()),
                ("code_verifier", code_verifier.to_string()),
            ])
            .await
            .map_err(self.idp_error("token exchange"))?;

        let user_info = self
            .resolve_user(&tokens)
            .await
            .map_err(self.idp_error("user resolution"))?;

        let record = self.build_record(tokens, user_info, requested_scopes);
        self.store_record(&record).await?;

        tracing::info!(
            provider = %self.provider_type,
            user = %record.user_info.sub,
            "authorization code exchanged"
        );
        Ok(record)
    }

    /// Remote verification: introspection, then user info.
    async fn verify_remote(&self, token: &str) -> AuthResult<AuthInfo> {
        let introspection = match self
            .backend
            .introspect(&self.http, &self.credentials, token)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                tracing::debug!(provider = %self.provider_type, error = %e, "introspection failed, trying user info");
                None
            }
        };

        let (user_info, scopes, expires_in) = match introspection {
            Some(result) if !result.active => {
                return Err(AuthError::invalid_token(INVALID_TOKEN));
            }
            Some(super::Introspection {
                user_info: Some(user),
                scopes,
                expires_in,
                ..
            }) => (user, scopes, expires_in),
            _ => match self.backend.fetch_user_info(&self.http, token).await {
                Ok(user) => (user, self.scopes.clone(), None),
                Err(e) => {
                    tracing::debug!(provider = %self.provider_type, error = %e, "user info verification failed");
                    return Err(AuthError::invalid_token(INVALID_TOKEN));
                }
            },
        };

        let tokens = IdpTokenResponse {
            access_token: token.to_string(),
            expires_in,
            refresh_token: None,
            id_token: None,
            scope: None,
        };
        let record = self.build_record(tokens, user_info, &scopes);
        self.store_record(&record).await?;

        tracing::debug!(provider = %self.provider_type, "token verified remotely and cached");
        Ok(AuthInfo::from_record(&record, &self.credentials.client_id))
    }
}

#[async_trait]
impl<B: IdentityBackend> OAuthProvider for FederatedProvider<B> {
    fn provider_type(&self) -> &ProviderType {
        &self.provider_type
    }

    fn display_name(&self) -> &str {
        self.backend.display_name()
    }

    fn client_id(&self) -> &str {
        &self.credentials.client_id
    }

    async fn handle_authorization_request(
        &self,
        request: AuthorizationRequest,
    ) -> AuthResult<AuthorizationRedirect> {
        let (code_verifier, code_challenge) = match (
            &request.client_redirect_uri,
            &request.code_challenge,
        ) {
            (Some(_), Some(challenge)) => {
                PkceChallengeMethod::parse(request.code_challenge_method.as_deref().unwrap_or("S256"))?;
                (None, PkceChallenge::new(challenge.clone())?.into_inner())
            }
            (Some(_), None) => {
                return Err(AuthError::invalid_request(
                    "code_challenge is required when redirect_uri is supplied",
                ));
            }
            (None, Some(_)) => {
                return Err(AuthError::invalid_request(
                    "redirect_uri is required with a client code_challenge",
                ));
            }
            (None, None) => {
                let verifier = PkceVerifier::generate();
                let challenge = PkceChallenge::from_verifier(&verifier);
                (Some(verifier.into_inner()), challenge.into_inner())
            }
        };

        if let Some(uri) = &request.client_redirect_uri {
            Url::parse(uri)
                .map_err(|_| AuthError::invalid_request("redirect_uri must be an absolute URL"))?;
        }

        let scopes = request
            .scopes
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.scopes.clone());
        let state = random_token();
        let now = OffsetDateTime::now_utc();
        let ttl = self.settings.pre_auth_session_ttl;

        let url = self.authorization_url(&state, &code_challenge, &scopes);

        let session = PreAuthSession {
            state: state.clone(),
            code_verifier,
            code_challenge,
            redirect_uri: self.settings.redirect_uri.clone(),
            client_redirect_uri: request.client_redirect_uri,
            client_state: request.client_state,
            scopes,
            provider_type: self.provider_type.clone(),
            created_at: now,
            expires_at: now + time::Duration::try_from(ttl).unwrap_or(time::Duration::minutes(10)),
        };
        self.stores.pre_auth_sessions.set(&session, ttl).await?;

        tracing::info!(
            provider = %self.provider_type,
            pass_through = session.is_pass_through(),
            "authorization started"
        );

        Ok(AuthorizationRedirect { url, state })
    }

    async fn handle_authorization_callback(
        &self,
        params: CallbackParams,
    ) -> AuthResult<CallbackOutcome> {
        if let Some(error) = params.error {
            tracing::info!(
                provider = %self.provider_type,
                error = %error,
                description = ?params.error_description,
                "identity provider reported an authorization error"
            );
            return Err(AuthError::access_denied(format!(
                "authorization was not granted: {error}"
            )));
        }

        let (Some(code), Some(state)) = (params.code, params.state) else {
            return Err(AuthError::invalid_request(
                "missing code or state parameter",
            ));
        };

        let state_error = || AuthError::invalid_state("oauth_state_error: unknown or expired state");

        // Check ownership before consuming so a stray callback on the wrong
        // provider path cannot burn another provider's session.
        let session = self
            .stores
            .pre_auth_sessions
            .get(&state)
            .await?
            .ok_or_else(state_error)?;
        if session.provider_type != self.provider_type {
            tracing::warn!(
                provider = %self.provider_type,
                owner = %session.provider_type,
                "callback state belongs to another provider"
            );
            return Err(state_error());
        }

        let session = self
            .stores
            .pre_auth_sessions
            .take(&state)
            .await?
            .ok_or_else(state_error)?;
        if session.is_expired() {
            return Err(state_error());
        }

        let key = self.key(&code);
        let entry = VerifierEntry {
            code_verifier: session.code_verifier.clone(),
            code_challenge: session.code_challenge.clone(),
            state: session.state.clone(),
        };
        self.stores
            .verifiers
            .set(&key, &entry, self.settings.verifier_ttl)
            .await?;

        match (&session.client_redirect_uri, &session.code_verifier) {
            (Some(client_redirect), _) => {
                let mut url = Url::parse(client_redirect)
                    .map_err(|_| AuthError::invalid_request("stored redirect_uri is invalid"))?;
                {
                    let mut query = url.query_pairs_mut();
                    query.append_pair("code", &code);
                    if let Some(client_state) = &session.client_state {
                        query.append_pair("state", client_state);
                    }
                }
                tracing::info!(provider = %self.provider_type, "redirecting code to client");
                Ok(CallbackOutcome::Redirect(url))
            }
            (None, Some(verifier)) => {
                let record = self
                    .exchange_and_store(&code, verifier, &session.scopes)
                    .await?;
                self.stores.verifiers.delete(&key).await?;
                Ok(CallbackOutcome::Tokens(record))
            }
            (None, None) => Err(AuthError::internal(
                "pre-auth session has neither a verifier nor a client redirect",
            )),
        }
    }

    async fn handle_token_exchange(
        &self,
        request: CodeExchangeRequest,
    ) -> AuthResult<TokenRecord> {
        let key = self.key(&request.code);
        let entry = self
            .stores
            .verifiers
            .get(&key)
            .await?
            .ok_or_else(|| AuthError::invalid_grant("unknown or expired authorization code"))?;

        let challenge = PkceChallenge::new(entry.code_challenge.clone())?;
        let verifier = match (&request.code_verifier, &entry.code_verifier) {
            (Some(client_verifier), stored) => {
                let client_verifier = PkceVerifier::new(client_verifier.clone())?;
                challenge.verify(&client_verifier)?;
                stored.clone().unwrap_or_else(|| client_verifier.into_inner())
            }
            (None, Some(stored)) => stored.clone(),
            (None, None) => {
                return Err(AuthError::invalid_request("code_verifier is required"));
            }
        };

        let record = self
            .exchange_and_store(&request.code, &verifier, &self.scopes)
            .await?;
        self.stores.verifiers.delete(&key).await?;
        Ok(record)
    }

    async fn handle_token_refresh(&self, refresh_token: &str) -> AuthResult<TokenRecord> {
        let existing = self
            .stores
            .tokens
            .find_by_refresh_token(&self.provider_type, refresh_token)
            .await?
            .ok_or_else(|| AuthError::invalid_grant("unknown refresh token"))?;

        if !self.backend.supports_refresh() {
            tracing::debug!(
                provider = %self.provider_type,
                "refresh grant not supported by IdP, returning current token"
            );
            return Ok(existing);
        }

        let tokens = self
            .token_request(vec![
                ("grant_type", "refresh_token".to_string()),
                ("refresh_token", refresh_token.to_string()),
            ])
            .await
            .map_err(self.idp_error("token refresh"))?;

        let rotated = tokens.refresh_token.is_some();
        let mut record = self.build_record(tokens, existing.user_info.clone(), &existing.scopes);
        if !rotated {
            record.refresh_token = Some(refresh_token.to_string());
        }
        if record.id_token.is_none() {
            record.id_token = existing.id_token.clone();
        }

        self.stores
            .tokens
            .delete(&self.provider_type, &existing.access_token)
            .await?;
        self.store_record(&record).await?;

        tracing::info!(provider = %self.provider_type, rotated, "token refreshed");
        Ok(record)
    }

    async fn handle_logout(&self, access_token: Option<&str>) -> AuthResult<()> {
        if let Some(token) = access_token {
            self.revoke_token(token).await?;
        }
        tracing::info!(provider = %self.provider_type, "logout");
        Ok(())
    }

    async fn revoke_token(&self, token: &str) -> AuthResult<bool> {
        let record = match self.stores.tokens.get(&self.provider_type, token).await? {
            Some(record) => Some(record),
            None => {
                self.stores
                    .tokens
                    .find_by_refresh_token(&self.provider_type, token)
                    .await?
            }
        };
        let Some(record) = record else {
            return Ok(false);
        };

        if let Some(endpoint) = &self.backend.endpoints().revocation {
            let result = self
                .http
                .post(endpoint.as_str())
                .form(&[("token", token)])
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => tracing::warn!(
                    provider = %self.provider_type,
                    status = response.status().as_u16(),
                    "upstream revocation rejected"
                ),
                Err(e) => tracing::warn!(
                    provider = %self.provider_type,
                    error = %e,
                    "upstream revocation failed"
                ),
            }
        }

        self.stores
            .tokens
            .delete(&self.provider_type, &record.access_token)
            .await?;
        tracing::info!(provider = %self.provider_type, "token revoked");
        Ok(true)
    }

    async fn verify_access_token(&self, token: &str) -> AuthResult<AuthInfo> {
        if let Some(record) = self.stores.tokens.get(&self.provider_type, token).await? {
            if record.is_expired() {
                return Err(AuthError::invalid_token(INVALID_TOKEN));
            }
            return Ok(AuthInfo::from_record(&record, &self.credentials.client_id));
        }
        self.verify_remote(token).await
    }

    async fn has_stored_code_for_provider(&self, code: &str) -> AuthResult<bool> {
        self.stores.verifiers.has(&self.key(code)).await
    }

    async fn get_stored_code_verifier(&self, code: &str) -> AuthResult<Option<String>> {
        Ok(self
            .stores
            .verifiers
            .get(&self.key(code))
            .await?
            .and_then(|entry| entry.code_verifier))
    }

    async fn has_token(&self, token: &str) -> AuthResult<bool> {
        self.stores.tokens.has(&self.provider_type, token).await
    }

    async fn has_refresh_token(&self, refresh_token: &str) -> AuthResult<bool> {
        Ok(self
            .stores
            .tokens
            .find_by_refresh_token(&self.provider_type, refresh_token)
            .await?
            .is_some())
    }

    async fn dispose(&self) -> AuthResult<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(verifier) = &self.id_tokens {
            verifier.jwks().clear().await;
        }
        tracing::debug!(provider = %self.provider_type, "provider disposed");
        Ok(())
    }
}
