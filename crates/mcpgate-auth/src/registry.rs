//! Provider registry and multi-provider routing.
//!
//! The registry owns the shared stores and an ordered map of providers
//! (registration order). Routing of codes, access tokens and refresh
//! tokens asks each provider, in order, whether the value exists in its own
//! store namespace. Those checks never leave the store, so a token is only
//! ever presented to the identity provider that issued it.
//!
//! The registry is constructed by the process entry point, shared through
//! an `Arc`, and disposed explicitly on shutdown.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::AuthResult;
use crate::config::{AuthConfig, ProviderConfig, ProviderEnvironment};
use crate::error::AuthError;
use crate::provider::{
    CodeExchangeRequest, DynProviderFactory, OAuthProvider, ProviderFactories,
};
use crate::storage::AuthStores;
use crate::types::{AuthInfo, ProviderType, TokenRecord};

const GENERIC_TOKEN_ERROR: &str = "Invalid or expired token";

/// Failures collected while disposing providers.
#[derive(Debug)]
pub struct DisposeError {
    pub failures: Vec<(ProviderType, AuthError)>,
}

impl fmt::Display for DisposeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to dispose {} provider(s)", self.failures.len())?;
        for (i, (provider, error)) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{provider}: {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for DisposeError {}

/// Ordered collection of providers over shared stores.
pub struct ProviderRegistry {
    stores: AuthStores,
    config: Arc<AuthConfig>,
    factories: ProviderFactories,
    providers: IndexMap<ProviderType, Arc<dyn OAuthProvider>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(stores: AuthStores, config: AuthConfig) -> Self {
        Self {
            stores,
            config: Arc::new(config),
            factories: ProviderFactories::default(),
            providers: IndexMap::new(),
        }
    }

    /// Replaces the constructor table used by
    /// [`create_from_config`](Self::create_from_config) and
    /// [`create_all_from_environment`](Self::create_all_from_environment).
    #[must_use]
    pub fn with_factories(mut self, factories: ProviderFactories) -> Self {
        self.factories = factories;
        self
    }

    /// Adds a constructor for `provider_type`, replacing any built-in one.
    pub fn register_factory(&mut self, provider_type: ProviderType, factory: DynProviderFactory) {
        self.factories.register(provider_type, factory);
    }

    /// The shared stores handed to every provider.
    #[must_use]
    pub fn stores(&self) -> &AuthStores {
        &self.stores
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Registers a provider at the end of the routing order.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Configuration` if the provider type is not a
    /// valid name or is already registered.
    pub fn register(&mut self, provider: Arc<dyn OAuthProvider>) -> AuthResult<()> {
        let provider_type = provider.provider_type().clone();
        provider_type.validate().map_err(AuthError::configuration)?;
        if self.providers.contains_key(&provider_type) {
            return Err(AuthError::configuration(format!(
                "provider '{provider_type}' is already registered"
            )));
        }
        tracing::info!(provider = %provider_type, "registered identity provider");
        self.providers.insert(provider_type, provider);
        Ok(())
    }

    /// Registers providers from configuration, or from the environment when
    /// no provider is configured. Returns how many were registered.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly configured provider cannot be built.
    pub async fn initialize(&mut self, env: &ProviderEnvironment) -> AuthResult<usize> {
        if self.config.providers.is_empty() {
            Ok(self.create_all_from_environment(env).await)
        } else {
            let configs = self.config.providers.clone();
            self.create_from_config(&configs).await
        }
    }

    /// Builds and registers each configured provider, in order.
    ///
    /// # Errors
    ///
    /// Returns the first construction or registration failure.
    pub async fn create_from_config(&mut self, configs: &[ProviderConfig]) -> AuthResult<usize> {
        for config in configs {
            config
                .validate()
                .map_err(|e| AuthError::configuration(e.to_string()))?;
            let provider = self
                .factories
                .build(config, &self.config, self.stores.clone())
                .await?;
            self.register(provider)?;
        }
        Ok(configs.len())
    }

    /// Attempts every supported provider type independently.
    ///
    /// A provider whose credentials are missing or whose construction fails
    /// is skipped and logged at low severity; the others still register.
    /// Returns how many were registered.
    pub async fn create_all_from_environment(&mut self, env: &ProviderEnvironment) -> usize {
        let mut registered = 0;
        for provider_type in ProviderEnvironment::supported_types() {
            let config = match env.provider_config(&provider_type) {
                Ok(config) => config,
                Err(e) => {
                    tracing::debug!(provider = %provider_type, reason = %e, "provider not configured");
                    continue;
                }
            };

            let built = self
                .factories
                .build(&config, &self.config, self.stores.clone())
                .await;
            let result = match built {
                Ok(provider) => self.register(provider),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => registered += 1,
                Err(e) => {
                    tracing::info!(provider = %provider_type, error = %e, "provider unavailable");
                }
            }
        }

        if registered == 0 {
            tracing::warn!("no identity providers configured");
        }
        registered
    }

    /// Looks up a provider by type.
    #[must_use]
    pub fn get(&self, provider_type: &ProviderType) -> Option<Arc<dyn OAuthProvider>> {
        self.providers.get(provider_type).cloned()
    }

    /// Looks up a provider by its path segment (case-insensitive).
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn OAuthProvider>> {
        self.get(&ProviderType::from(name))
    }

    /// Registered provider types in routing order.
    #[must_use]
    pub fn provider_types(&self) -> Vec<ProviderType> {
        self.providers.keys().cloned().collect()
    }

    /// Registered providers in routing order.
    pub fn providers(&self) -> impl Iterator<Item = &Arc<dyn OAuthProvider>> {
        self.providers.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// First provider, in routing order, holding a verifier for `code`.
    ///
    /// # Errors
    ///
    /// Returns an error if a store lookup fails.
    pub async fn find_provider_for_code(
        &self,
        code: &str,
    ) -> AuthResult<Option<Arc<dyn OAuthProvider>>> {
        for provider in self.providers.values() {
            if provider.has_stored_code_for_provider(code).await? {
                tracing::debug!(provider = %provider.provider_type(), "code routed");
                return Ok(Some(provider.clone()));
            }
        }
        Ok(None)
    }

    /// First provider, in routing order, that issued `token`.
    ///
    /// # Errors
    ///
    /// Returns an error if a store lookup fails.
    pub async fn find_provider_for_token(
        &self,
        token: &str,
    ) -> AuthResult<Option<Arc<dyn OAuthProvider>>> {
        for provider in self.providers.values() {
            if provider.has_token(token).await? {
                return Ok(Some(provider.clone()));
            }
        }
        Ok(None)
    }

    /// First provider, in routing order, that issued `refresh_token`.
    ///
    /// # Errors
    ///
    /// Returns an error if a store lookup fails.
    pub async fn find_provider_for_refresh_token(
        &self,
        refresh_token: &str,
    ) -> AuthResult<Option<Arc<dyn OAuthProvider>>> {
        for provider in self.providers.values() {
            if provider.has_refresh_token(refresh_token).await? {
                return Ok(Some(provider.clone()));
            }
        }
        Ok(None)
    }

    /// Verifies a bearer token.
    ///
    /// The token is handed to the provider whose store holds it. With no
    /// local match, a lone registered provider may verify it remotely; with
    /// several, the request fails without contacting any IdP. The error
    /// never names the providers that were consulted.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidToken` if no provider accepts the token,
    /// or a server error if a store or IdP call fails.
    pub async fn verify_access_token(&self, token: &str) -> AuthResult<AuthInfo> {
        if let Some(provider) = self.find_provider_for_token(token).await? {
            return provider.verify_access_token(token).await;
        }

        if self.providers.len() == 1
            && let Some(provider) = self.providers.values().next()
        {
            return provider.verify_access_token(token).await;
        }

        Err(AuthError::invalid_token(GENERIC_TOKEN_ERROR))
    }

    /// Authorization-code grant on the universal token endpoint.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidGrant` if no provider holds the code, or
    /// the owning provider's exchange error.
    pub async fn exchange_code(&self, request: CodeExchangeRequest) -> AuthResult<TokenRecord> {
        let provider = self
            .find_provider_for_code(&request.code)
            .await?
            .ok_or_else(|| AuthError::invalid_grant("unknown or expired authorization code"))?;
        provider.handle_token_exchange(request).await
    }

    /// Refresh-token grant on the universal token endpoint.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidGrant` if no provider issued the refresh
    /// token, or the owning provider's refresh error.
    pub async fn refresh_token(&self, refresh_token: &str) -> AuthResult<TokenRecord> {
        let provider = self
            .find_provider_for_refresh_token(refresh_token)
            .await?
            .ok_or_else(|| AuthError::invalid_grant("unknown refresh token"))?;
        provider.handle_token_refresh(refresh_token).await
    }

    /// Revokes a token with whichever provider issued it. Unknown tokens
    /// are not an error (RFC 7009).
    ///
    /// # Errors
    ///
    /// Returns an error if a store call fails.
    pub async fn revoke_token(&self, token: &str) -> AuthResult<()> {
        for provider in self.providers.values() {
            if provider.revoke_token(token).await? {
                return Ok(());
            }
        }
        tracing::debug!("revocation requested for unknown token");
        Ok(())
    }

    /// Disposes every provider, continuing past failures.
    ///
    /// # Errors
    ///
    /// Returns a [`DisposeError`] listing every provider that failed.
    pub async fn dispose_all(&self) -> Result<(), DisposeError> {
        let mut failures = Vec::new();
        for (provider_type, provider) in &self.providers {
            if let Err(e) = provider.dispose().await {
                tracing::error!(provider = %provider_type, error = %e, "provider disposal failed");
                failures.push((provider_type.clone(), e));
            }
        }

        if failures.is_empty() {
            tracing::debug!(count = self.providers.len(), "providers disposed");
            Ok(())
        } else {
            Err(DisposeError { failures })
        }
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.provider_types())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::provider::{
        AuthorizationRedirect, AuthorizationRequest, CallbackOutcome, CallbackParams,
    };
    use crate::storage::namespaced_key;
    use crate::types::{UserInfo, VerifierEntry};

    /// Provider that only consults the shared stores and counts would-be
    /// remote verifications.
    struct StubProvider {
        provider_type: ProviderType,
        stores: AuthStores,
        remote_calls: AtomicUsize,
        fail_dispose: bool,
        disposed: AtomicUsize,
    }

    impl StubProvider {
        fn new(provider_type: ProviderType, stores: AuthStores) -> Self {
            Self {
                provider_type,
                stores,
                remote_calls: AtomicUsize::new(0),
                fail_dispose: false,
                disposed: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl OAuthProvider for StubProvider {
        fn provider_type(&self) -> &ProviderType {
            &self.provider_type
        }
        fn display_name(&self) -> &str {
            self.provider_type.as_str()
        }
        fn client_id(&self) -> &str {
            "stub"
        }
        async fn handle_authorization_request(
            &self,
            _request: AuthorizationRequest,
        ) -> AuthResult<AuthorizationRedirect> {
            Err(AuthError::internal("not used"))
        }
        async fn handle_authorization_callback(
            &self,
            _params: CallbackParams,
        ) -> AuthResult<CallbackOutcome> {
            Err(AuthError::internal("not used"))
        }
        async fn handle_token_exchange(
            &self,
            request: CodeExchangeRequest,
        ) -> AuthResult<TokenRecord> {
            Ok(record(&self.provider_type, &format!("at-for-{}", request.code)))
        }
        async fn handle_token_refresh(&self, _refresh_token: &str) -> AuthResult<TokenRecord> {
            Err(AuthError::internal("not used"))
        }
        async fn handle_logout(&self, _access_token: Option<&str>) -> AuthResult<()> {
            Ok(())
        }
        async fn revoke_token(&self, token: &str) -> AuthResult<bool> {
            let known = self.has_token(token).await?;
            self.stores.tokens.delete(&self.provider_type, token).await?;
            Ok(known)
        }
        async fn verify_access_token(&self, token: &str) -> AuthResult<AuthInfo> {
            match self.stores.tokens.get(&self.provider_type, token).await? {
                Some(record) => Ok(AuthInfo::from_record(&record, "stub")),
                None => {
                    self.remote_calls.fetch_add(1, Ordering::SeqCst);
                    Err(AuthError::invalid_token(GENERIC_TOKEN_ERROR))
                }
            }
        }
        async fn has_stored_code_for_provider(&self, code: &str) -> AuthResult<bool> {
            self.stores
                .verifiers
                .has(&namespaced_key(&self.provider_type, code))
                .await
        }
        async fn get_stored_code_verifier(&self, code: &str) -> AuthResult<Option<String>> {
            Ok(self
                .stores
                .verifiers
                .get(&namespaced_key(&self.provider_type, code))
                .await?
                .and_then(|e| e.code_verifier))
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
            self.disposed.fetch_add(1, Ordering::SeqCst);
            if self.fail_dispose {
                Err(AuthError::internal("boom"))
            } else {
                Ok(())
            }
        }
    }

    fn record(provider: &ProviderType, access_token: &str) -> TokenRecord {
        TokenRecord {
            access_token: access_token.to_string(),
            refresh_token: Some(format!("rt-{access_token}")),
            id_token: None,
            expires_at: time::OffsetDateTime::now_utc() + time::Duration::hours(1),
            user_info: UserInfo {
                sub: "u1".into(),
                email: None,
                name: None,
                provider: provider.clone(),
            },
            provider_type: provider.clone(),
            scopes: vec![],
        }
    }

    fn verifier(verifier: &str) -> VerifierEntry {
        VerifierEntry {
            code_verifier: Some(verifier.to_string()),
            code_challenge: "c".into(),
            state: "s".into(),
        }
    }

    fn registry_with(types: &[ProviderType]) -> (ProviderRegistry, Vec<Arc<StubProvider>>) {
        let stores = AuthStores::in_memory();
        let mut registry = ProviderRegistry::new(stores.clone(), AuthConfig::default());
        let mut stubs = Vec::new();
        for ty in types {
            let stub = Arc::new(StubProvider::new(ty.clone(), stores.clone()));
            registry.register(stub.clone()).unwrap();
            stubs.push(stub);
        }
        (registry, stubs)
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates_and_keeps_order() {
        let (mut registry, _) = registry_with(&[ProviderType::GITHUB, ProviderType::GOOGLE]);
        let dup = Arc::new(StubProvider::new(
            ProviderType::GITHUB,
            registry.stores().clone(),
        ));
        assert!(registry.register(dup).is_err());
        assert_eq!(
            registry.provider_types(),
            vec![ProviderType::GITHUB, ProviderType::GOOGLE]
        );
        assert!(registry.get_by_name("GitHub").is_some());
        assert!(registry.get(&ProviderType::MICROSOFT).is_none());
    }

    #[tokio::test]
    async fn test_register_rejects_names_that_break_namespacing() {
        let (mut registry, _) = registry_with(&[]);
        for name in ["acme:corp", "login"] {
            let provider = Arc::new(StubProvider::new(
                ProviderType::new(name),
                registry.stores().clone(),
            ));
            assert!(registry.register(provider).is_err(), "{name}");
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_stale_entry_under_first_provider_does_not_shadow_second() {
        let (registry, _) = registry_with(&[ProviderType::GITHUB, ProviderType::GOOGLE]);
        let ttl = std::time::Duration::from_secs(60);
        let verifiers = &registry.stores().verifiers;

        // leftover from a failed GitHub flow
        verifiers
            .set(&namespaced_key(&ProviderType::GITHUB, "code123"), &verifier("stale"), ttl)
            .await
            .unwrap();
        // fresh Google flow
        verifiers
            .set(&namespaced_key(&ProviderType::GOOGLE, "codeXYZ"), &verifier("fresh"), ttl)
            .await
            .unwrap();

        let provider = registry.find_provider_for_code("codeXYZ").await.unwrap().unwrap();
        assert_eq!(provider.provider_type(), &ProviderType::GOOGLE);
        assert_eq!(
            provider.get_stored_code_verifier("codeXYZ").await.unwrap().as_deref(),
            Some("fresh")
        );

        let github = registry.get(&ProviderType::GITHUB).unwrap();
        assert_eq!(
            github.get_stored_code_verifier("code123").await.unwrap().as_deref(),
            Some("stale")
        );
        assert!(!github.has_stored_code_for_provider("codeXYZ").await.unwrap());
    }

    #[tokio::test]
    async fn test_same_code_under_two_providers_is_independent() {
        let (registry, _) = registry_with(&[ProviderType::GITHUB, ProviderType::GOOGLE]);
        let ttl = std::time::Duration::from_secs(60);
        let verifiers = &registry.stores().verifiers;
        verifiers
            .set(&namespaced_key(&ProviderType::GITHUB, "C"), &verifier("gh"), ttl)
            .await
            .unwrap();
        verifiers
            .set(&namespaced_key(&ProviderType::GOOGLE, "C"), &verifier("g"), ttl)
            .await
            .unwrap();

        let github = registry.get(&ProviderType::GITHUB).unwrap();
        let google = registry.get(&ProviderType::GOOGLE).unwrap();
        assert_eq!(github.get_stored_code_verifier("C").await.unwrap().as_deref(), Some("gh"));
        assert_eq!(google.get_stored_code_verifier("C").await.unwrap().as_deref(), Some("g"));

        verifiers
            .delete(&namespaced_key(&ProviderType::GITHUB, "C"))
            .await
            .unwrap();
        assert!(!github.has_stored_code_for_provider("C").await.unwrap());
        assert!(google.has_stored_code_for_provider("C").await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_routes_to_owner_without_remote_calls() {
        let (registry, stubs) = registry_with(&[ProviderType::GITHUB, ProviderType::GOOGLE]);
        registry
            .stores()
            .tokens
            .set(&record(&ProviderType::GOOGLE, "tok"), std::time::Duration::from_secs(60))
            .await
            .unwrap();

        let info = registry.verify_access_token("tok").await.unwrap();
        assert_eq!(info.provider, ProviderType::GOOGLE);
        assert_eq!(stubs[0].remote_calls.load(Ordering::SeqCst), 0);
        assert_eq!(stubs[1].remote_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_token_with_several_providers_calls_no_idp() {
        let (registry, stubs) = registry_with(&[ProviderType::GITHUB, ProviderType::GOOGLE]);

        let err = registry.verify_access_token("stolen").await.unwrap_err();
        assert_eq!(err.oauth_error_code(), "invalid_token");
        assert!(!err.to_string().contains("github"));
        assert!(!err.to_string().contains("google"));
        for stub in &stubs {
            assert_eq!(stub.remote_calls.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn test_unknown_token_with_single_provider_asks_it_once() {
        let (registry, stubs) = registry_with(&[ProviderType::GITHUB]);
        assert!(registry.verify_access_token("opaque").await.is_err());
        assert_eq!(stubs[0].remote_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exchange_and_refresh_routing() {
        let (registry, _) = registry_with(&[ProviderType::GITHUB, ProviderType::GOOGLE]);
        registry
            .stores()
            .verifiers
            .set(
                &namespaced_key(&ProviderType::GOOGLE, "abc"),
                &verifier("v"),
                std::time::Duration::from_secs(60),
            )
            .await
            .unwrap();

        let record = registry
            .exchange_code(CodeExchangeRequest {
                code: "abc".into(),
                code_verifier: None,
            })
            .await
            .unwrap();
        assert_eq!(record.provider_type, ProviderType::GOOGLE);

        let err = registry
            .exchange_code(CodeExchangeRequest {
                code: "nope".into(),
                code_verifier: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.oauth_error_code(), "invalid_grant");

        let err = registry.refresh_token("unknown").await.unwrap_err();
        assert_eq!(err.oauth_error_code(), "invalid_grant");
    }

    #[tokio::test]
    async fn test_revoke_unknown_token_is_ok() {
        let (registry, _) = registry_with(&[ProviderType::GITHUB]);
        registry
            .stores()
            .tokens
            .set(&record(&ProviderType::GITHUB, "t"), std::time::Duration::from_secs(60))
            .await
            .unwrap();

        registry.revoke_token("t").await.unwrap();
        assert!(!registry.stores().tokens.has(&ProviderType::GITHUB, "t").await.unwrap());
        registry.revoke_token("never-issued").await.unwrap();
    }

    #[tokio::test]
    async fn test_dispose_all_aggregates_failures() {
        let stores = AuthStores::in_memory();
        let mut registry = ProviderRegistry::new(stores.clone(), AuthConfig::default());
        let mut failing_a = StubProvider::new(ProviderType::GITHUB, stores.clone());
        failing_a.fail_dispose = true;
        let healthy = Arc::new(StubProvider::new(ProviderType::GOOGLE, stores.clone()));
        let mut failing_b = StubProvider::new(ProviderType::MICROSOFT, stores.clone());
        failing_b.fail_dispose = true;

        registry.register(Arc::new(failing_a)).unwrap();
        registry.register(healthy.clone()).unwrap();
        registry.register(Arc::new(failing_b)).unwrap();

        let err = registry.dispose_all().await.unwrap_err();
        assert_eq!(err.failures.len(), 2);
        assert_eq!(healthy.disposed.load(Ordering::SeqCst), 1);
        assert!(err.to_string().starts_with("failed to dispose 2 provider(s)"));
        assert!(err.to_string().contains("microsoft"));
    }

    #[tokio::test]
    async fn test_create_all_from_environment_skips_missing_credentials() {
        let env = ProviderEnvironment::from_pairs([
            ("GITHUB_CLIENT_ID", "gh"),
            ("GITHUB_CLIENT_SECRET", "secret"),
            ("GOOGLE_CLIENT_ID", "only-id"),
            ("MICROSOFT_CLIENT_ID", "ms"),
            ("MICROSOFT_CLIENT_SECRET", "secret"),
        ]);
        let mut registry = ProviderRegistry::new(AuthStores::in_memory(), AuthConfig::default());

        let registered = registry.create_all_from_environment(&env).await;
        assert_eq!(registered, 2);
        assert_eq!(
            registry.provider_types(),
            vec![ProviderType::GITHUB, ProviderType::MICROSOFT]
        );
    }
}
