//! Provider construction, keyed by provider type.
//!
//! [`ProviderFactories`] maps a [`ProviderType`] to the [`ProviderFactory`]
//! that builds it. Types without an entry use the fallback, which treats the
//! configuration as a generic OpenID Connect issuer. A new backend registers
//! its own factory instead of editing a central `match`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::AuthResult;
use crate::config::{AuthConfig, ProviderConfig};
use crate::error::AuthError;
use crate::storage::AuthStores;
use crate::types::ProviderType;

use super::{
    FederatedProvider, FlowSettings, GitHubBackend, GoogleBackend, IdentityBackend,
    MicrosoftBackend, OAuthProvider, OidcBackend,
};

/// Builds one kind of provider from its configuration.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn build(
        &self,
        config: &ProviderConfig,
        auth: &AuthConfig,
        stores: AuthStores,
    ) -> AuthResult<Arc<dyn OAuthProvider>>;
}

/// Shareable factory instance.
pub type DynProviderFactory = Arc<dyn ProviderFactory>;

fn invalid(provider: &ProviderType, e: &dyn fmt::Display) -> AuthError {
    AuthError::configuration(format!("{provider}: {e}"))
}

fn federate<B: IdentityBackend>(
    backend: B,
    config: &ProviderConfig,
    auth: &AuthConfig,
    stores: AuthStores,
) -> AuthResult<Arc<dyn OAuthProvider>> {
    let settings = FlowSettings::from_config(auth, &config.provider_type);
    Ok(Arc::new(FederatedProvider::new(backend, config, settings, stores)?))
}

/// Backend with built-in endpoint presets and a synchronous constructor.
pub struct PresetFactory<B> {
    make: fn(&ProviderConfig) -> Result<B, url::ParseError>,
}

impl<B> PresetFactory<B> {
    #[must_use]
    pub const fn new(make: fn(&ProviderConfig) -> Result<B, url::ParseError>) -> Self {
        Self { make }
    }
}

#[async_trait]
impl<B: IdentityBackend> ProviderFactory for PresetFactory<B> {
    async fn build(
        &self,
        config: &ProviderConfig,
        auth: &AuthConfig,
        stores: AuthStores,
    ) -> AuthResult<Arc<dyn OAuthProvider>> {
        let backend = (self.make)(config).map_err(|e| invalid(&config.provider_type, &e))?;
        federate(backend, config, auth, stores)
    }
}

/// Generic OIDC issuer, resolved through discovery when endpoints are not
/// configured explicitly.
#[derive(Debug, Default, Clone, Copy)]
pub struct OidcFactory;

#[async_trait]
impl ProviderFactory for OidcFactory {
    async fn build(
        &self,
        config: &ProviderConfig,
        auth: &AuthConfig,
        stores: AuthStores,
    ) -> AuthResult<Arc<dyn OAuthProvider>> {
        let http = reqwest::Client::builder()
            .timeout(auth.request_timeout)
            .build()
            .map_err(|e| invalid(&config.provider_type, &e))?;
        let backend = OidcBackend::discover(config, &http, auth.allow_http)
            .await
            .map_err(|e| invalid(&config.provider_type, &e))?;
        federate(backend, config, auth, stores)
    }
}

/// Constructor table used by the registry.
#[derive(Clone)]
pub struct ProviderFactories {
    by_type: HashMap<ProviderType, DynProviderFactory>,
    fallback: DynProviderFactory,
}

impl ProviderFactories {
    /// A table with no typed entries; every type uses `fallback`.
    #[must_use]
    pub fn empty(fallback: DynProviderFactory) -> Self {
        Self {
            by_type: HashMap::new(),
            fallback,
        }
    }

    /// Registers (or replaces) the factory for `provider_type`.
    pub fn register(&mut self, provider_type: ProviderType, factory: DynProviderFactory) {
        self.by_type.insert(provider_type, factory);
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, provider_type: ProviderType, factory: DynProviderFactory) -> Self {
        self.register(provider_type, factory);
        self
    }

    /// The factory responsible for `provider_type`.
    #[must_use]
    pub fn get(&self, provider_type: &ProviderType) -> &DynProviderFactory {
        self.by_type.get(provider_type).unwrap_or(&self.fallback)
    }

    /// Builds the provider described by `config`.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Configuration` if endpoints are invalid or OIDC
    /// discovery fails.
    pub async fn build(
        &self,
        config: &ProviderConfig,
        auth: &AuthConfig,
        stores: AuthStores,
    ) -> AuthResult<Arc<dyn OAuthProvider>> {
        self.get(&config.provider_type)
            .build(config, auth, stores)
            .await
    }
}

impl Default for ProviderFactories {
    /// `google`, `github` and `microsoft` presets; OIDC for everything else.
    fn default() -> Self {
        Self::empty(Arc::new(OidcFactory))
            .with(
                ProviderType::GOOGLE,
                Arc::new(PresetFactory::new(GoogleBackend::new)),
            )
            .with(
                ProviderType::GITHUB,
                Arc::new(PresetFactory::new(GitHubBackend::new)),
            )
            .with(
                ProviderType::MICROSOFT,
                Arc::new(PresetFactory::new(MicrosoftBackend::new)),
            )
    }
}

impl fmt::Debug for ProviderFactories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.by_type.keys().map(ProviderType::as_str).collect();
        types.sort_unstable();
        f.debug_struct("ProviderFactories")
            .field("types", &types)
            .finish_non_exhaustive()
    }
}
