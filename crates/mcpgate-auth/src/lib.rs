//! # mcpgate-auth
//!
//! Multi-provider OAuth 2.1 federation for MCP servers that run as many
//! stateless instances over shared stores.
//!
//! This crate provides:
//! - PKCE (S256) authorization-code flows against Google, GitHub,
//!   Microsoft and any OpenID Connect issuer
//! - Provider-namespaced verifier, pre-auth session, token and session
//!   metadata stores, with in-memory implementations
//! - A provider registry that routes codes and tokens to the provider that
//!   issued them, using local store lookups only
//! - Axum handlers for the OAuth surface and a bearer-token extractor
//!
//! ## Modules
//!
//! - [`config`] - Flow timings and provider configuration
//! - [`error`] - Error taxonomy
//! - [`pkce`] - PKCE verifier and challenge types
//! - [`types`] - Data model shared with the stores
//! - [`storage`] - Store traits and in-memory stores
//! - [`provider`] - The provider interface and its implementations
//! - [`registry`] - Provider registry and routing
//! - [`http`] - Axum HTTP handlers

pub mod config;
pub mod error;
pub mod http;
pub mod pkce;
pub mod provider;
pub mod registry;
pub mod storage;
pub mod types;

pub use config::{AuthConfig, ConfigError, ProviderConfig, ProviderEnvironment};
pub use error::{AuthError, ErrorCategory};
pub use http::{AuthHttpState, BearerAuth, BearerRejection, authenticate_bearer};
pub use provider::{
    AuthorizationRedirect, AuthorizationRequest, CallbackOutcome, CallbackParams,
    CodeExchangeRequest, FederatedProvider, IdentityBackend, OAuthProvider, ProviderFactories,
    ProviderFactory,
};
pub use registry::{DisposeError, ProviderRegistry};
pub use storage::{
    AuthStores, PreAuthSessionStorage, SessionMetadataStorage, TokenStorage, VerifierStorage,
    namespaced_key,
};
pub use types::{
    AuthInfo, PreAuthSession, ProviderType, SessionAuthInfo, SessionMetadata, TokenRecord,
    TokenResponse, UserInfo, VerifierEntry,
};

/// Type alias for authentication results.
pub type AuthResult<T> = Result<T, AuthError>;
