//! Storage traits for federated authentication state.
//!
//! Four stores are shared by every provider and every process instance:
//!
//! - [`VerifierStorage`] - PKCE material keyed by `{provider}:{code}`
//! - [`PreAuthSessionStorage`] - in-flight authorizations keyed by `state`
//! - [`TokenStorage`] - issued tokens, namespaced by provider
//! - [`SessionMetadataStorage`] - durable facts to rebuild protocol sessions
//!
//! Every operation is a single-key read or write. Deleting an absent key is
//! not an error. Expired entries behave as absent; callers must not rely on
//! exact expiry timing.
//!
//! # Implementations
//!
//! - [`memory`] - process-local `DashMap` stores (single instance, tests)
//! - `mcpgate-auth-redis` - Redis stores shared across instances

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::AuthResult;
use crate::types::{PreAuthSession, ProviderType, SessionMetadata, TokenRecord, VerifierEntry};

pub use memory::{
    MemoryPreAuthSessionStore, MemorySessionMetadataStore, MemoryTokenStore, MemoryVerifierStore,
};

/// Builds the namespaced key `{provider}:{value}`.
///
/// This is the only place shared-store keys are composed, so two providers
/// can never address the same entry even when their IdPs issue identical
/// opaque codes or tokens.
#[must_use]
pub fn namespaced_key(provider: &ProviderType, value: &str) -> String {
    format!("{}:{}", provider, value)
}

/// Storage for PKCE verifier entries.
///
/// Keys are produced by [`namespaced_key`] from the owning provider and the
/// authorization code. Entries are written once per code and deleted after
/// a successful exchange.
#[async_trait]
pub trait VerifierStorage: Send + Sync {
    /// Store an entry with a time-to-live.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    async fn set(&self, key: &str, entry: &VerifierEntry, ttl: Duration) -> AuthResult<()>;

    /// Get an entry, `None` if absent or expired.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    async fn get(&self, key: &str) -> AuthResult<Option<VerifierEntry>>;

    /// Delete an entry. Deleting an absent key succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    async fn delete(&self, key: &str) -> AuthResult<()>;

    /// Existence check against this store only.
    ///
    /// Never reaches an identity provider; provider routing depends on it.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    async fn has(&self, key: &str) -> AuthResult<bool>;

    /// Remove expired entries, returning how many were removed.
    ///
    /// Backends with native TTL return `Ok(0)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend operation fails.
    async fn cleanup_expired(&self) -> AuthResult<u64>;
}

/// Storage for pre-authorization sessions, keyed by `state`.
#[async_trait]
pub trait PreAuthSessionStorage: Send + Sync {
    /// Store a session under its `state`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    async fn set(&self, session: &PreAuthSession, ttl: Duration) -> AuthResult<()>;

    /// Get a session without consuming it.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    async fn get(&self, state: &str) -> AuthResult<Option<PreAuthSession>>;

    /// Atomically get and delete a session.
    ///
    /// Of two concurrent callers presenting the same `state`, at most one
    /// receives the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend operation fails.
    async fn take(&self, state: &str) -> AuthResult<Option<PreAuthSession>>;

    /// Delete a session. Deleting an absent key succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    async fn delete(&self, state: &str) -> AuthResult<()>;

    /// Remove expired sessions, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend operation fails.
    async fn cleanup_expired(&self) -> AuthResult<u64>;
}

/// Storage for issued tokens.
///
/// Records are keyed by `{provider}:{access_token}`; a record carrying a
/// refresh token is also reachable through `{provider}:{refresh_token}` so
/// the refresh grant can be routed without contacting any IdP.
#[async_trait]
pub trait TokenStorage: Send + Sync {
    /// Store a record under its provider and access token.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    async fn set(&self, record: &TokenRecord, ttl: Duration) -> AuthResult<()>;

    /// Get a record by access token.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    async fn get(&self, provider: &ProviderType, access_token: &str)
    -> AuthResult<Option<TokenRecord>>;

    /// Local existence check for an access token.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    async fn has(&self, provider: &ProviderType, access_token: &str) -> AuthResult<bool>;

    /// Delete a record and its refresh-token index.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    async fn delete(&self, provider: &ProviderType, access_token: &str) -> AuthResult<()>;

    /// Find a record by refresh token.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    async fn find_by_refresh_token(
        &self,
        provider: &ProviderType,
        refresh_token: &str,
    ) -> AuthResult<Option<TokenRecord>>;

    /// Remove expired records, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend operation fails.
    async fn cleanup_expired(&self) -> AuthResult<u64>;
}

/// Storage for protocol session metadata, keyed by session id.
///
/// This is the only state needed to rebuild a live session on an instance
/// that did not create it.
#[async_trait]
pub trait SessionMetadataStorage: Send + Sync {
    /// Store (or re-store) metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    async fn set(&self, metadata: &SessionMetadata, ttl: Duration) -> AuthResult<()>;

    /// Get metadata, `None` if absent or expired.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    async fn get(&self, session_id: &str) -> AuthResult<Option<SessionMetadata>>;

    /// Delete metadata. Deleting an absent key succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    async fn delete(&self, session_id: &str) -> AuthResult<()>;

    /// Remove expired metadata, returning how many entries were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend operation fails.
    async fn cleanup_expired(&self) -> AuthResult<u64>;

    /// Check that the backend is reachable.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached.
    async fn health_check(&self) -> AuthResult<()> {
        Ok(())
    }
}

/// The four shared stores, as owned by the provider registry.
#[derive(Clone)]
pub struct AuthStores {
    pub verifiers: Arc<dyn VerifierStorage>,
    pub pre_auth_sessions: Arc<dyn PreAuthSessionStorage>,
    pub tokens: Arc<dyn TokenStorage>,
    pub session_metadata: Arc<dyn SessionMetadataStorage>,
}

impl AuthStores {
    /// Process-local stores.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            verifiers: Arc::new(MemoryVerifierStore::new()),
            pre_auth_sessions: Arc::new(MemoryPreAuthSessionStore::new()),
            tokens: Arc::new(MemoryTokenStore::new()),
            session_metadata: Arc::new(MemorySessionMetadataStore::new()),
        }
    }

    /// Run `cleanup_expired` on every store, returning the total removed.
    ///
    /// # Errors
    ///
    /// Returns the first backend error encountered.
    pub async fn cleanup_expired(&self) -> AuthResult<u64> {
        let mut removed = self.verifiers.cleanup_expired().await?;
        removed += self.pre_auth_sessions.cleanup_expired().await?;
        removed += self.tokens.cleanup_expired().await?;
        removed += self.session_metadata.cleanup_expired().await?;
        Ok(removed)
    }

    /// Start a background purge of expired entries every `period`.
    ///
    /// Abandoned `state` values and verifiers whose code is never redeemed
    /// are not read again, so without this they stay resident in backends
    /// that expire lazily.
    pub fn start_cleanup_task(self, period: Duration) -> tokio::task::JoinHandle<()> {
        let period = period.max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                interval.tick().await;
                match self.cleanup_expired().await {
                    Ok(0) => {}
                    Ok(removed) => tracing::debug!(removed, "expired auth entries purged"),
                    Err(e) => tracing::warn!(error = %e, "auth store cleanup failed"),
                }
            }
        })
    }
}

impl std::fmt::Debug for AuthStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthStores").finish_non_exhaustive()
    }
}
