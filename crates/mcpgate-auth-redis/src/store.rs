use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool};
use redis::AsyncCommands;
use serde::Serialize;
use serde::de::DeserializeOwned;

use mcpgate_auth::AuthResult;
use mcpgate_auth::storage::{
    AuthStores, PreAuthSessionStorage, SessionMetadataStorage, TokenStorage, VerifierStorage,
    namespaced_key,
};
use mcpgate_auth::types::{
    PreAuthSession, ProviderType, SessionMetadata, TokenRecord, VerifierEntry,
};

use crate::StorageError;

/// Pool and root prefix shared by the four stores.
#[derive(Clone)]
struct RedisBackend {
    pool: Pool,
    prefix: Arc<str>,
}

/// `SET EX` needs at least one second.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

impl RedisBackend {
    fn key(&self, kind: &str, id: &str) -> String {
        format!("{}{}:{}", self.prefix, kind, id)
    }

    async fn conn(&self) -> Result<Connection, StorageError> {
        Ok(self.pool.get().await?)
    }

    async fn set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        let json = serde_json::to_string(value)?;
        let mut conn = self.conn().await?;
        let (): () = conn.set_ex(key, json, ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(key).await?;
        Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
    }

    /// `GETDEL`: at most one caller observes the value.
    async fn take_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = redis::cmd("GETDEL").arg(key).query_async(&mut conn).await?;
        Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
    }

    async fn delete(&self, keys: Vec<String>) -> Result<(), StorageError> {
        let mut conn = self.conn().await?;
        let (): () = conn.del(keys).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let mut conn = self.conn().await?;
        Ok(conn.exists(key).await?)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

// =============================================================================
// Verifiers
// =============================================================================

/// Redis-backed [`VerifierStorage`].
#[derive(Clone)]
pub struct RedisVerifierStore {
    backend: RedisBackend,
}

impl RedisVerifierStore {
    fn key(&self, key: &str) -> String {
        self.backend.key("verifier", key)
    }
}

#[async_trait]
impl VerifierStorage for RedisVerifierStore {
    async fn set(&self, key: &str, entry: &VerifierEntry, ttl: Duration) -> AuthResult<()> {
        Ok(self.backend.set_json(&self.key(key), entry, ttl).await?)
    }

    async fn get(&self, key: &str) -> AuthResult<Option<VerifierEntry>> {
        Ok(self.backend.get_json(&self.key(key)).await?)
    }

    async fn delete(&self, key: &str) -> AuthResult<()> {
        Ok(self.backend.delete(vec![self.key(key)]).await?)
    }

    async fn has(&self, key: &str) -> AuthResult<bool> {
        Ok(self.backend.exists(&self.key(key)).await?)
    }

    async fn cleanup_expired(&self) -> AuthResult<u64> {
        Ok(0)
    }
}

// =============================================================================
// Pre-auth sessions
// =============================================================================

/// Redis-backed [`PreAuthSessionStorage`].
#[derive(Clone)]
pub struct RedisPreAuthSessionStore {
    backend: RedisBackend,
}

impl RedisPreAuthSessionStore {
    fn key(&self, state: &str) -> String {
        self.backend.key("preauth", state)
    }
}

#[async_trait]
impl PreAuthSessionStorage for RedisPreAuthSessionStore {
    async fn set(&self, session: &PreAuthSession, ttl: Duration) -> AuthResult<()> {
        Ok(self
            .backend
            .set_json(&self.key(&session.state), session, ttl)
            .await?)
    }

    async fn get(&self, state: &str) -> AuthResult<Option<PreAuthSession>> {
        Ok(self.backend.get_json(&self.key(state)).await?)
    }

    async fn take(&self, state: &str) -> AuthResult<Option<PreAuthSession>> {
        Ok(self.backend.take_json(&self.key(state)).await?)
    }

    async fn delete(&self, state: &str) -> AuthResult<()> {
        Ok(self.backend.delete(vec![self.key(state)]).await?)
    }

    async fn cleanup_expired(&self) -> AuthResult<u64> {
        Ok(0)
    }
}

// =============================================================================
// Tokens
// =============================================================================

/// Redis-backed [`TokenStorage`] with a refresh-token index.
#[derive(Clone)]
pub struct RedisTokenStore {
    backend: RedisBackend,
}

impl RedisTokenStore {
    fn token_key(&self, provider: &ProviderType, access_token: &str) -> String {
        self.backend
            .key("token", &namespaced_key(provider, access_token))
    }

    fn refresh_key(&self, provider: &ProviderType, refresh_token: &str) -> String {
        self.backend
            .key("refresh", &namespaced_key(provider, refresh_token))
    }
}

#[async_trait]
impl TokenStorage for RedisTokenStore {
    async fn set(&self, record: &TokenRecord, ttl: Duration) -> AuthResult<()> {
        let json = serde_json::to_string(record).map_err(StorageError::from)?;
        let secs = ttl_secs(ttl);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .set_ex(
                self.token_key(&record.provider_type, &record.access_token),
                json,
                secs,
            )
            .ignore();
        if let Some(refresh_token) = &record.refresh_token {
            pipe.set_ex(
                self.refresh_key(&record.provider_type, refresh_token),
                &record.access_token,
                secs,
            )
            .ignore();
        }

        let mut conn = self.backend.conn().await?;
        let (): () = pipe
            .query_async(&mut conn)
            .await
            .map_err(StorageError::from)?;
        Ok(())
    }

    async fn get(
        &self,
        provider: &ProviderType,
        access_token: &str,
    ) -> AuthResult<Option<TokenRecord>> {
        Ok(self
            .backend
            .get_json(&self.token_key(provider, access_token))
            .await?)
    }

    async fn has(&self, provider: &ProviderType, access_token: &str) -> AuthResult<bool> {
        Ok(self
            .backend
            .exists(&self.token_key(provider, access_token))
            .await?)
    }

    async fn delete(&self, provider: &ProviderType, access_token: &str) -> AuthResult<()> {
        let mut keys = vec![self.token_key(provider, access_token)];
        if let Some(record) = self.get(provider, access_token).await?
            && let Some(refresh_token) = &record.refresh_token
        {
            keys.push(self.refresh_key(provider, refresh_token));
        }
        Ok(self.backend.delete(keys).await?)
    }

    async fn find_by_refresh_token(
        &self,
        provider: &ProviderType,
        refresh_token: &str,
    ) -> AuthResult<Option<TokenRecord>> {
        let index = self.refresh_key(provider, refresh_token);
        let access_token: Option<String> = {
            let mut conn = self.backend.conn().await?;
            conn.get(&index).await.map_err(StorageError::from)?
        };
        let Some(access_token) = access_token else {
            return Ok(None);
        };

        let record = self.get(provider, &access_token).await?;
        if record.is_none() {
            tracing::debug!(provider = %provider, "dropping stale refresh index entry");
            self.backend.delete(vec![index]).await?;
        }
        Ok(record)
    }

    async fn cleanup_expired(&self) -> AuthResult<u64> {
        Ok(0)
    }
}

// =============================================================================
// Session metadata
// =============================================================================

/// Redis-backed [`SessionMetadataStorage`].
#[derive(Clone)]
pub struct RedisSessionMetadataStore {
    backend: RedisBackend,
}

impl RedisSessionMetadataStore {
    fn key(&self, session_id: &str) -> String {
        self.backend.key("session", session_id)
    }
}

#[async_trait]
impl SessionMetadataStorage for RedisSessionMetadataStore {
    async fn set(&self, metadata: &SessionMetadata, ttl: Duration) -> AuthResult<()> {
        Ok(self
            .backend
            .set_json(&self.key(&metadata.session_id), metadata, ttl)
            .await?)
    }

    async fn get(&self, session_id: &str) -> AuthResult<Option<SessionMetadata>> {
        Ok(self.backend.get_json(&self.key(session_id)).await?)
    }

    async fn delete(&self, session_id: &str) -> AuthResult<()> {
        Ok(self.backend.delete(vec![self.key(session_id)]).await?)
    }

    async fn cleanup_expired(&self) -> AuthResult<u64> {
        Ok(0)
    }

    async fn health_check(&self) -> AuthResult<()> {
        Ok(self.backend.ping().await?)
    }
}

// =============================================================================
// Bundle
// =============================================================================

/// The four Redis stores over one pool.
#[derive(Clone)]
pub struct RedisStores {
    pub verifiers: RedisVerifierStore,
    pub pre_auth_sessions: RedisPreAuthSessionStore,
    pub tokens: RedisTokenStore,
    pub session_metadata: RedisSessionMetadataStore,
}

impl RedisStores {
    /// Creates the stores. `prefix` is prepended verbatim to every key, so
    /// it normally ends with `:`.
    pub fn new(pool: Pool, prefix: impl Into<String>) -> Self {
        let backend = RedisBackend {
            pool,
            prefix: Arc::from(prefix.into()),
        };
        Self {
            verifiers: RedisVerifierStore {
                backend: backend.clone(),
            },
            pre_auth_sessions: RedisPreAuthSessionStore {
                backend: backend.clone(),
            },
            tokens: RedisTokenStore {
                backend: backend.clone(),
            },
            session_metadata: RedisSessionMetadataStore { backend },
        }
    }

    /// Round-trips a `PING`.
    ///
    /// # Errors
    ///
    /// Returns an error if no connection can be obtained or Redis does not
    /// answer.
    pub async fn ping(&self) -> Result<(), StorageError> {
        self.session_metadata.backend.ping().await
    }

    /// Type-erased handles for the provider registry.
    #[must_use]
    pub fn into_auth_stores(self) -> AuthStores {
        AuthStores {
            verifiers: Arc::new(self.verifiers),
            pre_auth_sessions: Arc::new(self.pre_auth_sessions),
            tokens: Arc::new(self.tokens),
            session_metadata: Arc::new(self.session_metadata),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deadpool_redis::{Config, Runtime};

    fn stores(prefix: &str) -> RedisStores {
        // pools connect lazily
        let pool = Config::from_url("redis://127.0.0.1:1")
            .create_pool(Some(Runtime::Tokio1))
            .unwrap();
        RedisStores::new(pool, prefix)
    }

    #[tokio::test]
    async fn test_key_layout() {
        let stores = stores(crate::DEFAULT_KEY_PREFIX);
        assert_eq!(
            stores.verifiers.key(&namespaced_key(&ProviderType::GITHUB, "code123")),
            "mcpgate:verifier:github:code123"
        );
        assert_eq!(stores.pre_auth_sessions.key("st"), "mcpgate:preauth:st");
        assert_eq!(
            stores.tokens.token_key(&ProviderType::GOOGLE, "at"),
            "mcpgate:token:google:at"
        );
        assert_eq!(
            stores.tokens.refresh_key(&ProviderType::GOOGLE, "rt"),
            "mcpgate:refresh:google:rt"
        );
        assert_eq!(stores.session_metadata.key("s1"), "mcpgate:session:s1");
    }

    #[tokio::test]
    async fn test_custom_prefix_and_namespaces() {
        let stores = stores("tenant-a:");
        assert_eq!(stores.session_metadata.key("s1"), "tenant-a:session:s1");
        assert_ne!(
            stores.tokens.token_key(&ProviderType::GOOGLE, "same"),
            stores.tokens.token_key(&ProviderType::GITHUB, "same")
        );
    }

    #[test]
    fn test_ttl_secs_floor() {
        assert_eq!(ttl_secs(Duration::from_millis(200)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(600)), 600);
    }

    #[tokio::test]
    async fn test_unreachable_redis_is_storage_error() {
        let stores = stores(crate::DEFAULT_KEY_PREFIX).into_auth_stores();
        let err = stores.verifiers.has("github:code").await.unwrap_err();
        assert_eq!(err.oauth_error_code(), "server_error");
        assert!(err.is_retryable());
    }
}
