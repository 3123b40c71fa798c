//! Process-local store implementations.
//!
//! Entries live in a `DashMap` next to their deadline. Expired entries are
//! treated as absent and removed lazily on access, or eagerly by
//! `cleanup_expired`. These stores are not shared between processes; use
//! them for single-instance deployments and tests.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{
    PreAuthSessionStorage, SessionMetadataStorage, TokenStorage, VerifierStorage, namespaced_key,
};
use crate::AuthResult;
use crate::types::{PreAuthSession, ProviderType, SessionMetadata, TokenRecord, VerifierEntry};

#[derive(Debug, Clone)]
struct Expiring<V> {
    value: V,
    deadline: Instant,
}

impl<V> Expiring<V> {
    fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            deadline: Instant::now() + ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// Key/value map with per-entry deadlines.
#[derive(Debug)]
struct TtlMap<V> {
    entries: DashMap<String, Expiring<V>>,
}

impl<V: Clone> TtlMap<V> {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    fn insert(&self, key: String, value: V, ttl: Duration) {
        self.entries.insert(key, Expiring::new(value, ttl));
    }

    fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let hit = self.entries.get(key).map(|e| (e.is_expired(now), e.value.clone()));
        match hit {
            Some((false, value)) => Some(value),
            Some((true, _)) => {
                self.entries.remove_if(key, |_, e| e.is_expired(now));
                None
            }
            None => None,
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    fn take(&self, key: &str) -> Option<V> {
        let (_, entry) = self.entries.remove(key)?;
        (!entry.is_expired(Instant::now())).then_some(entry.value)
    }

    fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    fn purge_expired(&self) -> u64 {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before.saturating_sub(self.entries.len()) as u64
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// =============================================================================
// Verifier store
// =============================================================================

/// In-memory [`VerifierStorage`].
#[derive(Debug)]
pub struct MemoryVerifierStore {
    map: TtlMap<VerifierEntry>,
}

impl MemoryVerifierStore {
    #[must_use]
    pub fn new() -> Self {
        Self { map: TtlMap::new() }
    }

    /// Number of entries, including not yet purged expired ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryVerifierStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VerifierStorage for MemoryVerifierStore {
    async fn set(&self, key: &str, entry: &VerifierEntry, ttl: Duration) -> AuthResult<()> {
        self.map.insert(key.to_string(), entry.clone(), ttl);
        Ok(())
    }

    async fn get(&self, key: &str) -> AuthResult<Option<VerifierEntry>> {
        Ok(self.map.get(key))
    }

    async fn delete(&self, key: &str) -> AuthResult<()> {
        self.map.remove(key);
        Ok(())
    }

    async fn has(&self, key: &str) -> AuthResult<bool> {
        Ok(self.map.contains(key))
    }

    async fn cleanup_expired(&self) -> AuthResult<u64> {
        Ok(self.map.purge_expired())
    }
}

// =============================================================================
// Pre-auth session store
// =============================================================================

/// In-memory [`PreAuthSessionStorage`].
#[derive(Debug)]
pub struct MemoryPreAuthSessionStore {
    map: TtlMap<PreAuthSession>,
}

impl MemoryPreAuthSessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self { map: TtlMap::new() }
    }
}

impl Default for MemoryPreAuthSessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PreAuthSessionStorage for MemoryPreAuthSessionStore {
    async fn set(&self, session: &PreAuthSession, ttl: Duration) -> AuthResult<()> {
        self.map.insert(session.state.clone(), session.clone(), ttl);
        Ok(())
    }

    async fn get(&self, state: &str) -> AuthResult<Option<PreAuthSession>> {
        Ok(self.map.get(state))
    }

    async fn take(&self, state: &str) -> AuthResult<Option<PreAuthSession>> {
        Ok(self.map.take(state))
    }

    async fn delete(&self, state: &str) -> AuthResult<()> {
        self.map.remove(state);
        Ok(())
    }

    async fn cleanup_expired(&self) -> AuthResult<u64> {
        Ok(self.map.purge_expired())
    }
}

// =============================================================================
// Token store
// =============================================================================

/// In-memory [`TokenStorage`] with a refresh-token index.
#[derive(Debug)]
pub struct MemoryTokenStore {
    records: TtlMap<TokenRecord>,
    // namespaced refresh token -> namespaced access token
    refresh_index: TtlMap<String>,
}

impl MemoryTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: TtlMap::new(),
            refresh_index: TtlMap::new(),
        }
    }
}

impl Default for MemoryTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenStorage for MemoryTokenStore {
    async fn set(&self, record: &TokenRecord, ttl: Duration) -> AuthResult<()> {
        let key = namespaced_key(&record.provider_type, &record.access_token);
        if let Some(refresh_token) = &record.refresh_token {
            self.refresh_index.insert(
                namespaced_key(&record.provider_type, refresh_token),
                key.clone(),
                ttl,
            );
        }
        self.records.insert(key, record.clone(), ttl);
        Ok(())
    }

    async fn get(
        &self,
        provider: &ProviderType,
        access_token: &str,
    ) -> AuthResult<Option<TokenRecord>> {
        Ok(self.records.get(&namespaced_key(provider, access_token)))
    }

    async fn has(&self, provider: &ProviderType, access_token: &str) -> AuthResult<bool> {
        Ok(self.records.contains(&namespaced_key(provider, access_token)))
    }

    async fn delete(&self, provider: &ProviderType, access_token: &str) -> AuthResult<()> {
        if let Some(record) = self.records.take(&namespaced_key(provider, access_token))
            && let Some(refresh_token) = &record.refresh_token
        {
            self.refresh_index.remove(&namespaced_key(provider, refresh_token));
        }
        Ok(())
    }

    async fn find_by_refresh_token(
        &self,
        provider: &ProviderType,
        refresh_token: &str,
    ) -> AuthResult<Option<TokenRecord>> {
        let Some(access_key) = self.refresh_index.get(&namespaced_key(provider, refresh_token))
        else {
            return Ok(None);
        };
        Ok(self.records.get(&access_key))
    }

    async fn cleanup_expired(&self) -> AuthResult<u64> {
        self.refresh_index.purge_expired();
        Ok(self.records.purge_expired())
    }
}

// =============================================================================
// Session metadata store
// =============================================================================

/// In-memory [`SessionMetadataStorage`].
#[derive(Debug)]
pub struct MemorySessionMetadataStore {
    map: TtlMap<SessionMetadata>,
}

impl MemorySessionMetadataStore {
    #[must_use]
    pub fn new() -> Self {
        Self { map: TtlMap::new() }
    }
}

impl Default for MemorySessionMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionMetadataStorage for MemorySessionMetadataStore {
    async fn set(&self, metadata: &SessionMetadata, ttl: Duration) -> AuthResult<()> {
        self.map.insert(metadata.session_id.clone(), metadata.clone(), ttl);
        Ok(())
    }

    async fn get(&self, session_id: &str) -> AuthResult<Option<SessionMetadata>> {
        Ok(self.map.get(session_id))
    }

    async fn delete(&self, session_id: &str) -> AuthResult<()> {
        self.map.remove(session_id);
        Ok(())
    }

    async fn cleanup_expired(&self) -> AuthResult<u64> {
        Ok(self.map.purge_expired())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UserInfo;
    use time::OffsetDateTime;

    fn verifier(state: &str) -> VerifierEntry {
        VerifierEntry {
            code_verifier: Some("v".repeat(43)),
            code_challenge: "challenge".to_string(),
            state: state.to_string(),
        }
    }

    fn pre_auth(state: &str) -> PreAuthSession {
        let now = OffsetDateTime::now_utc();
        PreAuthSession {
            state: state.to_string(),
            code_verifier: None,
            code_challenge: "challenge".to_string(),
            redirect_uri: "http://localhost:3000/auth/github/callback".to_string(),
            client_redirect_uri: None,
            client_state: None,
            scopes: vec![],
            provider_type: ProviderType::GITHUB,
            created_at: now,
            expires_at: now + time::Duration::minutes(10),
        }
    }

    fn token(provider: ProviderType, access: &str, refresh: Option<&str>) -> TokenRecord {
        TokenRecord {
            access_token: access.to_string(),
            refresh_token: refresh.map(str::to_string),
            id_token: None,
            expires_at: OffsetDateTime::now_utc() + time::Duration::hours(1),
            user_info: UserInfo {
                sub: "u1".to_string(),
                email: None,
                name: None,
                provider: provider.clone(),
            },
            provider_type: provider,
            scopes: vec![],
        }
    }

    #[tokio::test]
    async fn test_verifier_namespacing_keeps_entries_independent() {
        let store = MemoryVerifierStore::new();
        let ttl = Duration::from_secs(60);
        let a = namespaced_key(&ProviderType::GITHUB, "same-code");
        let b = namespaced_key(&ProviderType::GOOGLE, "same-code");

        store.set(&a, &verifier("state-a"), ttl).await.unwrap();
        assert!(store.has(&a).await.unwrap());
        assert!(!store.has(&b).await.unwrap());

        store.set(&b, &verifier("state-b"), ttl).await.unwrap();
        assert_eq!(store.get(&a).await.unwrap().unwrap().state, "state-a");
        assert_eq!(store.get(&b).await.unwrap().unwrap().state, "state-b");

        store.delete(&a).await.unwrap();
        store.delete(&a).await.unwrap();
        assert!(store.get(&a).await.unwrap().is_none());
        assert!(store.has(&b).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_behave_as_absent() {
        let store = MemoryVerifierStore::new();
        store
            .set("github:c", &verifier("s"), Duration::from_secs(5))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;

        assert!(!store.has("github:c").await.unwrap());
        assert!(store.get("github:c").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_expired_counts_removed() {
        let store = MemoryVerifierStore::new();
        store
            .set("github:short", &verifier("s"), Duration::from_secs(1))
            .await
            .unwrap();
        store
            .set("github:long", &verifier("s"), Duration::from_secs(100))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.cleanup_expired().await.unwrap(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_pre_auth_take_is_single_use() {
        let store = MemoryPreAuthSessionStore::new();
        store
            .set(&pre_auth("st"), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(store.get("st").await.unwrap().is_some());
        assert!(store.take("st").await.unwrap().is_some());
        assert!(store.take("st").await.unwrap().is_none());
        assert!(store.get("st").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_token_store_refresh_index() {
        let store = MemoryTokenStore::new();
        let ttl = Duration::from_secs(60);
        store
            .set(&token(ProviderType::GOOGLE, "at-1", Some("rt-1")), ttl)
            .await
            .unwrap();

        assert!(store.has(&ProviderType::GOOGLE, "at-1").await.unwrap());
        assert!(!store.has(&ProviderType::GITHUB, "at-1").await.unwrap());

        let found = store
            .find_by_refresh_token(&ProviderType::GOOGLE, "rt-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.access_token, "at-1");
        assert!(
            store
                .find_by_refresh_token(&ProviderType::GITHUB, "rt-1")
                .await
                .unwrap()
                .is_none()
        );

        store.delete(&ProviderType::GOOGLE, "at-1").await.unwrap();
        assert!(
            store
                .find_by_refresh_token(&ProviderType::GOOGLE, "rt-1")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_session_metadata_store() {
        let store = MemorySessionMetadataStore::new();
        let meta = SessionMetadata::new("s1", None, Duration::from_secs(60));
        store.set(&meta, Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("s1").await.unwrap(), Some(meta));
        store.delete("s1").await.unwrap();
        assert!(store.get("s1").await.unwrap().is_none());
        assert!(store.health_check().await.is_ok());
    }
}
