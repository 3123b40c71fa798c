//! Session instance cache and reconstruction.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use mcpgate_auth::{SessionAuthInfo, SessionMetadata, SessionMetadataStorage};
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::{ProtocolServer, ProtocolServerFactory};
use super::transport::{SessionTransport, TransportOptions};
use super::{SessionConfig, SessionError};

/// A live transport plus protocol server bound to one session.
pub struct LiveInstance {
    transport: Arc<SessionTransport>,
    server: Arc<dyn ProtocolServer>,
    created_at: Instant,
    last_access: Mutex<Instant>,
}

impl LiveInstance {
    fn new(transport: Arc<SessionTransport>, server: Arc<dyn ProtocolServer>) -> Self {
        let now = Instant::now();
        Self {
            transport,
            server,
            created_at: now,
            last_access: Mutex::new(now),
        }
    }

    pub fn session_id(&self) -> &str {
        self.transport.session_id()
    }

    pub fn transport(&self) -> &Arc<SessionTransport> {
        &self.transport
    }

    pub fn server(&self) -> &Arc<dyn ProtocolServer> {
        &self.server
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_access.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }
}

impl fmt::Debug for LiveInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveInstance")
            .field("session_id", &self.session_id())
            .field("age", &self.age())
            .field("idle_for", &self.idle_for())
            .finish_non_exhaustive()
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub cached_instances: usize,
    pub oldest_entry_age: Option<Duration>,
    pub reconstructions: u64,
    pub cache_hits: u64,
}

/// Creates sessions and rebuilds live instances from shared metadata.
///
/// Within one process at most one reconstruction runs per session id:
/// concurrent callers for the same id share a single in-flight slot and
/// all receive the same [`LiveInstance`]. The instance is placed in the
/// cache before the slot is released, so a later caller either hits the
/// cache or joins the slot.
pub struct SessionManager {
    metadata: Arc<dyn SessionMetadataStorage>,
    factory: Arc<dyn ProtocolServerFactory>,
    config: SessionConfig,
    instances: DashMap<String, Arc<LiveInstance>>,
    in_flight: DashMap<String, Arc<OnceCell<Arc<LiveInstance>>>>,
    reconstructions: AtomicU64,
    cache_hits: AtomicU64,
}

impl SessionManager {
    pub fn new(
        metadata: Arc<dyn SessionMetadataStorage>,
        factory: Arc<dyn ProtocolServerFactory>,
        config: SessionConfig,
    ) -> Self {
        Self {
            metadata,
            factory,
            config,
            instances: DashMap::new(),
            in_flight: DashMap::new(),
            reconstructions: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Persists metadata for `session_id` with the configured lifetime.
    pub async fn store_session_metadata(
        &self,
        session_id: &str,
        auth_info: Option<SessionAuthInfo>,
    ) -> Result<SessionMetadata, SessionError> {
        let metadata = SessionMetadata::new(session_id, auth_info, self.config.metadata_ttl);
        self.metadata
            .set(&metadata, self.config.metadata_ttl)
            .await?;
        debug!(session_id, "stored session metadata");
        Ok(metadata)
    }

    /// Starts a new session: generates an id, persists its metadata and
    /// caches a fresh (not yet initialized) instance.
    pub async fn create_instance(
        &self,
        auth_info: Option<SessionAuthInfo>,
        options: Option<TransportOptions>,
    ) -> Result<Arc<LiveInstance>, SessionError> {
        let session_id = Uuid::new_v4().to_string();
        self.store_session_metadata(&session_id, auth_info.clone())
            .await?;

        let transport = Arc::new(SessionTransport::new(
            session_id.clone(),
            options.unwrap_or_else(|| self.config.transport.clone()),
            auth_info,
        ));
        let instance = match self.build(transport).await {
            Ok(instance) => instance,
            Err(e) => {
                if let Err(cleanup) = self.metadata.delete(&session_id).await {
                    warn!(session_id = %session_id, error = %cleanup, "failed to remove metadata of unbuilt session");
                }
                return Err(e);
            }
        };

        self.instances.insert(session_id.clone(), instance.clone());
        info!(session_id = %session_id, "session created");
        Ok(instance)
    }

    /// Returns the cached instance for `session_id`, rebuilding it from
    /// stored metadata when this process has none.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotFound`] / [`SessionError::Expired`] when no
    ///   live metadata exists
    /// - [`SessionError::Storage`] when the metadata store fails
    /// - [`SessionError::Transport`] when the protocol server cannot be built
    pub async fn get_or_recreate_instance(
        &self,
        session_id: &str,
        options: Option<TransportOptions>,
    ) -> Result<Arc<LiveInstance>, SessionError> {
        if let Some(instance) = self.cached(session_id) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(instance);
        }

        let slot = self
            .in_flight
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .value()
            .clone();

        let result = slot
            .get_or_try_init(|| self.reconstruct(session_id, options))
            .await
            .map(Arc::clone);

        self.in_flight
            .remove_if(session_id, |_, current| Arc::ptr_eq(current, &slot));
        result
    }

    async fn reconstruct(
        &self,
        session_id: &str,
        options: Option<TransportOptions>,
    ) -> Result<Arc<LiveInstance>, SessionError> {
        // A previous slot may have finished between the cache check and
        // this slot being created.
        if let Some(instance) = self.cached(session_id) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(instance);
        }

        let metadata = self
            .metadata
            .get(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound {
                session_id: session_id.to_string(),
            })?;

        if metadata.is_expired() {
            if let Err(e) = self.metadata.delete(session_id).await {
                warn!(session_id, error = %e, "failed to delete expired session metadata");
            }
            return Err(SessionError::Expired {
                session_id: session_id.to_string(),
            });
        }

        let provider = metadata.auth_info.as_ref().map(|a| a.provider.to_string());
        let transport = Arc::new(SessionTransport::restored(
            session_id,
            options.unwrap_or_else(|| self.config.transport.clone()),
            metadata.auth_info,
        ));
        let instance = self.build(transport).await?;

        self.instances
            .insert(session_id.to_string(), instance.clone());
        self.reconstructions.fetch_add(1, Ordering::Relaxed);
        info!(session_id, provider = ?provider, "session reconstructed from metadata");
        Ok(instance)
    }

    async fn build(
        &self,
        transport: Arc<SessionTransport>,
    ) -> Result<Arc<LiveInstance>, SessionError> {
        let server = self.factory.create(transport.clone()).await?;
        Ok(Arc::new(LiveInstance::new(transport, server)))
    }

    /// Cache lookup that drops an idle instance instead of returning it.
    fn cached(&self, session_id: &str) -> Option<Arc<LiveInstance>> {
        let instance = self.instances.get(session_id)?.value().clone();
        if self.is_instance_expired(&instance) {
            self.instances
                .remove_if(session_id, |_, current| Arc::ptr_eq(current, &instance));
            debug!(session_id, "dropped idle session instance");
            return None;
        }
        instance.touch();
        Some(instance)
    }

    /// Whether a live, non-idle instance is cached for `session_id`.
    pub fn is_cached(&self, session_id: &str) -> bool {
        self.instances
            .get(session_id)
            .is_some_and(|entry| !self.is_instance_expired(entry.value()))
    }

    pub fn is_instance_expired(&self, instance: &LiveInstance) -> bool {
        instance.idle_for() > self.config.instance_idle_ttl
    }

    /// Drops every idle instance. Returns how many were dropped.
    pub fn evict_expired(&self) -> usize {
        let mut evicted = 0;
        self.instances.retain(|_, instance| {
            let keep = !self.is_instance_expired(instance);
            if !keep {
                evicted += 1;
            }
            keep
        });
        evicted
    }

    /// Ends a session everywhere: drops the local instance and deletes the
    /// shared metadata. Returns whether an instance was cached here.
    pub async fn close_session(&self, session_id: &str) -> Result<bool, SessionError> {
        let was_cached = self.instances.remove(session_id).is_some();
        self.metadata.delete(session_id).await?;
        info!(session_id, "session closed");
        Ok(was_cached)
    }

    /// Drops every cached instance. Shared metadata is left alone so other
    /// instances keep serving the sessions.
    pub fn dispose(&self) {
        let count = self.instances.len();
        self.instances.clear();
        self.in_flight.clear();
        info!(instances = count, "session manager disposed");
    }

    pub fn get_stats(&self) -> SessionStats {
        SessionStats {
            cached_instances: self.instances.len(),
            oldest_entry_age: self
                .instances
                .iter()
                .map(|entry| entry.value().age())
                .max(),
            reconstructions: self.reconstructions.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
        }
    }

    /// Start background eviction of idle instances.
    ///
    /// Expired metadata is purged by the shared stores' own cleanup task.
    pub fn start_cleanup_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval_duration = self.config.cleanup_interval.max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_duration);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                interval.tick().await;

                let evicted = self.evict_expired();
                if evicted > 0 {
                    debug!(evicted, "idle session instances evicted");
                }
            }
        })
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.config)
            .field("cached_instances", &self.instances.len())
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::BasicServerFactory;
    use mcpgate_auth::AuthStores;
    use mcpgate_auth::ProviderType;

    fn manager(config: SessionConfig) -> (SessionManager, AuthStores) {
        let stores = AuthStores::in_memory();
        let manager = SessionManager::new(
            stores.session_metadata.clone(),
            Arc::new(BasicServerFactory::default()),
            config,
        );
        (manager, stores)
    }

    #[tokio::test]
    async fn test_create_instance_persists_metadata() {
        let (manager, stores) = manager(SessionConfig::default());
        let auth = SessionAuthInfo::new(ProviderType::GOOGLE, "u1");

        let instance = manager.create_instance(Some(auth), None).await.unwrap();
        let stored = stores
            .session_metadata
            .get(instance.session_id())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(stored.auth_info.unwrap().user_id, "u1");
        assert!(!instance.transport().is_initialized());
        assert!(manager.is_cached(instance.session_id()));
    }

    #[tokio::test]
    async fn test_cache_hit_returns_same_instance() {
        let (manager, _) = manager(SessionConfig::default());
        let created = manager.create_instance(None, None).await.unwrap();

        let fetched = manager
            .get_or_recreate_instance(created.session_id(), None)
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&created, &fetched));
        let stats = manager.get_stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.reconstructions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_instance_is_evicted_and_rebuilt() {
        let config = SessionConfig {
            instance_idle_ttl: Duration::from_secs(60),
            ..SessionConfig::default()
        };
        let (manager, _) = manager(config);
        let created = manager.create_instance(None, None).await.unwrap();
        let id = created.session_id().to_string();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(manager.is_instance_expired(&created));
        assert!(!manager.is_cached(&id));
        assert_eq!(manager.evict_expired(), 1);
        assert_eq!(manager.get_stats().cached_instances, 0);

        let rebuilt = manager.get_or_recreate_instance(&id, None).await.unwrap();
        assert!(!Arc::ptr_eq(&created, &rebuilt));
        assert!(rebuilt.transport().is_initialized());
        assert_eq!(manager.get_stats().reconstructions, 1);
    }

    #[tokio::test]
    async fn test_close_session_removes_metadata() {
        let (manager, stores) = manager(SessionConfig::default());
        let created = manager.create_instance(None, None).await.unwrap();
        let id = created.session_id().to_string();

        assert!(manager.close_session(&id).await.unwrap());
        assert!(stores.session_metadata.get(&id).await.unwrap().is_none());

        let err = manager.get_or_recreate_instance(&id, None).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!manager.close_session(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_dispose_keeps_metadata() {
        let (manager, stores) = manager(SessionConfig::default());
        let created = manager.create_instance(None, None).await.unwrap();

        manager.dispose();

        assert_eq!(manager.get_stats().cached_instances, 0);
        assert!(
            stores
                .session_metadata
                .get(created.session_id())
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_report_oldest_entry() {
        let (manager, _) = manager(SessionConfig::default());
        assert_eq!(manager.get_stats().oldest_entry_age, None);

        manager.create_instance(None, None).await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        manager.create_instance(None, None).await.unwrap();

        let stats = manager.get_stats();
        assert_eq!(stats.cached_instances, 2);
        assert_eq!(stats.oldest_entry_age, Some(Duration::from_secs(10)));
    }
}
