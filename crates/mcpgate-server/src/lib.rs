pub mod config;
pub mod handlers;
pub mod observability;
pub mod server;
pub mod session;

pub use config::{AppConfig, LoggingConfig, RedisConfig, ServerConfig};
pub use observability::init_tracing;
pub use server::{AppState, BackgroundTasks, McpGateServer, ServerBuilder, build_app};
pub use session::{SessionConfig, SessionError, SessionManager};

use mcpgate_auth::AuthStores;
use mcpgate_auth_redis::RedisStores;

/// Create the shared stores based on configuration.
///
/// ## Store Modes
///
/// - **Redis disabled**: In-memory stores; sessions and pending logins only
///   live in this process
/// - **Redis enabled**: Attempts to connect to Redis, falls back to
///   in-memory on failure
///
/// ## Graceful Degradation
///
/// If the Redis connection fails at startup the server still comes up, but
/// other instances will not see its sessions or pending authorizations.
pub async fn create_store_backend(config: &RedisConfig) -> AuthStores {
    use std::time::Duration;

    if !config.enabled {
        tracing::info!("Redis disabled, using in-memory stores");
        return AuthStores::in_memory();
    }

    tracing::info!(url = %config.url, "Connecting to Redis");

    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    let pool_config = redis_config.pool.get_or_insert_with(Default::default);
    pool_config.max_size = config.pool_size;
    pool_config.timeouts.wait = Some(Duration::from_millis(config.timeout_ms));
    pool_config.timeouts.create = Some(Duration::from_millis(config.timeout_ms));
    pool_config.timeouts.recycle = Some(Duration::from_millis(config.timeout_ms));

    let pool = match redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1)) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to create Redis pool. Falling back to in-memory stores."
            );
            return AuthStores::in_memory();
        }
    };

    let stores = RedisStores::new(pool, config.key_prefix.clone());
    match stores.ping().await {
        Ok(()) => {
            tracing::info!(prefix = %config.key_prefix, "Connected to Redis");
            stores.into_auth_stores()
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to connect to Redis. Falling back to in-memory stores; sessions will not be shared across instances."
            );
            AuthStores::in_memory()
        }
    }
}
