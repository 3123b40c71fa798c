//! Redis storage backend for mcpgate-auth.
//!
//! Implements the four store traits over a shared `deadpool-redis` pool so
//! that any number of stateless instances see the same verifiers, pre-auth
//! sessions, tokens and session metadata.
//!
//! # Key Layout
//!
//! With the default root prefix `mcpgate:`:
//!
//! | Store | Key |
//! |-------|-----|
//! | verifiers | `mcpgate:verifier:{provider}:{code}` |
//! | pre-auth sessions | `mcpgate:preauth:{state}` |
//! | tokens | `mcpgate:token:{provider}:{access_token}` |
//! | refresh index | `mcpgate:refresh:{provider}:{refresh_token}` -> access token |
//! | session metadata | `mcpgate:session:{session_id}` |
//!
//! Values are JSON. Expiry uses native `SET ... EX`, so `cleanup_expired`
//! is a no-op. Every operation touches a single key, except token writes
//! and deletes which also maintain the refresh index in the same pipeline.

mod store;

pub use store::{
    RedisPreAuthSessionStore, RedisSessionMetadataStore, RedisStores, RedisTokenStore,
    RedisVerifierStore,
};

use mcpgate_auth::AuthError;

/// Default root prefix for every key.
pub const DEFAULT_KEY_PREFIX: &str = "mcpgate:";

/// Redis backend errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("redis command failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("failed to (de)serialize stored value: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StorageError> for AuthError {
    fn from(err: StorageError) -> Self {
        AuthError::storage(err.to_string())
    }
}
