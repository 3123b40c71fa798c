//! Protocol sessions for stateless instances.
//!
//! A session is created once (on `initialize`) and persisted as
//! [`SessionMetadata`](mcpgate_auth::SessionMetadata) in the shared store.
//! Any instance can later rebuild the live transport and protocol server
//! from that metadata; the [`SessionManager`] caches the rebuilt instance
//! and guarantees a single reconstruction per session id within a process.

pub mod manager;
pub mod protocol;
pub mod transport;

use std::time::Duration;

use mcpgate_auth::AuthError;
use serde::{Deserialize, Serialize};

pub use manager::{LiveInstance, SessionManager, SessionStats};
pub use protocol::{
    BasicProtocolServer, BasicServerFactory, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
    ProtocolServer, ProtocolServerFactory,
};
pub use transport::{SessionTransport, TransportOptions};

/// Session manager errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No metadata exists for the session id.
    #[error("session not found: {session_id}")]
    NotFound { session_id: String },

    /// Metadata exists but is past its expiry.
    #[error("session expired: {session_id}")]
    Expired { session_id: String },

    /// The metadata store failed; the request may be retried.
    #[error("session store unavailable: {0}")]
    Storage(#[from] AuthError),

    /// The transport or protocol server could not be built.
    #[error("transport error: {0}")]
    Transport(String),
}

impl SessionError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// `true` for both unknown and expired sessions; clients must start a
    /// new session either way.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Expired { .. })
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

/// Session manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Lifetime of persisted session metadata.
    #[serde(with = "humantime_serde")]
    pub metadata_ttl: Duration,

    /// Idle time after which a cached live instance is dropped. The
    /// session itself survives and is rebuilt on the next request.
    #[serde(with = "humantime_serde")]
    pub instance_idle_ttl: Duration,

    /// Period of the background eviction task.
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,

    /// Transport options used when a request does not supply its own.
    pub transport: TransportOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            metadata_ttl: Duration::from_secs(24 * 3600),
            instance_idle_ttl: Duration::from_secs(30 * 60),
            cleanup_interval: Duration::from_secs(60),
            transport: TransportOptions::default(),
        }
    }
}
