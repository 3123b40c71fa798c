//! Session transport state.

use std::sync::atomic::{AtomicBool, Ordering};

use mcpgate_auth::SessionAuthInfo;
use serde::{Deserialize, Serialize};

/// Transport construction options, passed through unchanged to every
/// instance built for a session. Accepts both snake_case and the camelCase
/// names MCP clients use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    #[serde(alias = "enableJsonResponse")]
    pub enable_json_response: bool,
    #[serde(alias = "allowedOrigins")]
    pub allowed_origins: Option<Vec<String>>,
    #[serde(alias = "allowedHosts")]
    pub allowed_hosts: Option<Vec<String>>,
    #[serde(alias = "enableDnsRebindingProtection")]
    pub enable_dns_rebinding_protection: bool,
}

impl TransportOptions {
    /// Checks `Host`/`Origin` when DNS rebinding protection is on.
    #[must_use]
    pub fn permits(&self, host: Option<&str>, origin: Option<&str>) -> bool {
        if !self.enable_dns_rebinding_protection {
            return true;
        }
        let allowed = |list: &Option<Vec<String>>, value: Option<&str>| match (list, value) {
            (Some(list), Some(value)) => list.iter().any(|v| v == value),
            (Some(_), None) => false,
            (None, _) => true,
        };
        allowed(&self.allowed_hosts, host)
            && (origin.is_none() || allowed(&self.allowed_origins, origin))
    }
}

/// Per-session transport: identity, options, initialization flag and the
/// authentication context restored from metadata.
#[derive(Debug)]
pub struct SessionTransport {
    session_id: String,
    options: TransportOptions,
    initialized: AtomicBool,
    auth_info: Option<SessionAuthInfo>,
}

impl SessionTransport {
    pub fn new(
        session_id: impl Into<String>,
        options: TransportOptions,
        auth_info: Option<SessionAuthInfo>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            options,
            initialized: AtomicBool::new(false),
            auth_info,
        }
    }

    /// A transport for a session that completed `initialize` on some
    /// instance in the past.
    pub fn restored(
        session_id: impl Into<String>,
        options: TransportOptions,
        auth_info: Option<SessionAuthInfo>,
    ) -> Self {
        let transport = Self::new(session_id, options, auth_info);
        transport.mark_initialized();
        transport
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    pub fn auth_info(&self) -> Option<&SessionAuthInfo> {
        self.auth_info.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restored_transport_is_initialized() {
        let fresh = SessionTransport::new("s1", TransportOptions::default(), None);
        assert!(!fresh.is_initialized());
        fresh.mark_initialized();
        assert!(fresh.is_initialized());

        let restored = SessionTransport::restored("s1", TransportOptions::default(), None);
        assert!(restored.is_initialized());
        assert_eq!(restored.session_id(), "s1");
    }

    #[test]
    fn test_dns_rebinding_protection() {
        let open = TransportOptions::default();
        assert!(open.permits(Some("evil.example"), Some("https://evil.example")));

        let protected = TransportOptions {
            enable_dns_rebinding_protection: true,
            allowed_hosts: Some(vec!["localhost:8080".into()]),
            allowed_origins: Some(vec!["http://localhost:8080".into()]),
            ..TransportOptions::default()
        };
        assert!(protected.permits(Some("localhost:8080"), None));
        assert!(protected.permits(Some("localhost:8080"), Some("http://localhost:8080")));
        assert!(!protected.permits(Some("evil.example"), None));
        assert!(!protected.permits(Some("localhost:8080"), Some("https://evil.example")));
        assert!(!protected.permits(None, None));
    }
}
