//! HTTP handlers for the OAuth surface.
//!
//! # Routes
//!
//! Relative to the configured prefix (default `/auth`):
//!
//! | Method | Path | Handler |
//! |--------|------|---------|
//! | GET | `/login` | [`login::login_handler`] |
//! | GET | `/authorize` | [`login::authorize_handler`] |
//! | GET | `/{provider}` | [`flow::start_handler`] |
//! | GET | `/{provider}/callback` | [`flow::callback_handler`] |
//! | POST | `/{provider}/logout` | [`flow::logout_handler`] |
//! | POST | `/token` | [`token::token_handler`] |
//! | POST | `/revoke` | [`token::revoke_handler`] |
//!
//! plus `GET /.well-known/oauth-authorization-server` at the root.
//!
//! # Usage
//!
//! ```ignore
//! let registry = Arc::new(registry);
//! let app = Router::new().merge(mcpgate_auth::http::router(AuthHttpState::new(registry)));
//! ```

pub mod bearer;
pub mod error;
pub mod flow;
pub mod login;
pub mod metadata;
pub mod token;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};

use crate::registry::ProviderRegistry;

pub use bearer::{BearerAuth, BearerRejection, authenticate_bearer};
pub use error::OAuthErrorBody;

/// State shared by the OAuth handlers.
#[derive(Clone)]
pub struct AuthHttpState {
    pub registry: Arc<ProviderRegistry>,
}

impl AuthHttpState {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    /// Absolute path of a route under the OAuth prefix.
    pub(crate) fn path(&self, route: &str) -> String {
        format!(
            "{}{}",
            self.registry.config().path_prefix.trim_end_matches('/'),
            route
        )
    }
}

/// The OAuth routes with relative paths, for nesting under a prefix.
pub fn oauth_routes() -> Router<AuthHttpState> {
    Router::new()
        .route("/login", get(login::login_handler))
        .route("/authorize", get(login::authorize_handler))
        .route("/token", post(token::token_handler))
        .route("/revoke", post(token::revoke_handler))
        .route("/{provider}", get(flow::start_handler))
        .route("/{provider}/callback", get(flow::callback_handler))
        .route("/{provider}/logout", post(flow::logout_handler))
}

/// The complete OAuth surface, mounted at the configured prefix.
pub fn router(state: AuthHttpState) -> Router {
    let prefix = state.registry.config().path_prefix.trim_end_matches('/').to_string();

    let routes = if prefix.is_empty() {
        oauth_routes()
    } else {
        Router::new().nest(&prefix, oauth_routes())
    };

    routes
        .route(
            "/.well-known/oauth-authorization-server",
            get(metadata::authorization_server_metadata_handler),
        )
        .with_state(state)
}
