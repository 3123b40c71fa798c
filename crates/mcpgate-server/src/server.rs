use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::FromRef,
    http::{HeaderName, HeaderValue, Request},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use mcpgate_auth::{AuthHttpState, AuthStores, ProviderEnvironment, ProviderRegistry};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::session::{BasicServerFactory, ProtocolServerFactory, SessionManager};
use crate::{config::AppConfig, create_store_backend, handlers};

/// State shared by the protocol and health handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<ProviderRegistry>,
    pub sessions: Arc<SessionManager>,
}

impl FromRef<AppState> for AuthHttpState {
    fn from_ref(state: &AppState) -> Self {
        AuthHttpState::new(state.registry.clone())
    }
}

pub struct McpGateServer {
    addr: SocketAddr,
    state: AppState,
    app: Router,
}

/// Periodic maintenance started alongside the listener.
#[derive(Debug)]
pub struct BackgroundTasks {
    sessions: JoinHandle<()>,
    stores: JoinHandle<()>,
}

impl BackgroundTasks {
    pub fn abort(&self) {
        self.sessions.abort();
        self.stores.abort();
    }
}

pub fn build_app(state: AppState) -> Router {
    let body_limit = state.config.server.body_limit_bytes;
    let oauth = mcpgate_auth::http::router(AuthHttpState::from_ref(&state));

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/mcp", post(handlers::mcp_post).delete(handlers::mcp_delete))
        .with_state(state)
        .merge(oauth)
        // Middleware stack (order: trace -> request id -> body limit)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    let req_id = req
                        .extensions()
                        .get::<HeaderValue>()
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    let session_id = req
                        .headers()
                        .get(handlers::SESSION_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri().path(),
                        http.status_code = Empty,
                        request_id = %req_id,
                        session_id = %session_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(middleware::from_fn(request_id))
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

/// Preserves an incoming `x-request-id` or generates one, and echoes it on
/// the response.
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let header_name = HeaderName::from_static("x-request-id");

    let req_id_value = req
        .headers()
        .get(&header_name)
        .cloned()
        .or_else(|| HeaderValue::from_str(&Uuid::new_v4().to_string()).ok())
        .unwrap_or_else(|| HeaderValue::from_static("unknown"));

    req.extensions_mut().insert(req_id_value.clone());

    let mut res = next.run(req).await;
    res.headers_mut().insert(header_name, req_id_value);
    res
}

pub struct ServerBuilder {
    config: AppConfig,
    environment: Option<ProviderEnvironment>,
    stores: Option<AuthStores>,
    factory: Arc<dyn ProtocolServerFactory>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
            environment: None,
            stores: None,
            factory: Arc::new(BasicServerFactory::default()),
        }
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.config = cfg;
        self
    }

    /// Provider credentials; defaults to the process environment.
    pub fn with_provider_environment(mut self, env: ProviderEnvironment) -> Self {
        self.environment = Some(env);
        self
    }

    /// Use these stores instead of building them from `redis` config.
    pub fn with_stores(mut self, stores: AuthStores) -> Self {
        self.stores = Some(stores);
        self
    }

    /// The protocol server built for every session.
    pub fn with_factory(mut self, factory: Arc<dyn ProtocolServerFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub async fn build(self) -> anyhow::Result<McpGateServer> {
        let stores = match self.stores {
            Some(stores) => stores,
            None => create_store_backend(&self.config.redis).await,
        };

        let env = self.environment.unwrap_or_else(ProviderEnvironment::from_env);
        let mut registry = ProviderRegistry::new(stores.clone(), self.config.auth.clone());
        let registered = registry.initialize(&env).await?;
        tracing::info!(
            providers = registered,
            types = ?registry.provider_types(),
            auth_enabled = self.config.auth.enabled,
            "Identity providers initialized"
        );

        let sessions = Arc::new(SessionManager::new(
            stores.session_metadata.clone(),
            self.factory,
            self.config.session.clone(),
        ));

        let state = AppState {
            config: Arc::new(self.config),
            registry: Arc::new(registry),
            sessions,
        };
        let app = build_app(state.clone());

        Ok(McpGateServer {
            addr: state.config.addr(),
            state,
            app,
        })
    }
}

impl McpGateServer {
    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        self.app.clone()
    }

    /// Idle-instance eviction and the expired-entry purge of the shared
    /// stores, both every `session.cleanup_interval`.
    pub fn start_background_tasks(&self) -> BackgroundTasks {
        let period = self.state.config.session.cleanup_interval;
        BackgroundTasks {
            sessions: self.state.sessions.clone().start_cleanup_task(),
            stores: self.state.registry.stores().clone().start_cleanup_task(period),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);

        let tasks = self.start_background_tasks();
        let served = axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        tasks.abort();
        self.state.sessions.dispose();
        if let Err(e) = self.state.registry.dispose_all().await {
            tracing::warn!(error = %e, "provider disposal failed");
        }
        served?;
        Ok(())
    }
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
