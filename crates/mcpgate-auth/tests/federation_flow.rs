//! End-to-end authorization flows against a mocked identity provider.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
    response::Response,
};
use mcpgate_auth::pkce::{PkceChallenge, PkceVerifier};
use mcpgate_auth::{
    AuthConfig, AuthError, AuthHttpState, AuthResult, AuthStores, ProviderConfig,
    ProviderRegistry, ProviderType, TokenRecord, TokenStorage,
};
use serde_json::{Value, json};
use tower::ServiceExt;
use url::Url;
use wiremock::matchers::{body_string_contains, header as header_matcher, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn setup(server: &MockServer) -> (Router, Arc<ProviderRegistry>) {
    setup_with(server, AuthStores::in_memory()).await
}

async fn setup_with(server: &MockServer, stores: AuthStores) -> (Router, Arc<ProviderRegistry>) {
    let provider = ProviderConfig::new(ProviderType::OIDC, "mcp-client")
        .with_client_secret("mcp-secret")
        .with_endpoint_base(&server.uri());
    let config = AuthConfig {
        allow_http: true,
        providers: vec![provider.clone()],
        ..AuthConfig::default()
    };

    let mut registry = ProviderRegistry::new(stores, config);
    registry.create_from_config(&[provider]).await.unwrap();
    let registry = Arc::new(registry);
    let app = mcpgate_auth::http::router(AuthHttpState::new(registry.clone()));
    (app, registry)
}

async fn mount_idp(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "at-1",
            "token_type": "Bearer",
            "expires_in": 3600,
            "refresh_token": "rt-1",
            "scope": "openid email"
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/userinfo"))
        .and(header_matcher("authorization", "Bearer at-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sub": "user-1",
            "email": "user@example.com",
            "name": "Test User"
        })))
        .mount(server)
        .await;
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn location(response: &Response) -> Url {
    let value = response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap();
    Url::parse(value).unwrap()
}

fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn form(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn direct_flow_issues_tokens_and_consumes_state_once() {
    let server = MockServer::start().await;
    mount_idp(&server).await;
    let (app, registry) = setup(&server).await;

    let response = send(&app, get("/auth/oidc")).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let authorize = location(&response);
    assert_eq!(authorize.path(), "/authorize");
    assert_eq!(
        query_param(&authorize, "code_challenge_method").as_deref(),
        Some("S256")
    );
    assert_eq!(
        query_param(&authorize, "redirect_uri").as_deref(),
        Some("http://localhost:3000/auth/oidc/callback")
    );
    let state = query_param(&authorize, "state").unwrap();

    let callback = format!("/auth/oidc/callback?code=abc&state={state}");
    let response = send(&app, get(&callback)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["access_token"], "at-1");
    assert_eq!(body["refresh_token"], "rt-1");
    assert_eq!(body["token_type"], "Bearer");

    // state is single-use
    let response = send(&app, get(&callback)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "invalid_state");

    // the verifier was deleted after the exchange
    let provider = registry.get(&ProviderType::OIDC).unwrap();
    assert!(!provider.has_stored_code_for_provider("abc").await.unwrap());

    let info = registry.verify_access_token("at-1").await.unwrap();
    assert_eq!(info.provider, ProviderType::OIDC);
    assert_eq!(info.user_info.sub, "user-1");
    assert_eq!(info.client_id, "mcp-client");
}

#[tokio::test]
async fn callback_with_unknown_state_is_rejected() {
    let server = MockServer::start().await;
    let (app, _) = setup(&server).await;

    let response = send(&app, get("/auth/oidc/callback?code=abc&state=forged")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"], "invalid_state");

    let response = send(&app, get("/auth/oidc/callback?state=forged")).await;
    assert_eq!(json_body(response).await["error"], "invalid_request");

    let response = send(&app, get("/auth/oidc/callback?error=access_denied")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "access_denied");
}

#[tokio::test]
async fn pass_through_flow_verifies_client_pkce() {
    let server = MockServer::start().await;
    mount_idp(&server).await;
    let (app, _) = setup(&server).await;

    let verifier = PkceVerifier::generate();
    let challenge = PkceChallenge::from_verifier(&verifier);
    let start = format!(
        "/auth/oidc?redirect_uri={}&code_challenge={}&code_challenge_method=S256&state=client-state",
        "http%3A%2F%2Flocalhost%3A8080%2Fcb",
        challenge.as_str()
    );
    let response = send(&app, get(&start)).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let authorize = location(&response);
    assert_eq!(
        query_param(&authorize, "code_challenge").as_deref(),
        Some(challenge.as_str())
    );
    let state = query_param(&authorize, "state").unwrap();

    let response = send(&app, get(&format!("/auth/oidc/callback?code=abc&state={state}"))).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let client = location(&response);
    assert_eq!(client.host_str(), Some("localhost"));
    assert_eq!(client.path(), "/cb");
    assert_eq!(query_param(&client, "code").as_deref(), Some("abc"));
    assert_eq!(query_param(&client, "state").as_deref(), Some("client-state"));

    let wrong = "b".repeat(43);
    let response = send(
        &app,
        form(
            "/auth/token",
            &format!("grant_type=authorization_code&code=abc&code_verifier={wrong}"),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "invalid_grant");

    let response = send(
        &app,
        form(
            "/auth/token",
            &format!(
                "grant_type=authorization_code&code=abc&code_verifier={}\
                 &client_id=mcp-inspector&redirect_uri=http%3A%2F%2Flocalhost%3A6274%2Fcb",
                verifier.as_str()
            ),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["access_token"], "at-1");
}

#[tokio::test]
async fn redirect_without_challenge_is_rejected() {
    let server = MockServer::start().await;
    let (app, _) = setup(&server).await;

    let response = send(
        &app,
        get("/auth/oidc?redirect_uri=http%3A%2F%2Flocalhost%3A8080%2Fcb"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "invalid_request");
}

#[tokio::test]
async fn refresh_then_revoke() {
    let server = MockServer::start().await;
    mount_idp(&server).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "at-2",
            "token_type": "Bearer",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/revoke"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/introspect"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"active": false})))
        .expect(1)
        .mount(&server)
        .await;
    let (app, registry) = setup(&server).await;

    let response = send(&app, get("/auth/oidc")).await;
    let state = query_param(&location(&response), "state").unwrap();
    let response = send(&app, get(&format!("/auth/oidc/callback?code=abc&state={state}"))).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(
        &app,
        form("/auth/token", "grant_type=refresh_token&refresh_token=rt-1"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["access_token"], "at-2");
    // not rotated by the IdP, so the old refresh token stays valid
    assert_eq!(body["refresh_token"], "rt-1");

    // at-1 was replaced locally; at-2 verifies without an IdP call
    let provider = registry.get(&ProviderType::OIDC).unwrap();
    assert!(!provider.has_token("at-1").await.unwrap());
    assert!(registry.verify_access_token("at-2").await.is_ok());

    let response = send(&app, form("/auth/revoke", "token=at-2")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!provider.has_token("at-2").await.unwrap());

    // unknown tokens are still a 200
    let response = send(&app, form("/auth/revoke", "token=never-issued")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(&app, form("/auth/revoke", "token_type_hint=access_token")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // after revocation the lone provider asks the IdP once, which says inactive
    let err = registry.verify_access_token("at-2").await.unwrap_err();
    assert_eq!(err.oauth_error_code(), "invalid_token");
}

/// Token store whose backend is unreachable.
struct UnreachableTokens;

#[async_trait]
impl TokenStorage for UnreachableTokens {
    async fn set(&self, _record: &TokenRecord, _ttl: Duration) -> AuthResult<()> {
        Err(AuthError::storage("connection refused"))
    }
    async fn get(&self, _: &ProviderType, _: &str) -> AuthResult<Option<TokenRecord>> {
        Err(AuthError::storage("connection refused"))
    }
    async fn has(&self, _: &ProviderType, _: &str) -> AuthResult<bool> {
        Err(AuthError::storage("connection refused"))
    }
    async fn delete(&self, _: &ProviderType, _: &str) -> AuthResult<()> {
        Err(AuthError::storage("connection refused"))
    }
    async fn find_by_refresh_token(
        &self,
        _: &ProviderType,
        _: &str,
    ) -> AuthResult<Option<TokenRecord>> {
        Err(AuthError::storage("connection refused"))
    }
    async fn cleanup_expired(&self) -> AuthResult<u64> {
        Err(AuthError::storage("connection refused"))
    }
}

#[tokio::test]
async fn revoke_reports_store_outage() {
    let server = MockServer::start().await;
    let stores = AuthStores {
        tokens: Arc::new(UnreachableTokens),
        ..AuthStores::in_memory()
    };
    let (app, _) = setup_with(&server, stores).await;

    let response = send(&app, form("/auth/revoke", "token=live-token")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await;
    assert_eq!(body["error"], "server_error");
    assert!(!body.to_string().contains("connection refused"));
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn token_endpoint_validates_before_routing() {
    let server = MockServer::start().await;
    let (app, _) = setup(&server).await;

    let response = send(&app, form("/auth/token", "grant_type=password")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "unsupported_grant_type");

    let response = send(&app, form("/auth/token", "grant_type=authorization_code")).await;
    assert_eq!(json_body(response).await["error"], "invalid_request");

    let response = send(
        &app,
        form("/auth/token", "grant_type=authorization_code&code=unknown"),
    )
    .await;
    assert_eq!(json_body(response).await["error"], "invalid_grant");

    assert!(server.received_requests().await.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn authorize_and_login_pages() {
    let server = MockServer::start().await;
    let (app, _) = setup(&server).await;

    // a single provider is selected directly
    let response = send(&app, get("/auth/authorize?state=xyz")).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        response.headers()[header::LOCATION].to_str().unwrap(),
        "/auth/oidc?state=xyz"
    );

    let response = send(&app, get("/auth/authorize?provider=okta")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let request = Request::builder()
        .uri("/auth/login?state=xyz")
        .header(header::ACCEPT, "application/json")
        .body(Body::empty())
        .unwrap();
    let body = json_body(send(&app, request).await).await;
    assert_eq!(body["providers"][0]["type"], "oidc");
    assert_eq!(body["providers"][0]["url"], "/auth/oidc?state=xyz");

    let response = send(&app, get("/.well-known/oauth-authorization-server")).await;
    let body = json_body(response).await;
    assert_eq!(body["token_endpoint"], "http://localhost:3000/auth/token");
    assert_eq!(body["identity_providers"][0], "oidc");
}
