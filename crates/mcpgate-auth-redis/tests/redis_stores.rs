//! Redis store tests against a real Redis.
//!
//! These need a container runtime; run with `cargo test -- --ignored`.

use std::time::Duration;

use mcpgate_auth::storage::{AuthStores, namespaced_key};
use mcpgate_auth::types::{
    PreAuthSession, ProviderType, SessionAuthInfo, SessionMetadata, TokenRecord, UserInfo,
    VerifierEntry,
};
use mcpgate_auth_redis::{DEFAULT_KEY_PREFIX, RedisStores};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use time::OffsetDateTime;
use tokio::sync::OnceCell;

static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

async fn redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");
            let port = container.get_host_port_ipv4(6379).await.expect("get port");
            (container, format!("redis://127.0.0.1:{port}"))
        })
        .await;
    url.clone()
}

/// Each test gets its own prefix so tests can share one container.
async fn stores(test: &str) -> (RedisStores, AuthStores) {
    let pool = deadpool_redis::Config::from_url(redis_url().await)
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .expect("create pool");
    let redis = RedisStores::new(pool, format!("{DEFAULT_KEY_PREFIX}{test}:"));
    (redis.clone(), redis.into_auth_stores())
}

fn record(provider: ProviderType, access: &str, refresh: Option<&str>) -> TokenRecord {
    TokenRecord {
        access_token: access.to_string(),
        refresh_token: refresh.map(str::to_string),
        id_token: None,
        expires_at: OffsetDateTime::now_utc() + time::Duration::hours(1),
        user_info: UserInfo {
            sub: "u1".into(),
            email: Some("u1@example.com".into()),
            name: None,
            provider: provider.clone(),
        },
        provider_type: provider,
        scopes: vec!["openid".into()],
    }
}

#[tokio::test]
#[ignore = "requires a container runtime"]
async fn verifiers_are_namespaced() {
    let (_, stores) = stores("verifiers").await;
    let ttl = Duration::from_secs(60);
    let entry = |v: &str| VerifierEntry {
        code_verifier: Some(v.to_string()),
        code_challenge: "challenge".into(),
        state: "state".into(),
    };

    let github = namespaced_key(&ProviderType::GITHUB, "C");
    let google = namespaced_key(&ProviderType::GOOGLE, "C");
    stores.verifiers.set(&github, &entry("gh"), ttl).await.unwrap();
    stores.verifiers.set(&google, &entry("g"), ttl).await.unwrap();

    assert_eq!(
        stores.verifiers.get(&github).await.unwrap().unwrap().code_verifier.as_deref(),
        Some("gh")
    );
    stores.verifiers.delete(&github).await.unwrap();
    assert!(!stores.verifiers.has(&github).await.unwrap());
    assert!(stores.verifiers.has(&google).await.unwrap());
    stores.verifiers.delete(&github).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a container runtime"]
async fn pre_auth_session_take_is_single_use() {
    let (_, stores) = stores("preauth").await;
    let now = OffsetDateTime::now_utc();
    let session = PreAuthSession {
        state: "st-1".into(),
        code_verifier: Some("v".repeat(43)),
        code_challenge: "c".into(),
        redirect_uri: "http://localhost:3000/auth/github/callback".into(),
        client_redirect_uri: None,
        client_state: None,
        scopes: vec![],
        provider_type: ProviderType::GITHUB,
        created_at: now,
        expires_at: now + time::Duration::minutes(10),
    };
    stores
        .pre_auth_sessions
        .set(&session, Duration::from_secs(600))
        .await
        .unwrap();

    assert!(stores.pre_auth_sessions.get("st-1").await.unwrap().is_some());
    assert!(stores.pre_auth_sessions.take("st-1").await.unwrap().is_some());
    assert!(stores.pre_auth_sessions.take("st-1").await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires a container runtime"]
async fn token_refresh_index_follows_record() {
    let (_, stores) = stores("tokens").await;
    let ttl = Duration::from_secs(3600);
    stores
        .tokens
        .set(&record(ProviderType::GOOGLE, "at-1", Some("rt-1")), ttl)
        .await
        .unwrap();

    assert!(stores.tokens.has(&ProviderType::GOOGLE, "at-1").await.unwrap());
    assert!(!stores.tokens.has(&ProviderType::GITHUB, "at-1").await.unwrap());
    let found = stores
        .tokens
        .find_by_refresh_token(&ProviderType::GOOGLE, "rt-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.access_token, "at-1");

    stores.tokens.delete(&ProviderType::GOOGLE, "at-1").await.unwrap();
    assert!(
        stores
            .tokens
            .find_by_refresh_token(&ProviderType::GOOGLE, "rt-1")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
#[ignore = "requires a container runtime"]
async fn session_metadata_expires_natively() {
    let (redis, stores) = stores("sessions").await;
    redis.ping().await.unwrap();
    stores.session_metadata.health_check().await.unwrap();

    let metadata = SessionMetadata::new(
        "s1",
        Some(SessionAuthInfo::new(ProviderType::GITHUB, "u1")),
        Duration::from_secs(1),
    );
    stores
        .session_metadata
        .set(&metadata, Duration::from_secs(1))
        .await
        .unwrap();
    let loaded = stores.session_metadata.get("s1").await.unwrap().unwrap();
    assert_eq!(loaded.auth_info.unwrap().provider, ProviderType::GITHUB);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(stores.session_metadata.get("s1").await.unwrap().is_none());
    assert_eq!(stores.cleanup_expired().await.unwrap(), 0);
}
