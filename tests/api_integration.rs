//! End-to-end tests for the HTTP surface using in-process routers.

use axum::{
    body::Body,
    extract::connect_info::ConnectInfo,
    http::{header, Request, StatusCode},
};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use shunt::analytics::Analytics;
use shunt::api::{create_analytics_router, create_redirect_router, AnalyticsState, RedirectState};
use shunt::cache::{CacheBackend, MemoryCache, TtlPolicy};
use shunt::config::{AnalyticsConfig, EnrichmentConfig, TrustedProxyMode};
use shunt::events::EventBus;
use shunt::models::{NewShortLink, UtmParams};
use shunt::resolver::{FixedWindowLimiter, Resolver, Sha256Verifier};
use shunt::storage::{SqliteStorage, Storage};

async fn test_storage() -> Arc<dyn Storage> {
    let storage = SqliteStorage::new("sqlite::memory:", 1).await.unwrap();
    storage.init().await.unwrap();
    Arc::new(storage)
}

fn test_ttl() -> TtlPolicy {
    TtlPolicy {
        hot_threshold: 1_000,
        hot_ttl: Duration::from_secs(3600),
        cold_ttl: Duration::from_secs(60),
        analytics_ttl: Duration::from_secs(60),
    }
}

fn redirect_router(storage: Arc<dyn Storage>) -> axum::Router {
    let cache = Arc::new(MemoryCache::new(1_000, 50, Duration::from_millis(0)));
    let resolver = Arc::new(Resolver::new(
        storage,
        cache as Arc<dyn CacheBackend>,
        test_ttl(),
        EventBus::new(8),
        Arc::new(Sha256Verifier),
        Arc::new(FixedWindowLimiter::new(2, Duration::from_secs(60))),
    ));
    create_redirect_router(Arc::new(RedirectState {
        resolver,
        enrichment: EnrichmentConfig {
            geoip_city_db: None,
            trusted_proxy_mode: TrustedProxyMode::None,
            trusted_proxies: Vec::new(),
            num_trusted_proxies: None,
        },
    }))
}

fn analytics_router(storage: Arc<dyn Storage>) -> axum::Router {
    let cache = Arc::new(MemoryCache::new(1_000, 50, Duration::from_millis(0)));
    let analytics = Arc::new(Analytics::new(
        storage,
        cache as Arc<dyn CacheBackend>,
        test_ttl(),
        AnalyticsConfig {
            aggregation_threshold: 10_000,
            export_batch_size: 100,
            export_max_records: 1_000,
        },
    ));
    create_analytics_router(Arc::new(AnalyticsState { analytics }))
}

fn get(uri: &str) -> Request<Body> {
    let mut request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40_000))));
    request
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    let mut request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40_000))));
    request
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn seed_link(storage: &Arc<dyn Storage>, slug: &str, password: Option<&str>) {
    storage
        .create_link(NewShortLink {
            slug: slug.to_string(),
            original_url: "https://a.test/page".to_string(),
            owner_id: "acme".to_string(),
            password_hash: password.map(Sha256Verifier::hash),
            expires_at: None,
            utm: UtmParams::default(),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn redirect_returns_location_of_destination() {
    let storage = test_storage().await;
    seed_link(&storage, "promo", None).await;
    let router = redirect_router(storage);

    let response = router.oneshot(get("/promo")).await.unwrap();
    assert!(response.status().is_redirection());
    assert_eq!(
        response.headers().get(header::LOCATION).unwrap(),
        "https://a.test/page"
    );
}

#[tokio::test]
async fn unknown_slug_is_404() {
    let storage = test_storage().await;
    let router = redirect_router(storage);

    let response = router.oneshot(get("/missing")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn expired_link_is_410() {
    let storage = test_storage().await;
    storage
        .create_link(NewShortLink {
            slug: "old".to_string(),
            original_url: "https://a.test/".to_string(),
            owner_id: "acme".to_string(),
            password_hash: None,
            expires_at: Some(shunt::models::now_ts() - 5),
            utm: UtmParams::default(),
        })
        .await
        .unwrap();
    let router = redirect_router(storage);

    let response = router.oneshot(get("/old")).await.unwrap();
    assert_eq!(response.status(), StatusCode::GONE);
}

#[tokio::test]
async fn protected_link_gets_a_password_challenge() {
    let storage = test_storage().await;
    seed_link(&storage, "vault", Some("open sesame")).await;
    let router = redirect_router(storage);

    let response = router.oneshot(get("/vault")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    assert_eq!(body["error"], "password_required");
}

#[tokio::test]
async fn verify_endpoint_resolves_with_correct_password() {
    let storage = test_storage().await;
    seed_link(&storage, "vault", Some("open sesame")).await;
    let router = redirect_router(storage);

    let response = router
        .oneshot(post_json("/vault/verify", r#"{"password":"open sesame"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["url"], "https://a.test/page");
}

#[tokio::test]
async fn verify_endpoint_rejects_and_rate_limits() {
    let storage = test_storage().await;
    seed_link(&storage, "vault", Some("open sesame")).await;
    let router = redirect_router(storage);

    for _ in 0..2 {
        let response = router
            .clone()
            .oneshot(post_json("/vault/verify", r#"{"password":"nope"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    // The limiter allows two failures; the third attempt is refused.
    let response = router
        .oneshot(post_json("/vault/verify", r#"{"password":"nope"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn analytics_report_endpoint_returns_json() {
    let storage = test_storage().await;
    seed_link(&storage, "promo", None).await;
    let router = analytics_router(storage);

    let response = router
        .oneshot(get("/api/links/1/analytics?range=30d"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["overview"]["total_clicks"], 0);
    assert_eq!(body["series"].as_array().unwrap().len(), 30);
}

#[tokio::test]
async fn analytics_rejects_bad_ranges() {
    let storage = test_storage().await;
    let router = analytics_router(storage);

    let response = router
        .clone()
        .oneshot(get("/api/links/1/analytics?range=1y"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = router
        .oneshot(get(
            "/api/links/1/analytics?range=custom&start=2024-02-01&end=2024-01-01",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn export_endpoint_streams_ndjson() {
    let storage = test_storage().await;
    seed_link(&storage, "promo", None).await;
    storage
        .insert_click(shunt::models::NewClickRecord {
            url_id: 1,
            owner_id: "acme".to_string(),
            browser: Some("Chrome".into()),
            created_at: shunt::models::now_ts(),
            ..Default::default()
        })
        .await
        .unwrap();
    let router = analytics_router(storage);

    let response = router
        .oneshot(get("/api/links/1/analytics/export"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/x-ndjson"
    );

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 1);
    let record: Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(record["browser"], "Chrome");
}

#[tokio::test]
async fn health_endpoints_respond() {
    let storage = test_storage().await;
    let redirect = redirect_router(Arc::clone(&storage));
    let analytics = analytics_router(storage);

    let response = redirect.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = analytics.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
