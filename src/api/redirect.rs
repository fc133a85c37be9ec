use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::EnrichmentConfig;
use crate::enrichment::ip_extractor::extract_client_ip;
use crate::models::UtmParams;
use crate::resolver::{ResolveError, Resolver, VisitAttributes};

pub struct RedirectState {
    pub resolver: Arc<Resolver>,
    pub enrichment: EnrichmentConfig,
}

pub fn create_redirect_router(state: Arc<RedirectState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/{slug}", get(redirect_slug))
        .route("/{slug}/verify", post(verify_password))
        .with_state(state)
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
}

fn error_json(status: StatusCode, error: &'static str) -> Response {
    (status, Json(ErrorBody { error })).into_response()
}

fn map_resolve_error(err: ResolveError) -> Response {
    match err {
        ResolveError::NotFound => error_json(StatusCode::NOT_FOUND, "not_found"),
        ResolveError::Blocked => error_json(StatusCode::GONE, "link_unavailable"),
        ResolveError::PasswordRequired => error_json(StatusCode::UNAUTHORIZED, "password_required"),
        ResolveError::WrongPassword => error_json(StatusCode::UNAUTHORIZED, "wrong_password"),
        ResolveError::RateLimited => error_json(StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
        ResolveError::Internal(err) => {
            tracing::error!(error = %err, "resolve failed");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        }
    }
}

fn visit_attributes(
    headers: &HeaderMap,
    addr: SocketAddr,
    query: &HashMap<String, String>,
    enrichment: &EnrichmentConfig,
) -> VisitAttributes {
    let header_str =
        |name: header::HeaderName| headers.get(name).and_then(|h| h.to_str().ok()).map(String::from);

    VisitAttributes {
        ip: Some(extract_client_ip(headers, addr.ip(), enrichment)),
        user_agent: header_str(header::USER_AGENT),
        referrer: header_str(header::REFERER),
        query_utm: UtmParams {
            source: query.get("utm_source").cloned(),
            medium: query.get("utm_medium").cloned(),
            campaign: query.get("utm_campaign").cloned(),
            term: query.get("utm_term").cloned(),
            content: query.get("utm_content").cloned(),
        },
    }
}

/// Resolve a slug and answer with a temporary redirect. Password-protected
/// links get a 401 challenge instead; the client retries via `/verify`.
async fn redirect_slug(
    State(state): State<Arc<RedirectState>>,
    Path(slug): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let visit = visit_attributes(&headers, addr, &query, &state.enrichment);

    match state.resolver.resolve(&slug, visit).await {
        Ok(destination) => Redirect::temporary(&destination.url).into_response(),
        Err(err) => map_resolve_error(err),
    }
}

#[derive(Deserialize)]
struct VerifyRequest {
    password: String,
}

#[derive(Serialize)]
struct VerifyResponse {
    url: String,
}

/// Verify a link password and hand back the destination for a client-side
/// redirect.
async fn verify_password(
    State(state): State<Arc<RedirectState>>,
    Path(slug): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<VerifyRequest>,
) -> Response {
    let visit = visit_attributes(&headers, addr, &query, &state.enrichment);

    match state
        .resolver
        .verify_and_resolve(&slug, &body.password, visit)
        .await
    {
        Ok(destination) => Json(VerifyResponse {
            url: destination.url,
        })
        .into_response(),
        Err(err) => map_resolve_error(err),
    }
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "OK" }))
}
