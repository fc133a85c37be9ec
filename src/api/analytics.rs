use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::analytics::{Analytics, TimeRange};
use crate::storage::Scope;

pub struct AnalyticsState {
    pub analytics: Arc<Analytics>,
}

pub fn create_analytics_router(state: Arc<AnalyticsState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/links/{id}/analytics", get(link_report))
        .route("/api/links/{id}/analytics/bots", get(link_bot_report))
        .route("/api/links/{id}/analytics/ab", get(link_ab_report))
        .route("/api/links/{id}/analytics/export", get(link_export))
        .route("/api/owners/{owner}/analytics", get(owner_report))
        .route("/api/owners/{owner}/analytics/bots", get(owner_bot_report))
        .route("/api/owners/{owner}/analytics/export", get(owner_export))
        // Dashboards are served from another origin.
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    range: Option<String>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
}

impl RangeQuery {
    /// `?range=7d|30d|90d` or `?range=custom&start=...&end=...`; default is
    /// the last 7 days.
    fn time_range(&self) -> Result<TimeRange, &'static str> {
        match self.range.as_deref() {
            None | Some("7d") => Ok(TimeRange::Last7Days),
            Some("30d") => Ok(TimeRange::Last30Days),
            Some("90d") => Ok(TimeRange::Last90Days),
            Some("custom") => match (self.start, self.end) {
                (Some(start), Some(end)) if start <= end => {
                    Ok(TimeRange::Custom { start, end })
                }
                _ => Err("custom range requires start <= end"),
            },
            Some(_) => Err("unknown range, expected 7d, 30d, 90d, or custom"),
        }
    }
}

fn bad_request(message: &'static str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn internal_error(err: anyhow::Error) -> Response {
    tracing::error!(error = %err, "analytics query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": "internal_error" })),
    )
        .into_response()
}

async fn link_report(
    State(state): State<Arc<AnalyticsState>>,
    Path(id): Path<i64>,
    Query(query): Query<RangeQuery>,
) -> Response {
    report(&state, Scope::Link(id), &query).await
}

async fn owner_report(
    State(state): State<Arc<AnalyticsState>>,
    Path(owner): Path<String>,
    Query(query): Query<RangeQuery>,
) -> Response {
    report(&state, Scope::Owner(owner), &query).await
}

async fn report(state: &AnalyticsState, scope: Scope, query: &RangeQuery) -> Response {
    let range = match query.time_range() {
        Ok(range) => range,
        Err(message) => return bad_request(message),
    };
    match state.analytics.report(&scope, &range).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => internal_error(err),
    }
}

async fn link_bot_report(
    State(state): State<Arc<AnalyticsState>>,
    Path(id): Path<i64>,
    Query(query): Query<RangeQuery>,
) -> Response {
    bot_report(&state, Scope::Link(id), &query).await
}

async fn owner_bot_report(
    State(state): State<Arc<AnalyticsState>>,
    Path(owner): Path<String>,
    Query(query): Query<RangeQuery>,
) -> Response {
    bot_report(&state, Scope::Owner(owner), &query).await
}

async fn bot_report(state: &AnalyticsState, scope: Scope, query: &RangeQuery) -> Response {
    let range = match query.time_range() {
        Ok(range) => range,
        Err(message) => return bad_request(message),
    };
    match state.analytics.bot_report(&scope, &range).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => internal_error(err),
    }
}

async fn link_ab_report(
    State(state): State<Arc<AnalyticsState>>,
    Path(id): Path<i64>,
    Query(query): Query<RangeQuery>,
) -> Response {
    let range = match query.time_range() {
        Ok(range) => range,
        Err(message) => return bad_request(message),
    };
    match state.analytics.ab_report(id, &range).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => internal_error(err),
    }
}

async fn link_export(
    State(state): State<Arc<AnalyticsState>>,
    Path(id): Path<i64>,
    Query(query): Query<RangeQuery>,
) -> Response {
    export(&state, Scope::Link(id), &query)
}

async fn owner_export(
    State(state): State<Arc<AnalyticsState>>,
    Path(owner): Path<String>,
    Query(query): Query<RangeQuery>,
) -> Response {
    export(&state, Scope::Owner(owner), &query)
}

/// Stream click detail as NDJSON, one record per line, batch by batch.
fn export(state: &AnalyticsState, scope: Scope, query: &RangeQuery) -> Response {
    let range = match query.time_range() {
        Ok(range) => range,
        Err(message) => return bad_request(message),
    };

    let receiver = state.analytics.export(scope, range);
    let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
        let batch = receiver.recv().await?;
        let mut chunk = String::new();
        for record in &batch {
            match serde_json::to_string(record) {
                Ok(line) => {
                    chunk.push_str(&line);
                    chunk.push('\n');
                }
                Err(err) => {
                    tracing::warn!(error = %err, "skipping unserializable click record")
                }
            }
        }
        Some((Ok::<_, Infallible>(chunk), receiver))
    });

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
        .into_response()
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "OK" }))
}
