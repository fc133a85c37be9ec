use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use shunt::analytics::Analytics;
use shunt::api::{
    create_analytics_router, create_redirect_router, AnalyticsState, RedirectState,
};
use shunt::cache::{CacheBackend, InvalidationScheduler, MemoryCache, TtlPolicy};
use shunt::config::Config;
use shunt::enrichment::{Enricher, GeoIpService};
use shunt::events::EventBus;
use shunt::recorder::ClickRecorder;
use shunt::resolver::{FixedWindowLimiter, Resolver, Sha256Verifier};
use shunt::storage::{SqliteStorage, Storage};
use shunt::webhooks::WebhookDispatcher;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    info!("Loaded configuration");

    info!("Using SQLite storage: {}", config.database.url);
    let storage: Arc<dyn Storage> = Arc::new(
        SqliteStorage::new(&config.database.url, config.database.max_connections).await?,
    );
    storage.init().await?;
    info!("Database initialized");

    let cache: Arc<dyn CacheBackend> = Arc::new(MemoryCache::new(
        config.cache.max_entries,
        config.cache.pattern_delete_chunk,
        Duration::from_millis(config.cache.pattern_delete_pause_ms),
    ));
    let ttl = TtlPolicy::from_config(&config.cache);

    let geoip = match config.enrichment.geoip_city_db.as_deref() {
        Some(path) => {
            info!("GeoIP enrichment enabled: {path}");
            Arc::new(GeoIpService::new(Some(path))?)
        }
        None => {
            info!("GeoIP enrichment disabled (GEOIP_CITY_DB not set)");
            Arc::new(GeoIpService::disabled())
        }
    };
    let enricher = Arc::new(Enricher::new(Arc::clone(&geoip)));

    let events = EventBus::new(config.events.capacity);
    let invalidation = InvalidationScheduler::new(
        Arc::clone(&cache),
        Duration::from_millis(config.cache.invalidation_debounce_ms),
        Duration::from_millis(config.cache.shutdown_flush_timeout_ms),
    );

    let resolver = Arc::new(Resolver::new(
        Arc::clone(&storage),
        Arc::clone(&cache),
        ttl,
        events.clone(),
        Arc::new(Sha256Verifier),
        Arc::new(FixedWindowLimiter::from_config(&config.rate_limit)),
    ));
    let analytics = Arc::new(Analytics::new(
        Arc::clone(&storage),
        Arc::clone(&cache),
        ttl,
        config.analytics.clone(),
    ));

    // Background workers share one shutdown signal.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let recorder = ClickRecorder::new(
        Arc::clone(&storage),
        enricher,
        Arc::clone(&invalidation),
    );
    let recorder_task = recorder.spawn(events.subscribe(), shutdown_rx.clone());

    let dispatcher = Arc::new(WebhookDispatcher::new(
        Arc::clone(&storage),
        config.webhooks.clone(),
    )?);
    let dispatcher_task = dispatcher.spawn(events.subscribe(), shutdown_rx);
    info!(
        subscribers = events.subscriber_count(),
        "Background workers started"
    );

    let redirect_router = create_redirect_router(Arc::new(RedirectState {
        resolver,
        enrichment: config.enrichment.clone(),
    }));
    let analytics_router = create_analytics_router(Arc::new(AnalyticsState { analytics }));

    let redirect_addr = format!(
        "{}:{}",
        config.redirect_server.host, config.redirect_server.port
    );
    let redirect_listener = tokio::net::TcpListener::bind(&redirect_addr).await?;
    info!("Redirect server listening on http://{redirect_addr}");

    let api_addr = format!("{}:{}", config.api_server.host, config.api_server.port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr).await?;
    info!("Analytics API listening on http://{api_addr}");

    tokio::try_join!(
        axum::serve(
            redirect_listener,
            redirect_router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal()),
        axum::serve(api_listener, analytics_router.into_make_service())
            .with_graceful_shutdown(shutdown_signal()),
    )?;

    // Servers are down; stop the workers and drain buffered invalidations.
    info!("Shutting down background workers");
    shutdown_tx.send(true).ok();
    let _ = tokio::join!(recorder_task, dispatcher_task);
    invalidation.shutdown().await;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
