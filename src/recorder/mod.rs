//! Asynchronous click recorder.
//!
//! Consumes visit events from the bus, enriches each visit once, persists a
//! click record, bumps popularity counters for human visits, and schedules
//! debounced cache invalidation. Every failure here is logged and swallowed:
//! a dropped click is acceptable, a slow redirect is not.

use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::InvalidationScheduler;
use crate::enrichment::Enricher;
use crate::events::VisitEvent;
use crate::models::NewClickRecord;
use crate::storage::Storage;

pub struct ClickRecorder {
    storage: Arc<dyn Storage>,
    enricher: Arc<Enricher>,
    invalidation: Arc<InvalidationScheduler>,
}

impl ClickRecorder {
    pub fn new(
        storage: Arc<dyn Storage>,
        enricher: Arc<Enricher>,
        invalidation: Arc<InvalidationScheduler>,
    ) -> Self {
        Self {
            storage,
            enricher,
            invalidation,
        }
    }

    /// Run the recorder until the bus closes or shutdown is signalled.
    pub fn spawn(
        self,
        mut events: broadcast::Receiver<VisitEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = events.recv() => match received {
                        Ok(event) => self.record(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "click recorder lagged, visits lost");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("event bus closed, click recorder stopping");
                            break;
                        }
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("click recorder received shutdown signal");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Record one visit. Never returns an error: the visitor-facing path
    /// has already moved on.
    pub async fn record(&self, event: VisitEvent) {
        let enrichment = self.enricher.enrich(
            event.user_agent.as_deref(),
            event.ip,
            event.referrer.as_deref(),
        );
        let is_bot = enrichment.is_bot;

        let click = NewClickRecord {
            url_id: event.link_id,
            owner_id: event.owner_id.clone(),
            variant_id: event.variant_id,
            routing_rule_id: event.routing_rule_id,
            ip_address: event.ip.map(|ip| ip.to_string()),
            browser: enrichment.browser,
            os: enrichment.os,
            device: enrichment.device,
            country: enrichment.country,
            region: enrichment.region,
            city: enrichment.city,
            referrer_host: enrichment.referrer_host,
            utm_source: event.utm.source.clone(),
            utm_medium: event.utm.medium.clone(),
            utm_campaign: event.utm.campaign.clone(),
            is_bot,
            bot_name: enrichment.bot_name,
            created_at: event.occurred_at,
        };

        if let Err(err) = self.storage.insert_click(click).await {
            warn!(slug = %event.slug, error = %err, "failed to persist click");
        }

        if is_bot {
            debug!(slug = %event.slug, "bot visit recorded, counters untouched");
        } else {
            // Independent increments; a partial failure undercounts and is
            // logged, not retried.
            let link_incr = self.storage.increment_link_clicks(event.link_id);
            if let Some(variant_id) = event.variant_id {
                let variant_incr = self.storage.increment_variant_clicks(variant_id);
                let (link_res, variant_res) = tokio::join!(link_incr, variant_incr);
                if let Err(err) = link_res {
                    warn!(slug = %event.slug, error = %err, "link counter increment failed");
                }
                if let Err(err) = variant_res {
                    warn!(variant_id, error = %err, "variant counter increment failed");
                }
            } else if let Err(err) = link_incr.await {
                warn!(slug = %event.slug, error = %err, "link counter increment failed");
            }
        }

        self.invalidation
            .schedule(event.link_id, &event.slug, &event.owner_id);
    }
}
