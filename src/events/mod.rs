//! In-process visit event bus.
//!
//! The resolver publishes one `VisitEvent` per successful redirect and never
//! waits on consumers. Delivery is at-most-once: there is no persistence and
//! a lagging subscriber loses events rather than stalling the publisher.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::UtmParams;

pub const EVENT_LINK_CLICKED: &str = "link.clicked";

/// Everything downstream consumers need without re-resolving the slug.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitEvent {
    pub link_id: i64,
    pub owner_id: String,
    pub slug: String,
    /// `None` means the control group (or no split test).
    pub variant_id: Option<i64>,
    /// Set when a smart-routing rule picked the destination.
    pub routing_rule_id: Option<i64>,
    pub destination: String,
    pub ip: Option<IpAddr>,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
    pub utm: UtmParams,
    pub occurred_at: i64,
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<VisitEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Fire-and-forget publish. An event with no live subscribers is simply
    /// dropped.
    pub fn publish(&self, event: VisitEvent) {
        if let Err(err) = self.sender.send(event) {
            debug!("visit event dropped: no subscribers ({err})");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VisitEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
