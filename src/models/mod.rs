use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle state of a short link.
///
/// `Expired` is applied lazily: a link past its `expires_at` keeps its stored
/// status until the first access after the deadline transitions it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Active,
    Inactive,
    Expired,
}

/// Preset UTM fields on a link. Query-string values override these per field
/// when the final destination is assembled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtmParams {
    pub source: Option<String>,
    pub medium: Option<String>,
    pub campaign: Option<String>,
    pub term: Option<String>,
    pub content: Option<String>,
}

impl UtmParams {
    pub fn is_empty(&self) -> bool {
        self.source.is_none()
            && self.medium.is_none()
            && self.campaign.is_none()
            && self.term.is_none()
            && self.content.is_none()
    }

    /// Merge `overrides` on top of `self`, field by field.
    pub fn merged_with(&self, overrides: &UtmParams) -> UtmParams {
        UtmParams {
            source: overrides.source.clone().or_else(|| self.source.clone()),
            medium: overrides.medium.clone().or_else(|| self.medium.clone()),
            campaign: overrides.campaign.clone().or_else(|| self.campaign.clone()),
            term: overrides.term.clone().or_else(|| self.term.clone()),
            content: overrides.content.clone().or_else(|| self.content.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ShortLink {
    pub id: i64,
    pub slug: String,
    pub original_url: String,
    pub owner_id: String,
    /// Hashed; verification is delegated to a `PasswordVerifier`.
    pub password_hash: Option<String>,
    pub expires_at: Option<i64>,
    pub status: LinkStatus,
    pub click_count: i64,
    pub is_ab_test: bool,
    /// Destination may be chosen by a smart-routing rule; rule evaluation
    /// lives outside the redirect core.
    pub is_smart_routing: bool,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
    pub utm_term: Option<String>,
    pub utm_content: Option<String>,
    pub created_at: i64,
}

impl ShortLink {
    pub fn preset_utm(&self) -> UtmParams {
        UtmParams {
            source: self.utm_source.clone(),
            medium: self.utm_medium.clone(),
            campaign: self.utm_campaign.clone(),
            term: self.utm_term.clone(),
            content: self.utm_content.clone(),
        }
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline <= now)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewShortLink {
    pub slug: String,
    pub original_url: String,
    pub owner_id: String,
    pub password_hash: Option<String>,
    pub expires_at: Option<i64>,
    pub utm: UtmParams,
}

/// A/B test destination variant. The implicit control group (the link's
/// original URL) receives weight `max(0, 100 - sum of active weights)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Variant {
    pub id: i64,
    pub url_id: i64,
    pub target_url: String,
    pub weight: i64,
    pub is_active: bool,
    pub click_count: i64,
    pub created_at: i64,
}

/// Immutable fact row for one visit. Written once by the click recorder,
/// never updated, deleted only when the parent link is deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ClickRecord {
    pub id: i64,
    pub url_id: i64,
    pub owner_id: String,
    /// `None` means the control group was selected (or the link has no test).
    pub variant_id: Option<i64>,
    /// Smart-routing rule that picked the destination, when one did.
    pub routing_rule_id: Option<i64>,
    pub ip_address: Option<String>,
    pub browser: Option<String>,
    pub os: Option<String>,
    pub device: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub referrer_host: Option<String>,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
    pub is_bot: bool,
    pub bot_name: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default)]
pub struct NewClickRecord {
    pub url_id: i64,
    pub owner_id: String,
    pub variant_id: Option<i64>,
    pub routing_rule_id: Option<i64>,
    pub ip_address: Option<String>,
    pub browser: Option<String>,
    pub os: Option<String>,
    pub device: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub referrer_host: Option<String>,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
    pub is_bot: bool,
    pub bot_name: Option<String>,
    pub created_at: i64,
}

/// Outbound subscriber endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Webhook {
    pub id: i64,
    pub url: String,
    pub secret: String,
    /// JSON array of subscribed event names.
    pub events: String,
    pub is_active: bool,
    pub total_sent: i64,
    pub total_success: i64,
    pub total_failed: i64,
    pub last_sent_at: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: i64,
}

impl Webhook {
    pub fn subscribes_to(&self, event: &str) -> bool {
        serde_json::from_str::<Vec<String>>(&self.events)
            .map(|events| events.iter().any(|e| e == event))
            .unwrap_or(false)
    }
}

/// Append-only audit row for one delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WebhookLog {
    pub id: i64,
    pub webhook_id: i64,
    pub event: String,
    pub payload: String,
    pub status_code: Option<i64>,
    pub response_body: Option<String>,
    pub duration_ms: i64,
    pub attempt: i64,
    pub success: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewWebhookLog {
    pub webhook_id: i64,
    pub event: String,
    pub payload: String,
    pub status_code: Option<i64>,
    pub response_body: Option<String>,
    pub duration_ms: i64,
    pub attempt: i64,
    pub success: bool,
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}
