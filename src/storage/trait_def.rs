use anyhow::Result;
use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use thiserror::Error;

use crate::models::{
    ClickRecord, LinkStatus, NewClickRecord, NewShortLink, NewWebhookLog, ShortLink, Variant,
    Webhook, WebhookLog,
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("slug already exists")]
    Conflict,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Analytics scope: one link, or every link owned by an account.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Link(i64),
    Owner(String),
}

impl Scope {
    /// Cache-key prefix segment (`link:{id}` / `owner:{account}`).
    pub fn cache_prefix(&self) -> String {
        match self {
            Scope::Link(id) => format!("link:{id}"),
            Scope::Owner(owner) => format!("owner:{owner}"),
        }
    }
}

/// Click dimensions available for grouped breakdowns. The enum maps to a
/// fixed column list, so callers can never inject arbitrary SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Country,
    Region,
    City,
    Browser,
    Os,
    Device,
    Referrer,
    UtmSource,
    UtmMedium,
    UtmCampaign,
}

impl Dimension {
    pub const ALL: [Dimension; 10] = [
        Dimension::Country,
        Dimension::Region,
        Dimension::City,
        Dimension::Browser,
        Dimension::Os,
        Dimension::Device,
        Dimension::Referrer,
        Dimension::UtmSource,
        Dimension::UtmMedium,
        Dimension::UtmCampaign,
    ];

    pub fn column(&self) -> &'static str {
        match self {
            Dimension::Country => "country",
            Dimension::Region => "region",
            Dimension::City => "city",
            Dimension::Browser => "browser",
            Dimension::Os => "os",
            Dimension::Device => "device",
            Dimension::Referrer => "referrer_host",
            Dimension::UtmSource => "utm_source",
            Dimension::UtmMedium => "utm_medium",
            Dimension::UtmCampaign => "utm_campaign",
        }
    }
}

/// Inclusive calendar-day window, resolved to UTC epoch bounds for queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn start_ts(&self) -> i64 {
        self.start.and_hms_opt(0, 0, 0).expect("valid midnight").and_utc().timestamp()
    }

    /// Exclusive upper bound: midnight after `end`.
    pub fn end_ts_exclusive(&self) -> i64 {
        self.end
            .checked_add_days(Days::new(1))
            .expect("date overflow")
            .and_hms_opt(0, 0, 0)
            .expect("valid midnight")
            .and_utc()
            .timestamp()
    }

    /// The immediately preceding window of equal length, for growth rates.
    pub fn previous(&self) -> DateWindow {
        let days = Days::new(self.days() as u64);
        DateWindow {
            start: self.start.checked_sub_days(days).expect("date underflow"),
            end: self.end.checked_sub_days(days).expect("date underflow"),
        }
    }
}

/// Narrow persistence interface consumed by the core. Counter increments are
/// atomic on the storage side, so concurrent visits never lose clicks.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Initialize the storage (run migrations, etc.)
    async fn init(&self) -> Result<()>;

    // Links
    async fn create_link(&self, link: NewShortLink) -> StorageResult<ShortLink>;
    async fn get_link(&self, id: i64) -> Result<Option<ShortLink>>;
    async fn get_link_by_slug(&self, slug: &str) -> Result<Option<ShortLink>>;
    async fn set_link_status(&self, id: i64, status: LinkStatus) -> Result<bool>;
    /// Delete a link; cascades to its clicks and variants.
    async fn delete_link(&self, id: i64) -> Result<bool>;
    async fn increment_link_clicks(&self, id: i64) -> Result<()>;

    // Variants
    /// `weight` must fall in 0..=100.
    async fn create_variant(&self, url_id: i64, target_url: &str, weight: i64) -> Result<Variant>;
    async fn active_variants(&self, url_id: i64) -> Result<Vec<Variant>>;
    /// Deleting the last variant of a link clears `is_ab_test` on the parent.
    async fn delete_variant(&self, id: i64) -> Result<bool>;
    async fn increment_variant_clicks(&self, id: i64) -> Result<()>;

    // Clicks
    async fn insert_click(&self, click: NewClickRecord) -> Result<i64>;
    async fn count_clicks(&self, scope: &Scope, window: &DateWindow) -> Result<i64>;
    async fn count_distinct_ips(&self, scope: &Scope, window: &DateWindow) -> Result<i64>;
    async fn daily_counts(
        &self,
        scope: &Scope,
        window: &DateWindow,
    ) -> Result<Vec<(NaiveDate, i64)>>;
    async fn grouped_counts(
        &self,
        scope: &Scope,
        window: &DateWindow,
        dimension: Dimension,
        limit: i64,
    ) -> Result<Vec<(String, i64)>>;
    async fn count_bot_clicks(&self, scope: &Scope, window: &DateWindow) -> Result<i64>;
    async fn bot_name_counts(
        &self,
        scope: &Scope,
        window: &DateWindow,
        limit: i64,
    ) -> Result<Vec<(String, i64)>>;
    /// Clicks per variant in the window; `None` is the control group.
    async fn variant_counts(
        &self,
        url_id: i64,
        window: &DateWindow,
    ) -> Result<Vec<(Option<i64>, i64)>>;
    async fn load_clicks(&self, scope: &Scope, window: &DateWindow) -> Result<Vec<ClickRecord>>;
    /// Keyset page ordered by id ascending, strictly after `after_id`.
    async fn clicks_page(
        &self,
        scope: &Scope,
        window: &DateWindow,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<ClickRecord>>;

    // Webhooks
    async fn create_webhook(&self, url: &str, secret: &str, events: &[&str]) -> Result<Webhook>;
    async fn get_webhook(&self, id: i64) -> Result<Option<Webhook>>;
    async fn active_webhooks_for_event(&self, event: &str) -> Result<Vec<Webhook>>;
    async fn append_webhook_log(&self, log: NewWebhookLog) -> Result<i64>;
    async fn webhook_logs(&self, webhook_id: i64) -> Result<Vec<WebhookLog>>;
    /// Update the subscriber's rolling counters once per delivery:
    /// `total_sent` always, `total_success` xor `total_failed`.
    async fn record_delivery_outcome(
        &self,
        webhook_id: i64,
        success: bool,
        error: Option<&str>,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_window_bounds_and_length() {
        let window = DateWindow::new(
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 7).unwrap(),
        );
        assert_eq!(window.days(), 7);
        assert_eq!(window.end_ts_exclusive() - window.start_ts(), 7 * 86_400);
    }

    #[test]
    fn previous_window_abuts_current() {
        let window = DateWindow::new(
            NaiveDate::from_ymd_opt(2024, 3, 8).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 14).unwrap(),
        );
        let prev = window.previous();
        assert_eq!(prev.days(), window.days());
        assert_eq!(prev.end, NaiveDate::from_ymd_opt(2024, 3, 7).unwrap());
        assert_eq!(prev.start, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
    }
}
