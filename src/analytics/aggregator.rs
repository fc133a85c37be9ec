//! Hybrid analytics aggregation.
//!
//! Every query first counts matching rows. Small result sets are loaded and
//! folded in memory; anything above the configured threshold is answered by
//! storage-side grouped queries instead, so the row set is never
//! materialized. Both strategies share the same rounding and ordering
//! helpers and must produce identical reports for the same data.

use chrono::{Days, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::analytics::models::{
    AbReport, AbRow, AnalyticsReport, BotReport, BreakdownEntry, Breakdowns, DayCount, Overview,
    TimeRange,
};
use crate::cache::{keys, CacheBackend, TtlPolicy};
use crate::config::AnalyticsConfig;
use crate::models::ClickRecord;
use crate::storage::{DateWindow, Dimension, Scope, Storage};

const TOP_N: usize = 10;

pub struct Analytics {
    storage: Arc<dyn Storage>,
    cache: Arc<dyn CacheBackend>,
    ttl: TtlPolicy,
    config: AnalyticsConfig,
}

impl Analytics {
    pub fn new(
        storage: Arc<dyn Storage>,
        cache: Arc<dyn CacheBackend>,
        ttl: TtlPolicy,
        config: AnalyticsConfig,
    ) -> Self {
        Self {
            storage,
            cache,
            ttl,
            config,
        }
    }

    /// Overview, zero-filled daily series, and top-10 breakdowns for the
    /// scope and range. Results are cached with the flat analytics TTL.
    pub async fn report(&self, scope: &Scope, range: &TimeRange) -> anyhow::Result<AnalyticsReport> {
        let window = range.window(Utc::now().date_naive());
        let key = self.cache_key(scope, "report", range, &window);

        if let Some(cached) = self.cached::<AnalyticsReport>(&key).await {
            return Ok(cached);
        }

        let total = self.storage.count_clicks(scope, &window).await?;
        let previous = self
            .storage
            .count_clicks(scope, &window.previous())
            .await?;

        let report = if total > self.config.aggregation_threshold {
            debug!(total, "analytics via storage-side aggregation");
            self.report_via_storage(scope, &window, total, previous).await?
        } else {
            debug!(total, "analytics via in-memory folds");
            self.report_in_memory(scope, &window, previous).await?
        };

        self.store(&key, &report).await;
        Ok(report)
    }

    /// Bot share and top bot names, same dual-strategy discipline.
    pub async fn bot_report(&self, scope: &Scope, range: &TimeRange) -> anyhow::Result<BotReport> {
        let window = range.window(Utc::now().date_naive());
        let key = self.cache_key(scope, "bots", range, &window);

        if let Some(cached) = self.cached::<BotReport>(&key).await {
            return Ok(cached);
        }

        let total = self.storage.count_clicks(scope, &window).await?;

        let report = if total > self.config.aggregation_threshold {
            let (bots, names) = tokio::try_join!(
                self.storage.count_bot_clicks(scope, &window),
                self.storage.bot_name_counts(scope, &window, TOP_N as i64),
            )?;
            BotReport {
                total_clicks: total,
                bot_clicks: bots,
                human_clicks: total - bots,
                bot_percentage: percentage(bots, total),
                top_bots: names
                    .into_iter()
                    .map(|(value, clicks)| BreakdownEntry {
                        value,
                        clicks,
                        percentage: percentage(clicks, bots),
                    })
                    .collect(),
            }
        } else {
            let rows = self.storage.load_clicks(scope, &window).await?;
            let total = rows.len() as i64;
            let bots = rows.iter().filter(|c| c.is_bot).count() as i64;
            let mut names: HashMap<String, i64> = HashMap::new();
            for click in rows.iter().filter(|c| c.is_bot) {
                let name = click
                    .bot_name
                    .clone()
                    .unwrap_or_else(|| "Unknown".to_string());
                *names.entry(name).or_insert(0) += 1;
            }
            BotReport {
                total_clicks: total,
                bot_clicks: bots,
                human_clicks: total - bots,
                bot_percentage: percentage(bots, total),
                top_bots: top_entries(names, bots, TOP_N),
            }
        };

        self.store(&key, &report).await;
        Ok(report)
    }

    /// Per-variant performance for a split-tested link, including the
    /// implicit control row. Bots are excluded, matching counter semantics.
    pub async fn ab_report(&self, link_id: i64, range: &TimeRange) -> anyhow::Result<AbReport> {
        let scope = Scope::Link(link_id);
        let window = range.window(Utc::now().date_naive());
        let key = self.cache_key(&scope, "ab", range, &window);

        if let Some(cached) = self.cached::<AbReport>(&key).await {
            return Ok(cached);
        }

        let link = self
            .storage
            .get_link(link_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("unknown link {link_id}"))?;
        let variants = self.storage.active_variants(link_id).await?;

        let total = self.storage.count_clicks(&scope, &window).await?;
        let mut counts: HashMap<Option<i64>, i64> = HashMap::new();

        if total > self.config.aggregation_threshold {
            for (variant_id, clicks) in self.storage.variant_counts(link_id, &window).await? {
                counts.insert(variant_id, clicks);
            }
        } else {
            for click in self
                .storage
                .load_clicks(&scope, &window)
                .await?
                .iter()
                .filter(|c| !c.is_bot)
            {
                *counts.entry(click.variant_id).or_insert(0) += 1;
            }
        }

        // Control and every active variant appear even with zero clicks.
        let mut rows: Vec<AbRow> = Vec::new();
        let human_total: i64 = counts.values().sum();

        let control_clicks = counts.remove(&None).unwrap_or(0);
        rows.push(AbRow {
            variant_id: None,
            target_url: link.original_url.clone(),
            clicks: control_clicks,
            percentage: percentage(control_clicks, human_total),
        });

        for variant in &variants {
            let clicks = counts.remove(&Some(variant.id)).unwrap_or(0);
            rows.push(AbRow {
                variant_id: Some(variant.id),
                target_url: variant.target_url.clone(),
                clicks,
                percentage: percentage(clicks, human_total),
            });
        }

        // Clicks attributed to since-deleted variants still show up.
        for (variant_id, clicks) in counts {
            rows.push(AbRow {
                variant_id,
                target_url: "(deleted variant)".to_string(),
                clicks,
                percentage: percentage(clicks, human_total),
            });
        }

        rows.sort_by(|a, b| b.clicks.cmp(&a.clicks).then(a.variant_id.cmp(&b.variant_id)));

        let report = AbReport {
            link_id,
            total_clicks: human_total,
            rows,
        };

        self.store(&key, &report).await;
        Ok(report)
    }

    /// Stream click detail in bounded batches. Memory stays bounded
    /// regardless of scope size: fixed batch size, hard record cap.
    pub fn export(&self, scope: Scope, range: TimeRange) -> mpsc::Receiver<Vec<ClickRecord>> {
        let (tx, rx) = mpsc::channel(4);
        let storage = Arc::clone(&self.storage);
        let batch_size = self.config.export_batch_size.max(1);
        let mut remaining = self.config.export_max_records.max(0);

        tokio::spawn(async move {
            let window = range.window(Utc::now().date_naive());
            let mut after_id = 0i64;

            while remaining > 0 {
                let limit = batch_size.min(remaining);
                let page = match storage.clicks_page(&scope, &window, after_id, limit).await {
                    Ok(page) => page,
                    Err(err) => {
                        warn!(error = %err, "export page failed");
                        break;
                    }
                };

                let Some(last) = page.last() else { break };
                after_id = last.id;
                remaining -= page.len() as i64;
                let exhausted = (page.len() as i64) < limit;

                if tx.send(page).await.is_err() {
                    // Consumer went away.
                    break;
                }
                if exhausted {
                    break;
                }
            }

            if remaining == 0 {
                info!("export record cap reached");
            }
        });

        rx
    }

    async fn report_in_memory(
        &self,
        scope: &Scope,
        window: &DateWindow,
        previous: i64,
    ) -> anyhow::Result<AnalyticsReport> {
        let rows = self.storage.load_clicks(scope, window).await?;
        let total = rows.len() as i64;

        let unique_visitors = {
            let mut ips: Vec<&str> = rows
                .iter()
                .filter_map(|c| c.ip_address.as_deref())
                .collect();
            ips.sort_unstable();
            ips.dedup();
            ips.len() as i64
        };

        let mut daily: HashMap<NaiveDate, i64> = HashMap::new();
        for click in &rows {
            if let Some(date) = chrono::DateTime::from_timestamp(click.created_at, 0) {
                *daily.entry(date.date_naive()).or_insert(0) += 1;
            }
        }

        let mut breakdowns = Breakdowns::default();
        for dimension in Dimension::ALL {
            let mut counts: HashMap<String, i64> = HashMap::new();
            for click in &rows {
                *counts
                    .entry(dimension_value(click, dimension))
                    .or_insert(0) += 1;
            }
            *breakdown_slot(&mut breakdowns, dimension) = top_entries(counts, total, TOP_N);
        }

        Ok(AnalyticsReport {
            overview: overview(total, unique_visitors, previous, window),
            series: zero_filled_series(&daily, window),
            breakdowns,
        })
    }

    async fn report_via_storage(
        &self,
        scope: &Scope,
        window: &DateWindow,
        total: i64,
        previous: i64,
    ) -> anyhow::Result<AnalyticsReport> {
        // Independent grouped queries, issued concurrently.
        let (unique_visitors, daily, country, region, city, browser, os, device, referrer, source, medium, campaign) = tokio::try_join!(
            self.storage.count_distinct_ips(scope, window),
            self.storage.daily_counts(scope, window),
            self.grouped(scope, window, Dimension::Country),
            self.grouped(scope, window, Dimension::Region),
            self.grouped(scope, window, Dimension::City),
            self.grouped(scope, window, Dimension::Browser),
            self.grouped(scope, window, Dimension::Os),
            self.grouped(scope, window, Dimension::Device),
            self.grouped(scope, window, Dimension::Referrer),
            self.grouped(scope, window, Dimension::UtmSource),
            self.grouped(scope, window, Dimension::UtmMedium),
            self.grouped(scope, window, Dimension::UtmCampaign),
        )?;

        let daily: HashMap<NaiveDate, i64> = daily.into_iter().collect();

        let entries = |rows: Vec<(String, i64)>| -> Vec<BreakdownEntry> {
            rows.into_iter()
                .map(|(value, clicks)| BreakdownEntry {
                    value,
                    clicks,
                    percentage: percentage(clicks, total),
                })
                .collect()
        };

        Ok(AnalyticsReport {
            overview: overview(total, unique_visitors, previous, window),
            series: zero_filled_series(&daily, window),
            breakdowns: Breakdowns {
                country: entries(country),
                region: entries(region),
                city: entries(city),
                browser: entries(browser),
                os: entries(os),
                device: entries(device),
                referrer: entries(referrer),
                utm_source: entries(source),
                utm_medium: entries(medium),
                utm_campaign: entries(campaign),
            },
        })
    }

    async fn grouped(
        &self,
        scope: &Scope,
        window: &DateWindow,
        dimension: Dimension,
    ) -> anyhow::Result<Vec<(String, i64)>> {
        self.storage
            .grouped_counts(scope, window, dimension, TOP_N as i64)
            .await
    }

    fn cache_key(
        &self,
        scope: &Scope,
        kind: &str,
        range: &TimeRange,
        window: &DateWindow,
    ) -> String {
        keys::analytics(
            &scope.cache_prefix(),
            &format!("{kind}:{}", range.label()),
            &window.start.to_string(),
            &window.end.to_string(),
        )
    }

    async fn cached<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.cache.get(key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(err) => {
                warn!(key, error = %err, "analytics cache read failed");
                None
            }
        }
    }

    async fn store<T: serde::Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_string(value) {
            Ok(raw) => {
                if let Err(err) = self.cache.set(key, raw, self.ttl.analytics_ttl).await {
                    warn!(key, error = %err, "analytics cache write failed");
                }
            }
            Err(err) => warn!(key, error = %err, "analytics report serialization failed"),
        }
    }
}

fn overview(total: i64, unique_visitors: i64, previous: i64, window: &DateWindow) -> Overview {
    Overview {
        total_clicks: total,
        unique_visitors,
        avg_clicks_per_day: round1(total as f64 / window.days() as f64),
        growth_rate: growth_rate(total, previous),
    }
}

fn dimension_value(click: &ClickRecord, dimension: Dimension) -> String {
    let field = match dimension {
        Dimension::Country => &click.country,
        Dimension::Region => &click.region,
        Dimension::City => &click.city,
        Dimension::Browser => &click.browser,
        Dimension::Os => &click.os,
        Dimension::Device => &click.device,
        Dimension::Referrer => &click.referrer_host,
        Dimension::UtmSource => &click.utm_source,
        Dimension::UtmMedium => &click.utm_medium,
        Dimension::UtmCampaign => &click.utm_campaign,
    };
    field.clone().unwrap_or_else(|| "Unknown".to_string())
}

fn breakdown_slot(breakdowns: &mut Breakdowns, dimension: Dimension) -> &mut Vec<BreakdownEntry> {
    match dimension {
        Dimension::Country => &mut breakdowns.country,
        Dimension::Region => &mut breakdowns.region,
        Dimension::City => &mut breakdowns.city,
        Dimension::Browser => &mut breakdowns.browser,
        Dimension::Os => &mut breakdowns.os,
        Dimension::Device => &mut breakdowns.device,
        Dimension::Referrer => &mut breakdowns.referrer,
        Dimension::UtmSource => &mut breakdowns.utm_source,
        Dimension::UtmMedium => &mut breakdowns.utm_medium,
        Dimension::UtmCampaign => &mut breakdowns.utm_campaign,
    }
}

/// Top-N with the shared ordering: count descending, then value ascending.
/// Matches the ORDER BY used by the storage-side strategy.
fn top_entries(counts: HashMap<String, i64>, total: i64, limit: usize) -> Vec<BreakdownEntry> {
    let mut entries: Vec<(String, i64)> = counts.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(limit);
    entries
        .into_iter()
        .map(|(value, clicks)| BreakdownEntry {
            value,
            clicks,
            percentage: percentage(clicks, total),
        })
        .collect()
}

/// One entry per calendar day in the window, zero-filled, ascending.
fn zero_filled_series(daily: &HashMap<NaiveDate, i64>, window: &DateWindow) -> Vec<DayCount> {
    let mut series = Vec::with_capacity(window.days() as usize);
    let mut date = window.start;
    while date <= window.end {
        series.push(DayCount {
            date,
            clicks: daily.get(&date).copied().unwrap_or(0),
        });
        date = date.checked_add_days(Days::new(1)).expect("date overflow");
    }
    series
}

pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub fn percentage(part: i64, total: i64) -> f64 {
    if total == 0 {
        0.0
    } else {
        round1(part as f64 * 100.0 / total as f64)
    }
}

/// Growth against the preceding period: 0/0 -> 0, 0/n -> 100, else the
/// rounded percent change.
pub fn growth_rate(current: i64, previous: i64) -> f64 {
    if previous == 0 {
        if current > 0 {
            100.0
        } else {
            0.0
        }
    } else {
        round1((current - previous) as f64 * 100.0 / previous as f64)
    }
}
