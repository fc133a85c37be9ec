//! Redirect resolver: slug -> final destination under status, expiry, and
//! password gates, with variant selection and UTM merging.
//!
//! The resolve path must return fast: recording, enrichment, and webhook
//! delivery all happen behind the fire-and-forget visit event.

pub mod password;
pub mod rate_limit;

pub use password::{PasswordVerifier, Sha256Verifier};
pub use rate_limit::{FixedWindowLimiter, RateLimitExceeded, RateLimiter};

use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::cache::{keys, CacheBackend, TtlPolicy};
use crate::events::{EventBus, VisitEvent};
use crate::models::{now_ts, LinkStatus, ShortLink, UtmParams};
use crate::routing::select_variant;
use crate::storage::Storage;

#[derive(Debug, Error)]
pub enum ResolveError {
    /// Unknown slug; surfaced to the caller, never retried.
    #[error("unknown slug")]
    NotFound,
    /// Link is inactive or expired.
    #[error("link is not active")]
    Blocked,
    /// Password-protected link, no password supplied. No visit is recorded.
    #[error("password required")]
    PasswordRequired,
    #[error("incorrect password")]
    WrongPassword,
    #[error("too many failed password attempts")]
    RateLimited,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Raw request attributes carried into the visit event.
#[derive(Debug, Clone, Default)]
pub struct VisitAttributes {
    pub ip: Option<IpAddr>,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
    /// UTM values from the request query string; these override link presets
    /// per field.
    pub query_utm: UtmParams,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Destination {
    pub url: String,
    pub link_id: i64,
    pub variant_id: Option<i64>,
}

pub struct Resolver {
    storage: Arc<dyn Storage>,
    cache: Arc<dyn CacheBackend>,
    ttl: TtlPolicy,
    events: EventBus,
    verifier: Arc<dyn PasswordVerifier>,
    limiter: Arc<dyn RateLimiter>,
}

impl Resolver {
    pub fn new(
        storage: Arc<dyn Storage>,
        cache: Arc<dyn CacheBackend>,
        ttl: TtlPolicy,
        events: EventBus,
        verifier: Arc<dyn PasswordVerifier>,
        limiter: Arc<dyn RateLimiter>,
    ) -> Self {
        Self {
            storage,
            cache,
            ttl,
            events,
            verifier,
            limiter,
        }
    }

    /// Resolve a slug without a password. Password-protected links yield
    /// `PasswordRequired` before any visit is recorded.
    pub async fn resolve(
        &self,
        slug: &str,
        visit: VisitAttributes,
    ) -> Result<Destination, ResolveError> {
        let link = self.gated_link(slug).await?;

        if link.password_hash.is_some() {
            return Err(ResolveError::PasswordRequired);
        }

        self.finish(link, visit).await
    }

    /// Resolve a password-protected slug. The rate limiter is consulted
    /// before anything else; failed attempts feed it, success clears it.
    pub async fn verify_and_resolve(
        &self,
        slug: &str,
        password: &str,
        visit: VisitAttributes,
    ) -> Result<Destination, ResolveError> {
        let client_id = visit
            .ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        if self.limiter.check_attempt(slug, &client_id).is_err() {
            return Err(ResolveError::RateLimited);
        }

        let link = self.gated_link(slug).await?;

        if let Some(ref hash) = link.password_hash {
            if !self.verifier.verify(password, hash) {
                self.limiter.record_failure(slug, &client_id);
                return Err(ResolveError::WrongPassword);
            }
            self.limiter.record_success(slug, &client_id);
        }

        self.finish(link, visit).await
    }

    /// Fetch the link (cache first) and enforce status and expiry gates.
    async fn gated_link(&self, slug: &str) -> Result<ShortLink, ResolveError> {
        let link = self
            .fetch_link(slug)
            .await?
            .ok_or(ResolveError::NotFound)?;

        if link.status != LinkStatus::Active {
            return Err(ResolveError::Blocked);
        }

        if link.is_expired_at(now_ts()) {
            // Lazy transition on first access past the deadline. Best
            // effort: the gate decision stands even if persistence fails.
            if let Err(err) = self.storage.set_link_status(link.id, LinkStatus::Expired).await {
                warn!(slug, error = %err, "failed to persist expired status");
            }
            self.evict_link(&link).await;
            return Err(ResolveError::Blocked);
        }

        Ok(link)
    }

    async fn finish(
        &self,
        link: ShortLink,
        visit: VisitAttributes,
    ) -> Result<Destination, ResolveError> {
        let variant = if link.is_ab_test {
            let variants = self
                .storage
                .active_variants(link.id)
                .await
                .map_err(ResolveError::Internal)?;
            let mut rng = rand::rng();
            select_variant(&variants, &mut rng).cloned()
        } else {
            None
        };

        let base_url = variant
            .as_ref()
            .map(|v| v.target_url.clone())
            .unwrap_or_else(|| link.original_url.clone());

        let utm = link.preset_utm().merged_with(&visit.query_utm);
        let url = append_utm(&base_url, &utm);

        let destination = Destination {
            url: url.clone(),
            link_id: link.id,
            variant_id: variant.as_ref().map(|v| v.id),
        };

        // Fire-and-forget: the redirect response never awaits recording.
        self.events.publish(VisitEvent {
            link_id: link.id,
            owner_id: link.owner_id.clone(),
            slug: link.slug.clone(),
            variant_id: destination.variant_id,
            // Rule evaluation happens outside this resolver.
            routing_rule_id: None,
            destination: url,
            ip: visit.ip,
            user_agent: visit.user_agent,
            referrer: visit.referrer,
            utm,
            occurred_at: now_ts(),
        });

        Ok(destination)
    }

    async fn fetch_link(&self, slug: &str) -> Result<Option<ShortLink>, anyhow::Error> {
        let key = keys::link_by_slug(slug);
        match self.cache.get(&key).await {
            Ok(Some(raw)) => {
                if let Ok(link) = serde_json::from_str::<ShortLink>(&raw) {
                    return Ok(Some(link));
                }
                // Corrupt snapshot: fall through to storage.
            }
            Ok(None) => {}
            Err(err) => warn!(slug, error = %err, "cache read failed, falling back to storage"),
        }

        let link = self.storage.get_link_by_slug(slug).await?;
        if let Some(ref link) = link {
            self.cache_link(link).await;
        }
        Ok(link)
    }

    async fn cache_link(&self, link: &ShortLink) {
        let ttl = self.ttl.link_ttl(link.click_count);
        match serde_json::to_string(link) {
            Ok(raw) => {
                if let Err(err) = self
                    .cache
                    .set(&keys::link_by_slug(&link.slug), raw.clone(), ttl)
                    .await
                {
                    warn!(slug = %link.slug, error = %err, "cache write failed");
                }
                if let Err(err) = self.cache.set(&keys::link_by_id(link.id), raw, ttl).await {
                    warn!(slug = %link.slug, error = %err, "cache write failed");
                }
            }
            Err(err) => warn!(slug = %link.slug, error = %err, "link snapshot serialization failed"),
        }
    }

    async fn evict_link(&self, link: &ShortLink) {
        for key in [keys::link_by_slug(&link.slug), keys::link_by_id(link.id)] {
            if let Err(err) = self.cache.delete(&key).await {
                warn!(slug = %link.slug, error = %err, "cache eviction failed");
            }
        }
    }
}

/// Append merged UTM parameters to a destination URL. An unparseable
/// destination is returned unchanged.
pub fn append_utm(base: &str, utm: &UtmParams) -> String {
    if utm.is_empty() {
        return base.to_string();
    }

    let Ok(mut parsed) = url::Url::parse(base) else {
        warn!(url = base, "destination is not a valid URL, skipping UTM merge");
        return base.to_string();
    };

    let fields = [
        ("utm_source", &utm.source),
        ("utm_medium", &utm.medium),
        ("utm_campaign", &utm.campaign),
        ("utm_term", &utm.term),
        ("utm_content", &utm.content),
    ];

    // Merged UTM values win over any the destination already carries, so
    // overridden pairs are dropped before appending.
    let retained: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(name, _)| {
            !fields
                .iter()
                .any(|(field, value)| value.is_some() && *field == name.as_ref())
        })
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();

    parsed.set_query(None);
    {
        let mut pairs = parsed.query_pairs_mut();
        for (name, value) in &retained {
            pairs.append_pair(name, value);
        }
        for (name, value) in fields {
            if let Some(value) = value {
                pairs.append_pair(name, value);
            }
        }
    }

    parsed.into()
}
