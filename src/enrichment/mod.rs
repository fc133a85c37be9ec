//! Visit enrichment: pure functions turning raw request attributes
//! (user agent, IP, referrer) into the click dimensions persisted for
//! analytics. No I/O happens at call time; GeoIP reads come from a
//! memory-mapped database.

pub mod geoip;
pub mod ip_extractor;
pub mod user_agent;

pub use geoip::GeoIpService;
pub use ip_extractor::extract_client_ip;
pub use user_agent::{parse_user_agent, UserAgentInfo};

use std::net::IpAddr;
use std::sync::Arc;

/// Enriched attributes for one visit.
#[derive(Debug, Clone, Default)]
pub struct Enrichment {
    pub browser: Option<String>,
    pub os: Option<String>,
    pub device: Option<String>,
    pub is_bot: bool,
    pub bot_name: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub referrer_host: Option<String>,
}

/// Bundles the user-agent parser and the GeoIP reader so the recorder runs
/// enrichment exactly once per visit and reuses the single result.
pub struct Enricher {
    geoip: Arc<GeoIpService>,
}

impl Enricher {
    pub fn new(geoip: Arc<GeoIpService>) -> Self {
        Self { geoip }
    }

    pub fn enrich(
        &self,
        user_agent: Option<&str>,
        ip: Option<IpAddr>,
        referrer: Option<&str>,
    ) -> Enrichment {
        let mut enrichment = Enrichment::default();

        if let Some(ua) = user_agent {
            let info = parse_user_agent(ua);
            enrichment.browser = info.browser;
            enrichment.os = info.os;
            enrichment.device = info.device;
            enrichment.is_bot = info.is_bot;
            enrichment.bot_name = info.bot_name;
        }

        if let Some(ip) = ip {
            let geo = self.geoip.lookup(ip);
            enrichment.country = geo.country;
            enrichment.region = geo.region;
            enrichment.city = geo.city;
        }

        enrichment.referrer_host = referrer.and_then(referrer_host);

        enrichment
    }
}

/// Extract the host portion of a referrer URL, if any.
pub fn referrer_host(referrer: &str) -> Option<String> {
    let trimmed = referrer.trim();
    if trimmed.is_empty() {
        return None;
    }
    url::Url::parse(trimmed)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
}
