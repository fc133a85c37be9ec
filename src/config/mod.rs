use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub redirect_server: ServerConfig,
    pub api_server: ServerConfig,
    pub cache: CacheConfig,
    pub analytics: AnalyticsConfig,
    pub webhooks: WebhookConfig,
    pub enrichment: EnrichmentConfig,
    pub rate_limit: RateLimitConfig,
    pub events: EventBusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_entries: u64,
    /// Links with at least this many clicks get the long TTL.
    pub hot_threshold: i64,
    pub hot_ttl_secs: u64,
    pub cold_ttl_secs: u64,
    pub analytics_ttl_secs: u64,
    /// Debounce window for click-driven cache invalidation.
    pub invalidation_debounce_ms: u64,
    /// Keys deleted per batch during pattern invalidation.
    pub pattern_delete_chunk: usize,
    pub pattern_delete_pause_ms: u64,
    /// Best-effort drain budget for the shutdown flush.
    pub shutdown_flush_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    /// Row-count cutoff above which queries switch to storage-side
    /// grouped aggregation.
    pub aggregation_threshold: i64,
    pub export_batch_size: i64,
    pub export_max_records: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    /// Delay before the retry following attempt N, indexed by N-1.
    pub backoff_secs: Vec<u64>,
    pub response_snippet_bytes: usize,
}

impl WebhookConfig {
    pub fn backoff_after_attempt(&self, attempt: u32) -> std::time::Duration {
        let idx = (attempt.saturating_sub(1)) as usize;
        let secs = self
            .backoff_secs
            .get(idx)
            .or_else(|| self.backoff_secs.last())
            .copied()
            .unwrap_or(1);
        std::time::Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustedProxyMode {
    /// Only the socket address is trusted.
    None,
    /// Standard Forwarded / X-Forwarded-For headers.
    Standard,
    /// CF-Connecting-IP from Cloudflare.
    Cloudflare,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    pub geoip_city_db: Option<String>,
    pub trusted_proxy_mode: TrustedProxyMode,
    /// CIDR ranges treated as trusted proxy hops in X-Forwarded-For chains.
    pub trusted_proxies: Vec<ipnet::IpNet>,
    pub num_trusted_proxies: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_failures: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    pub capacity: usize,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://./shunt.db".to_string());

        let trusted_proxy_mode = match std::env::var("TRUSTED_PROXY_MODE")
            .unwrap_or_else(|_| "none".to_string())
            .to_lowercase()
            .as_str()
        {
            "standard" => TrustedProxyMode::Standard,
            "cloudflare" => TrustedProxyMode::Cloudflare,
            "none" => TrustedProxyMode::None,
            other => {
                tracing::warn!(
                    "Unknown TRUSTED_PROXY_MODE '{other}', falling back to 'none'. \
                     Supported values: none, standard, cloudflare"
                );
                TrustedProxyMode::None
            }
        };

        let backoff_secs = std::env::var("WEBHOOK_BACKOFF_SECS")
            .ok()
            .map(|v| {
                v.split(',')
                    .filter_map(|s| s.trim().parse::<u64>().ok())
                    .collect::<Vec<_>>()
            })
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| vec![1, 5, 15]);

        Ok(Config {
            database: DatabaseConfig {
                url: database_url,
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 5),
            },
            redirect_server: ServerConfig {
                host: std::env::var("REDIRECT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: env_or("REDIRECT_PORT", 3000),
            },
            api_server: ServerConfig {
                host: std::env::var("API_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: env_or("API_PORT", 8080),
            },
            cache: CacheConfig {
                max_entries: env_or("CACHE_MAX_ENTRIES", 100_000),
                hot_threshold: env_or("CACHE_HOT_THRESHOLD", 1_000),
                hot_ttl_secs: env_or("CACHE_HOT_TTL_SECS", 24 * 3600),
                cold_ttl_secs: env_or("CACHE_COLD_TTL_SECS", 2 * 3600),
                analytics_ttl_secs: env_or("CACHE_ANALYTICS_TTL_SECS", 30 * 60),
                invalidation_debounce_ms: env_or("CACHE_INVALIDATION_DEBOUNCE_MS", 5_000),
                pattern_delete_chunk: env_or("CACHE_PATTERN_DELETE_CHUNK", 50),
                pattern_delete_pause_ms: env_or("CACHE_PATTERN_DELETE_PAUSE_MS", 10),
                shutdown_flush_timeout_ms: env_or("CACHE_SHUTDOWN_FLUSH_TIMEOUT_MS", 3_000),
            },
            analytics: AnalyticsConfig {
                aggregation_threshold: env_or("ANALYTICS_AGGREGATION_THRESHOLD", 10_000),
                export_batch_size: env_or("EXPORT_BATCH_SIZE", 500),
                export_max_records: env_or("EXPORT_MAX_RECORDS", 10_000),
            },
            webhooks: WebhookConfig {
                request_timeout_secs: env_or("WEBHOOK_TIMEOUT_SECS", 10),
                max_attempts: env_or("WEBHOOK_MAX_ATTEMPTS", 3),
                backoff_secs,
                response_snippet_bytes: env_or("WEBHOOK_RESPONSE_SNIPPET_BYTES", 512),
            },
            enrichment: EnrichmentConfig {
                geoip_city_db: std::env::var("GEOIP_CITY_DB").ok(),
                trusted_proxy_mode,
                trusted_proxies: std::env::var("TRUSTED_PROXIES")
                    .ok()
                    .map(|v| {
                        v.split(',')
                            .filter_map(|s| s.trim().parse::<ipnet::IpNet>().ok())
                            .collect()
                    })
                    .unwrap_or_default(),
                num_trusted_proxies: std::env::var("NUM_TRUSTED_PROXIES")
                    .ok()
                    .and_then(|v| v.parse().ok()),
            },
            rate_limit: RateLimitConfig {
                max_failures: env_or("PASSWORD_MAX_FAILURES", 5),
                window_secs: env_or("PASSWORD_FAILURE_WINDOW_SECS", 900),
            },
            events: EventBusConfig {
                capacity: env_or("EVENT_BUS_CAPACITY", 1_024),
            },
        })
    }
}
