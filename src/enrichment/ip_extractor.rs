//! Client IP extraction from HTTP headers with trust validation
//!
//! Supports vendor-specific headers (CF-Connecting-IP), RFC 7239 Forwarded,
//! and X-Forwarded-For with right-to-left trust-chain validation, falling
//! back to the socket remote address when headers are untrusted.

use axum::http::HeaderMap;
use std::net::IpAddr;
use tracing::warn;

use crate::config::{EnrichmentConfig, TrustedProxyMode};

/// Extract the client IP address according to the trust configuration.
pub fn extract_client_ip(
    headers: &HeaderMap,
    socket_addr: IpAddr,
    config: &EnrichmentConfig,
) -> IpAddr {
    match config.trusted_proxy_mode {
        TrustedProxyMode::Cloudflare => extract_cloudflare_ip(headers).unwrap_or_else(|| {
            warn!("CF-Connecting-IP header missing in Cloudflare mode, using socket address");
            socket_addr
        }),
        TrustedProxyMode::Standard => {
            extract_standard_ip(headers, config).unwrap_or(socket_addr)
        }
        TrustedProxyMode::None => socket_addr,
    }
}

fn extract_cloudflare_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("cf-connecting-ip")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.parse::<IpAddr>().ok())
}

fn extract_standard_ip(headers: &HeaderMap, config: &EnrichmentConfig) -> Option<IpAddr> {
    // Prefer RFC 7239 Forwarded, fall back to X-Forwarded-For.
    if let Some(ip) = extract_from_forwarded(headers) {
        return Some(ip);
    }
    extract_from_x_forwarded_for(headers, config)
}

/// Parse `Forwarded: for=192.0.2.60;proto=http;by=203.0.113.43`.
fn extract_from_forwarded(headers: &HeaderMap) -> Option<IpAddr> {
    let forwarded = headers.get("forwarded")?.to_str().ok()?;

    for element in forwarded.split(',') {
        for param in element.split(';') {
            let param = param.trim();
            if let Some(value) = param.strip_prefix("for=") {
                // Strip quotes, brackets, and port.
                let ip_str = value
                    .trim_matches('"')
                    .trim_start_matches('[')
                    .split(']')
                    .next()
                    .unwrap_or(value)
                    .split(':')
                    .next()
                    .unwrap_or(value);

                if let Ok(ip) = ip_str.parse::<IpAddr>() {
                    return Some(ip);
                }
            }
        }
    }

    None
}

/// Parse X-Forwarded-For with right-to-left trust validation.
fn extract_from_x_forwarded_for(headers: &HeaderMap, config: &EnrichmentConfig) -> Option<IpAddr> {
    let xff = headers.get("x-forwarded-for")?.to_str().ok()?;

    let ips: Vec<IpAddr> = xff
        .split(',')
        .filter_map(|s| s.trim().parse::<IpAddr>().ok())
        .collect();

    if ips.is_empty() {
        return None;
    }

    // Fixed number of trusted hops: skip that many from the right.
    if let Some(num_trusted) = config.num_trusted_proxies {
        if ips.len() > num_trusted {
            return Some(ips[ips.len() - num_trusted - 1]);
        }
        // Not enough IPs in the chain; return the leftmost (least trusted).
        return ips.first().copied();
    }

    // CIDR trust list: walk right to left, return the first untrusted hop.
    if !config.trusted_proxies.is_empty() {
        for ip in ips.iter().rev() {
            if !config.trusted_proxies.iter().any(|net| net.contains(ip)) {
                return Some(*ip);
            }
        }
        // Every hop was a trusted proxy.
        return ips.first().copied();
    }

    // No trust configuration: only the rightmost hop is believable.
    ips.last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn config(mode: TrustedProxyMode) -> EnrichmentConfig {
        EnrichmentConfig {
            geoip_city_db: None,
            trusted_proxy_mode: mode,
            trusted_proxies: vec![],
            num_trusted_proxies: None,
        }
    }

    #[test]
    fn none_mode_uses_socket_address() {
        let headers = HeaderMap::new();
        let socket: IpAddr = "192.168.1.1".parse().unwrap();
        assert_eq!(
            extract_client_ip(&headers, socket, &config(TrustedProxyMode::None)),
            socket
        );
    }

    #[test]
    fn cloudflare_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert("cf-connecting-ip", HeaderValue::from_static("203.0.113.1"));
        let socket: IpAddr = "192.168.1.1".parse().unwrap();
        assert_eq!(
            extract_client_ip(&headers, socket, &config(TrustedProxyMode::Cloudflare)),
            "203.0.113.1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn xff_without_trust_config_uses_rightmost() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.1, 198.51.100.1"),
        );
        let socket: IpAddr = "192.168.1.1".parse().unwrap();
        assert_eq!(
            extract_client_ip(&headers, socket, &config(TrustedProxyMode::Standard)),
            "198.51.100.1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn xff_with_trusted_hop_count() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.1, 198.51.100.1"),
        );
        let socket: IpAddr = "192.168.1.1".parse().unwrap();
        let mut cfg = config(TrustedProxyMode::Standard);
        cfg.num_trusted_proxies = Some(1);
        assert_eq!(
            extract_client_ip(&headers, socket, &cfg),
            "203.0.113.1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn xff_with_cidr_trust_list_skips_trusted_hops() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.1, 10.0.0.7, 10.0.1.9"),
        );
        let socket: IpAddr = "192.168.1.1".parse().unwrap();
        let mut cfg = config(TrustedProxyMode::Standard);
        cfg.trusted_proxies = vec!["10.0.0.0/8".parse().unwrap()];
        assert_eq!(
            extract_client_ip(&headers, socket, &cfg),
            "203.0.113.1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn forwarded_header_preferred() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "forwarded",
            HeaderValue::from_static("for=192.0.2.60;proto=http"),
        );
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.1"));
        let socket: IpAddr = "192.168.1.1".parse().unwrap();
        assert_eq!(
            extract_client_ip(&headers, socket, &config(TrustedProxyMode::Standard)),
            "192.0.2.60".parse::<IpAddr>().unwrap()
        );
    }
}
