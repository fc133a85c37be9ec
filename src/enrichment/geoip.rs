//! Coarse IP geolocation using a MaxMind GeoLite2/GeoIP2 City database.
//!
//! Lookups are read-only against a memory-mapped file and never fail the
//! caller: an unresolvable IP simply yields an empty `GeoInfo`.

use anyhow::{Context, Result};
use maxminddb::{geoip2, Mmap, Reader};
use std::net::IpAddr;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeoInfo {
    /// ISO country code (e.g. "US", "DE").
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
}

pub struct GeoIpService {
    city_reader: Option<Arc<Reader<Mmap>>>,
}

impl GeoIpService {
    /// Open a memory-mapped City database. `None` disables geolocation.
    pub fn new(city_path: Option<&str>) -> Result<Self> {
        let city_reader = if let Some(path) = city_path {
            let reader = unsafe { Reader::open_mmap(path) }
                .with_context(|| format!("Failed to open GeoIP City database at {}", path))?;
            Some(Arc::new(reader))
        } else {
            None
        };

        Ok(Self { city_reader })
    }

    /// A service with no database; every lookup yields an empty `GeoInfo`.
    pub fn disabled() -> Self {
        Self { city_reader: None }
    }

    pub fn lookup(&self, ip: IpAddr) -> GeoInfo {
        let mut geo = GeoInfo::default();

        if let Some(ref reader) = self.city_reader {
            if let Ok(result) = reader.lookup(ip) {
                if let Ok(Some(city)) = result.decode::<geoip2::City>() {
                    extract_from_city(&city, &mut geo);
                } else if let Ok(Some(country)) = result.decode::<geoip2::Country>() {
                    // Country records work against any GeoIP2 database since
                    // City data is a superset of Country data.
                    geo.country = country.country.iso_code.map(|s| s.to_string());
                }
            }
        }

        geo
    }
}

fn extract_from_city(city: &geoip2::City, geo: &mut GeoInfo) {
    geo.country = city.country.iso_code.map(|s| s.to_string());

    if let Some(subdivision) = city.subdivisions.first() {
        geo.region = subdivision.names.english.map(|s| s.to_string());
    }

    geo.city = city.city.names.english.map(|s| s.to_string());
}

impl Clone for GeoIpService {
    fn clone(&self) -> Self {
        Self {
            city_reader: self.city_reader.clone(),
        }
    }
}
