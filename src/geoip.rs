use std::net::IpAddr;
use std::path::Path;

use maxminddb::geoip2;
use tracing::info;

/// City-level lookup result. Empty strings mean the database had no data
/// for the field; callers treat them as gaps to leave untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CityInfo {
    pub country_code: String,
    pub country_name: String,
    pub city: String,
    pub region: String,
    pub continent_code: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AsnInfo {
    pub number: i64,
    pub name: String,
    pub organization: String,
}

/// Reader over the MaxMind city and ASN databases. Either database may be
/// absent; lookups against a missing database return empty results.
pub struct GeoReader {
    city: Option<maxminddb::Reader<Vec<u8>>>,
    asn: Option<maxminddb::Reader<Vec<u8>>>,
}

impl GeoReader {
    /// Open whichever databases exist at the given paths. Returns `None`
    /// when neither is available so callers can skip enrichment entirely.
    pub fn load(city_path: &str, asn_path: &str) -> anyhow::Result<Option<GeoReader>> {
        let city = open_if_present(city_path)?;
        let asn = open_if_present(asn_path)?;

        if city.is_none() && asn.is_none() {
            return Ok(None);
        }

        info!(
            "geoip loaded (city: {}, asn: {})",
            city.is_some(),
            asn.is_some()
        );
        Ok(Some(GeoReader { city, asn }))
    }

    /// ISO-2 country code for an IP, empty when unknown.
    pub fn lookup_country(&self, ip: &str) -> String {
        let Some(reader) = &self.city else {
            return String::new();
        };
        let Ok(parsed) = ip.parse::<IpAddr>() else {
            return String::new();
        };

        if let Ok(record) = reader.lookup::<geoip2::City>(parsed) {
            if let Some(code) = record.country.and_then(|c| c.iso_code) {
                return code.to_string();
            }
        }
        String::new()
    }

    pub fn lookup_city(&self, ip: &str) -> CityInfo {
        let Some(reader) = &self.city else {
            return CityInfo::default();
        };
        let Ok(parsed) = ip.parse::<IpAddr>() else {
            return CityInfo::default();
        };
        let Ok(record) = reader.lookup::<geoip2::City>(parsed) else {
            return CityInfo::default();
        };

        let mut info = CityInfo::default();
        if let Some(country) = record.country {
            info.country_code = country.iso_code.unwrap_or_default().to_string();
            info.country_name = english_name(country.names);
        }
        if let Some(city) = record.city {
            info.city = english_name(city.names);
        }
        if let Some(continent) = record.continent {
            info.continent_code = continent.code.unwrap_or_default().to_string();
        }
        if let Some(subdivisions) = record.subdivisions {
            if let Some(region) = subdivisions.into_iter().next() {
                info.region = english_name(region.names);
            }
        }
        info
    }

    pub fn lookup_asn(&self, ip: &str) -> AsnInfo {
        let Some(reader) = &self.asn else {
            return AsnInfo::default();
        };
        let Ok(parsed) = ip.parse::<IpAddr>() else {
            return AsnInfo::default();
        };
        let Ok(record) = reader.lookup::<geoip2::Asn>(parsed) else {
            return AsnInfo::default();
        };

        let org = record
            .autonomous_system_organization
            .unwrap_or_default()
            .to_string();
        AsnInfo {
            number: record.autonomous_system_number.unwrap_or(0) as i64,
            name: org.clone(),
            organization: org,
        }
    }
}

fn open_if_present(path: &str) -> anyhow::Result<Option<maxminddb::Reader<Vec<u8>>>> {
    if path.is_empty() || !Path::new(path).is_file() {
        return Ok(None);
    }
    Ok(Some(maxminddb::Reader::open_readfile(path)?))
}

fn english_name(names: Option<std::collections::BTreeMap<&str, &str>>) -> String {
    names
        .and_then(|names| names.get("en").copied())
        .unwrap_or_default()
        .to_string()
}
