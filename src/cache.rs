use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, warn};

use crate::store::ProxyListFilters;

/// Sentinel key holding the monotonic cache epoch. Bumping it makes every
/// older versioned key unreachable without issuing a single delete.
const VERSION_KEY: &str = "proxylist:version";

/// Unix seconds of the last successful catalog sync.
const LAST_SYNC_KEY: &str = "proxylist:last_sync";

/// Versioned cache of serialized query responses. Every reader snapshots
/// the epoch once at request start and derives all keys from the snapshot,
/// so a sync completing mid-request never mixes old and new data.
#[derive(Clone)]
pub struct ResponseCache {
    conn: ConnectionManager,
}

impl ResponseCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Current cache epoch, `"0"` until the first sync completes.
    pub async fn version(&self) -> String {
        let mut conn = self.conn.clone();
        match conn.get::<_, Option<String>>(VERSION_KEY).await {
            Ok(Some(version)) if !version.is_empty() => version,
            Ok(_) => "0".to_string(),
            Err(e) => {
                warn!("cache version read failed: {}", e);
                "0".to_string()
            }
        }
    }

    /// Bump the epoch; called by the sync pipeline after a successful run.
    pub async fn bump_version(&self) -> anyhow::Result<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(VERSION_KEY, 1).await?)
    }

    pub async fn last_sync(&self) -> Option<DateTime<Utc>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(LAST_SYNC_KEY).await.ok()?;
        let ts: i64 = raw?.parse().ok()?;
        if ts <= 0 {
            return None;
        }
        Utc.timestamp_opt(ts, 0).single()
    }

    pub async fn set_last_sync(&self, at: DateTime<Utc>) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(LAST_SYNC_KEY, at.timestamp()).await?;
        Ok(())
    }

    /// Age of the cached catalog in whole seconds, 0 when unknown.
    pub async fn cache_age_seconds(&self) -> i64 {
        match self.last_sync().await {
            Some(at) => (Utc::now() - at).num_seconds().max(0),
            None => 0,
        }
    }

    pub async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .is_ok()
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut conn = self.conn.clone();
        match conn.get::<_, Option<Vec<u8>>>(key).await {
            Ok(Some(bytes)) if !bytes.is_empty() => Some(bytes),
            Ok(_) => None,
            Err(e) => {
                debug!("cache get failed for {}: {}", key, e);
                None
            }
        }
    }

    /// Best-effort write; a cache failure never fails the request.
    pub async fn set(&self, key: &str, value: &[u8], ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let mut conn = self.conn.clone();
        if let Err(e) = conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await {
            warn!("cache set failed for {}: {}", key, e);
        }
    }
}

/// Cache key for a filtered list response. The filter projection is a
/// fixed-order colon join with `-` placeholders, not a query-string
/// encoding, so keys stay stable across clients and locales.
pub fn list_key(filters: &ProxyListFilters, authenticated: bool, version: &str) -> String {
    let scope = if authenticated { "api" } else { "web" };
    format!(
        "proxylist:v:{}:list:{}:{}:{}:{}:{}:{}:{}:{}:{}:{}",
        normalize_version(version),
        scope,
        key_part(&filters.country_code),
        key_part(&filters.protocol),
        key_int(filters.port, false),
        key_part(&filters.anonymity),
        key_part(&filters.city),
        key_part(&filters.region),
        key_int(filters.asn, false),
        key_int(filters.limit, true),
        key_int(filters.offset, true),
    )
}

pub fn stats_key(version: &str) -> String {
    format!("proxylist:v:{}:stats", normalize_version(version))
}

pub fn recent_key(limit: i64, version: &str) -> String {
    format!("proxylist:v:{}:recent:{}", normalize_version(version), limit)
}

pub fn facets_key(facet_type: &str, limit: i64, offset: i64, version: &str) -> String {
    format!(
        "proxylist:v:{}:facets:{}:{}:{}",
        normalize_version(version),
        facet_type,
        limit,
        offset
    )
}

fn normalize_version(version: &str) -> &str {
    if version.is_empty() {
        "0"
    } else {
        version
    }
}

fn key_part(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        return "-".to_string();
    }
    escape_part(value)
}

fn key_int(value: i64, allow_zero: bool) -> String {
    if value == 0 && allow_zero {
        return "0".to_string();
    }
    if value <= 0 {
        return "-".to_string();
    }
    value.to_string()
}

/// Percent-encode anything outside the unreserved set so a value can never
/// smuggle a `:` into the key structure.
fn escape_part(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'~' | b'-' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
