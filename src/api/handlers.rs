use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use hyper::header::VARY;
use hyper::{Body, Response, StatusCode};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error};

use crate::api::rate_limit::{require_api_key, RateHeaders};
use crate::api::respond::{
    apply_etag, build_list_etag, error_response, json_response, raw_json_response,
    set_cache_control,
};
use crate::api::validators::{
    parse_asn, parse_limit, parse_offset, parse_port, sanitize_anonymity, sanitize_country,
    sanitize_label, sanitize_protocol,
};
use crate::api::{AppContext, RequestContext};
use crate::cache;
use crate::error::ApiError;
use crate::metrics::ServiceMetrics;
use crate::rate_limiter::{window_reset, Tier};
use crate::store::{ProxyListFilters, ProxyListRecord};

const STATS_CACHE_TTL: std::time::Duration = std::time::Duration::from_secs(60);
const RECENT_CACHE_TTL: std::time::Duration = std::time::Duration::from_secs(30);

/// Wire shape of one catalog row.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyListItem {
    pub host: String,
    pub ip: String,
    pub port: i64,
    pub delay: i64,
    pub country_code: String,
    pub country_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub city: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub asn: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub asn_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub org: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub continent_code: String,
    pub checks_up: i64,
    pub checks_down: i64,
    pub anon: i64,
    pub http: i64,
    pub ssl: i64,
    pub socks4: i64,
    pub socks5: i64,
    pub protocols: Vec<String>,
    pub anonymity_level: String,
    pub uptime: i64,
    pub last_seen: String,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

pub fn transform_record(record: &ProxyListRecord) -> ProxyListItem {
    let mut protocols = Vec::with_capacity(4);
    if record.http == 1 {
        protocols.push("HTTP".to_string());
    }
    if record.ssl == 1 {
        protocols.push("HTTPS".to_string());
    }
    if record.socks4 == 1 {
        protocols.push("SOCKS4".to_string());
    }
    if record.socks5 == 1 {
        protocols.push("SOCKS5".to_string());
    }

    let anonymity_level = match record.anon {
        0 | 1 => "Transparent",
        2 | 3 => "Anonymous",
        4 | 5 => "Elite",
        _ => "Unknown",
    }
    .to_string();

    let total_checks = record.checks_up + record.checks_down;
    let uptime = if total_checks > 0 {
        (record.checks_up as f64 / total_checks as f64 * 100.0) as i64
    } else {
        0
    };

    let last_seen = record
        .last_seen
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default();

    ProxyListItem {
        host: record.host.clone(),
        ip: record.ip.clone(),
        port: record.port,
        delay: record.delay,
        country_code: record.country_code.clone(),
        country_name: record.country_name.clone(),
        city: record.city.clone(),
        region: record.region.clone(),
        asn: record.asn,
        asn_name: record.asn_name.clone(),
        org: record.org.clone(),
        continent_code: record.continent_code.clone(),
        checks_up: record.checks_up,
        checks_down: record.checks_down,
        anon: record.anon,
        http: record.http,
        ssl: record.ssl,
        socks4: record.socks4,
        socks5: record.socks5,
        protocols,
        anonymity_level,
        uptime,
        last_seen,
    }
}

pub fn build_filters(rc: &RequestContext, limit_default: i64, limit_max: i64) -> ProxyListFilters {
    let q = |name: &str| rc.query.get(name).map(String::as_str).unwrap_or("");
    ProxyListFilters {
        country_code: sanitize_country(q("country")),
        protocol: sanitize_protocol(q("protocol")),
        port: parse_port(q("port")),
        anonymity: sanitize_anonymity(q("anonymity")),
        city: sanitize_label(q("city")),
        region: sanitize_label(q("region")),
        asn: parse_asn(q("asn")),
        limit: parse_limit(q("limit"), limit_default, limit_max),
        offset: parse_offset(q("offset")),
        since: None,
    }
}

/// Epoch snapshot taken once at the start of a request; every cache key
/// the request builds uses this snapshot.
struct CacheView {
    version: String,
    cache_age: i64,
    last_sync: String,
}

async fn cache_view(ctx: &AppContext) -> Option<CacheView> {
    let cache = ctx.cache.as_ref()?;
    let version = cache.version().await;
    let cache_age = cache.cache_age_seconds().await;
    let last_sync = cache
        .last_sync()
        .await
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default();
    Some(CacheView {
        version,
        cache_age,
        last_sync,
    })
}

fn overlay_cached_meta(payload: &mut serde_json::Value, view: &CacheView) {
    if let Some(meta) = payload.get_mut("meta").and_then(|m| m.as_object_mut()) {
        meta.insert("cached".to_string(), json!(true));
        meta.insert("cache_age".to_string(), json!(view.cache_age));
        if !view.last_sync.is_empty() {
            meta.insert("last_sync".to_string(), json!(view.last_sync));
        }
    }
}

pub async fn proxy_list_public(
    ctx: &AppContext,
    rc: &RequestContext,
) -> Result<Response<Body>, ApiError> {
    proxy_list(ctx, rc, false).await
}

pub async fn proxy_list_auth(
    ctx: &AppContext,
    rc: &RequestContext,
) -> Result<Response<Body>, ApiError> {
    let api_key = require_api_key(&rc.headers, &ctx.cfg.api_keys)?;

    let subject = format!("apikey:{}", api_key);
    let (allowed, count) = ctx
        .api_key_limiter
        .allow_tier(&subject, Tier::Free)
        .await
        .map_err(|_| ApiError::RateLimiterUnavailable)?;

    let limit = ctx.cfg.api_rate_limit_hour;
    let rate_headers = RateHeaders {
        limit,
        remaining: (limit - count).max(0),
        reset: window_reset(ctx.api_key_limiter.window()),
    };

    if !allowed {
        ServiceMetrics::incr(&ctx.metrics.requests_rate_limited);
        let mut resp = error_response(
            &ApiError::RateLimited { limit, used: count },
            &rc.request_id,
            &rc.path,
        );
        rate_headers.apply(resp.headers_mut());
        return Ok(resp);
    }

    let mut resp = proxy_list(ctx, rc, true).await?;
    rate_headers.apply(resp.headers_mut());
    Ok(resp)
}

async fn proxy_list(
    ctx: &AppContext,
    rc: &RequestContext,
    authenticated: bool,
) -> Result<Response<Body>, ApiError> {
    let mut filters = build_filters(rc, 25, 100);
    if ctx.cfg.proxy_list_window_hours > 0 {
        filters.since = Some(Utc::now() - ChronoDuration::hours(ctx.cfg.proxy_list_window_hours));
    }

    let ttl = if authenticated {
        ctx.cfg.proxy_api_cache_ttl
    } else {
        ctx.cfg.proxy_web_cache_ttl
    };
    let view = cache_view(ctx).await;
    let (cache_age, last_sync) = match &view {
        Some(view) => (view.cache_age, view.last_sync.clone()),
        None => (0, String::new()),
    };

    if let (Some(cache), Some(view)) = (&ctx.cache, &view) {
        if !ttl.is_zero() {
            let key = cache::list_key(&filters, authenticated, &view.version);
            if let Some(bytes) = cache.get(&key).await {
                if let Ok(mut payload) = serde_json::from_slice::<serde_json::Value>(&bytes) {
                    ServiceMetrics::incr(&ctx.metrics.cache_hits);
                    debug!("proxylist list cache hit key={}", key);
                    overlay_cached_meta(&mut payload, view);

                    let total = payload["meta"]["total"].as_i64().unwrap_or(0);
                    let etag = build_list_etag(
                        &payload["data"],
                        total,
                        filters.limit,
                        filters.offset,
                        &last_sync,
                    );
                    let mut resp =
                        raw_json_response(StatusCode::OK, payload.to_string().into_bytes());
                    set_cache_control(resp.headers_mut(), ttl, !authenticated);
                    if authenticated {
                        resp.headers_mut()
                            .insert(VARY, hyper::header::HeaderValue::from_static("Authorization"));
                    }
                    return Ok(apply_etag(resp, &etag, &rc.headers));
                }
            }
            ServiceMetrics::incr(&ctx.metrics.cache_misses);
            debug!("proxylist list cache miss key={}", key);
        }
    }

    // Public admission happens after a cache miss; cached pages are cheap
    // enough to serve to anyone.
    let mut rate_headers = RateHeaders::default();
    if !authenticated {
        let (allowed, count) = ctx
            .public_limiter
            .allow(&rc.client_ip)
            .await
            .map_err(|e| {
                error!("rate limiter error for {}: {}", rc.client_ip, e);
                ApiError::RateLimiterUnavailable
            })?;
        let limit = ctx.cfg.rate_limit_per_day;
        rate_headers = RateHeaders {
            limit,
            remaining: (limit - count).max(0),
            reset: window_reset(ctx.public_limiter.window()),
        };
        if !allowed {
            ServiceMetrics::incr(&ctx.metrics.requests_rate_limited);
            let mut resp = error_response(
                &ApiError::RateLimited { limit, used: count },
                &rc.request_id,
                &rc.path,
            );
            rate_headers.apply(resp.headers_mut());
            return Ok(resp);
        }
    }

    let (records, total) = ctx
        .store
        .list_proxy_list(filters.clone())
        .await
        .map_err(|e| {
            error!("failed to list proxies: {}", e);
            ApiError::Database("failed to load proxies".to_string())
        })?;

    let data: Vec<ProxyListItem> = records.iter().map(transform_record).collect();
    let mut meta = json!({
        "total": total,
        "limit": filters.limit,
        "offset": filters.offset,
        "cached": false,
        "cache_age": cache_age,
    });
    if !last_sync.is_empty() {
        meta["last_sync"] = json!(last_sync);
    }
    let payload = json!({"data": data, "meta": meta});
    let body = payload.to_string().into_bytes();

    if let (Some(cache), Some(view)) = (&ctx.cache, &view) {
        cache
            .set(&cache::list_key(&filters, authenticated, &view.version), &body, ttl)
            .await;
    }

    let etag = build_list_etag(&payload["data"], total, filters.limit, filters.offset, &last_sync);
    let mut resp = raw_json_response(StatusCode::OK, body);
    set_cache_control(resp.headers_mut(), ttl, !authenticated);
    if authenticated {
        resp.headers_mut()
            .insert(VARY, hyper::header::HeaderValue::from_static("Authorization"));
    }
    rate_headers.apply(resp.headers_mut());
    Ok(apply_etag(resp, &etag, &rc.headers))
}

pub async fn proxy_stats(
    ctx: &AppContext,
    _rc: &RequestContext,
) -> Result<Response<Body>, ApiError> {
    let view = cache_view(ctx).await;

    if let (Some(cache), Some(view)) = (&ctx.cache, &view) {
        let key = cache::stats_key(&view.version);
        if let Some(bytes) = cache.get(&key).await {
            if let Ok(mut payload) = serde_json::from_slice::<serde_json::Value>(&bytes) {
                ServiceMetrics::incr(&ctx.metrics.cache_hits);
                overlay_cached_meta(&mut payload, view);
                let mut resp = raw_json_response(StatusCode::OK, payload.to_string().into_bytes());
                set_cache_control(resp.headers_mut(), STATS_CACHE_TTL, true);
                return Ok(resp);
            }
        }
        ServiceMetrics::incr(&ctx.metrics.cache_misses);
    }

    let stats = ctx.store.proxy_stats().await.map_err(|e| {
        error!("failed to load proxy stats: {}", e);
        ApiError::Database("failed to load proxy stats".to_string())
    })?;

    let mut meta = json!({"cached": false, "cache_age": view.as_ref().map(|v| v.cache_age).unwrap_or(0)});
    if let Some(view) = &view {
        if !view.last_sync.is_empty() {
            meta["last_sync"] = json!(view.last_sync);
        }
    }
    let payload = json!({"data": stats, "meta": meta});
    let body = payload.to_string().into_bytes();

    if let (Some(cache), Some(view)) = (&ctx.cache, &view) {
        cache.set(&cache::stats_key(&view.version), &body, STATS_CACHE_TTL).await;
    }

    let mut resp = raw_json_response(StatusCode::OK, body);
    set_cache_control(resp.headers_mut(), STATS_CACHE_TTL, true);
    Ok(resp)
}

pub async fn proxy_recent(
    ctx: &AppContext,
    rc: &RequestContext,
) -> Result<Response<Body>, ApiError> {
    let limit = parse_limit(
        rc.query.get("limit").map(String::as_str).unwrap_or(""),
        10,
        50,
    );
    let view = cache_view(ctx).await;

    if let (Some(cache), Some(view)) = (&ctx.cache, &view) {
        let key = cache::recent_key(limit, &view.version);
        if let Some(bytes) = cache.get(&key).await {
            if let Ok(mut payload) = serde_json::from_slice::<serde_json::Value>(&bytes) {
                ServiceMetrics::incr(&ctx.metrics.cache_hits);
                overlay_cached_meta(&mut payload, view);
                let mut resp = raw_json_response(StatusCode::OK, payload.to_string().into_bytes());
                set_cache_control(resp.headers_mut(), RECENT_CACHE_TTL, true);
                return Ok(resp);
            }
        }
        ServiceMetrics::incr(&ctx.metrics.cache_misses);
    }

    let records = ctx.store.list_recent_proxies(limit).await.map_err(|e| {
        error!("failed to load recent proxies: {}", e);
        ApiError::Database("failed to load recent proxies".to_string())
    })?;
    let data: Vec<ProxyListItem> = records.iter().map(transform_record).collect();

    let mut meta = json!({
        "limit": limit,
        "cached": false,
        "cache_age": view.as_ref().map(|v| v.cache_age).unwrap_or(0),
    });
    if let Some(view) = &view {
        if !view.last_sync.is_empty() {
            meta["last_sync"] = json!(view.last_sync);
        }
    }
    let payload = json!({"data": data, "meta": meta});
    let body = payload.to_string().into_bytes();

    if let (Some(cache), Some(view)) = (&ctx.cache, &view) {
        cache.set(&cache::recent_key(limit, &view.version), &body, RECENT_CACHE_TTL).await;
    }

    let mut resp = raw_json_response(StatusCode::OK, body);
    set_cache_control(resp.headers_mut(), RECENT_CACHE_TTL, true);
    Ok(resp)
}

/// Random sample; deliberately never cached.
pub async fn proxy_random(
    ctx: &AppContext,
    rc: &RequestContext,
) -> Result<Response<Body>, ApiError> {
    let limit = parse_limit(
        rc.query.get("limit").map(String::as_str).unwrap_or(""),
        10,
        50,
    );

    let records = ctx.store.list_random_proxies(limit).await.map_err(|e| {
        error!("failed to load random proxies: {}", e);
        ApiError::Database("failed to load random proxies".to_string())
    })?;
    let data: Vec<ProxyListItem> = records.iter().map(transform_record).collect();

    let cache_age = match cache_view(ctx).await {
        Some(view) => view.cache_age,
        None => 0,
    };
    let payload = json!({
        "data": data,
        "meta": {"limit": limit, "cached": false, "cache_age": cache_age},
    });
    Ok(json_response(StatusCode::OK, &payload))
}

pub async fn proxy_facets(
    ctx: &AppContext,
    rc: &RequestContext,
    facet_type: &str,
) -> Result<Response<Body>, ApiError> {
    let limit = parse_limit(
        rc.query.get("limit").map(String::as_str).unwrap_or(""),
        200,
        5000,
    );
    let offset = parse_offset(rc.query.get("offset").map(String::as_str).unwrap_or(""));
    let ttl = ctx.cfg.proxy_web_cache_ttl;
    let view = cache_view(ctx).await;

    if let (Some(cache), Some(view)) = (&ctx.cache, &view) {
        if !ttl.is_zero() {
            let key = cache::facets_key(facet_type, limit, offset, &view.version);
            if let Some(bytes) = cache.get(&key).await {
                if let Ok(mut payload) = serde_json::from_slice::<serde_json::Value>(&bytes) {
                    ServiceMetrics::incr(&ctx.metrics.cache_hits);
                    overlay_cached_meta(&mut payload, view);
                    let mut resp =
                        raw_json_response(StatusCode::OK, payload.to_string().into_bytes());
                    set_cache_control(resp.headers_mut(), ttl, true);
                    return Ok(resp);
                }
            }
            ServiceMetrics::incr(&ctx.metrics.cache_misses);
        }
    }

    let facets = ctx
        .store
        .list_proxy_facets(facet_type, limit, offset)
        .await
        .map_err(|e| {
            error!("failed to load facets: {}", e);
            ApiError::Database("failed to load facets".to_string())
        })?;
    let total = ctx.store.count_proxy_facets(facet_type).await.map_err(|e| {
        error!("failed to count facets: {}", e);
        ApiError::Database("failed to load facets".to_string())
    })?;

    let mut meta = json!({
        "total": total,
        "limit": limit,
        "offset": offset,
        "cached": false,
        "cache_age": view.as_ref().map(|v| v.cache_age).unwrap_or(0),
    });
    if let Some(view) = &view {
        if !view.last_sync.is_empty() {
            meta["last_sync"] = json!(view.last_sync);
        }
    }
    let payload = json!({"data": facets, "meta": meta});
    let body = payload.to_string().into_bytes();

    if let (Some(cache), Some(view)) = (&ctx.cache, &view) {
        cache
            .set(&cache::facets_key(facet_type, limit, offset, &view.version), &body, ttl)
            .await;
    }

    let mut resp = raw_json_response(StatusCode::OK, body);
    set_cache_control(resp.headers_mut(), ttl, true);
    Ok(resp)
}

pub async fn asn_details(
    ctx: &AppContext,
    _rc: &RequestContext,
    asn_param: &str,
) -> Result<Response<Body>, ApiError> {
    let asn: i64 = asn_param
        .trim()
        .parse()
        .ok()
        .filter(|asn| *asn > 0)
        .ok_or_else(|| ApiError::InvalidInput("asn must be a positive integer".to_string()))?;

    let details = ctx.store.asn_details(asn).await.map_err(|e| {
        error!("failed to load asn details: {}", e);
        ApiError::Database("failed to load asn details".to_string())
    })?;

    Ok(json_response(StatusCode::OK, &json!({"data": details})))
}

pub async fn health(ctx: &AppContext, _rc: &RequestContext) -> Result<Response<Body>, ApiError> {
    let started = std::time::Instant::now();
    let count = ctx.store.count_proxies().await;
    let db_latency = started.elapsed();

    let database = match &count {
        Ok(_) => json!({"healthy": true, "latency": format!("{:?}", db_latency)}),
        Err(_) => json!({"healthy": false, "message": "database unavailable"}),
    };

    let redis = match &ctx.cache {
        Some(cache) => {
            let started = std::time::Instant::now();
            if cache.ping().await {
                json!({"healthy": true, "latency": format!("{:?}", started.elapsed())})
            } else {
                json!({"healthy": false, "message": "cache unavailable"})
            }
        }
        None => json!({"healthy": false, "message": "not configured"}),
    };

    let healthy = count.is_ok();
    let payload = json!({
        "status": if healthy { "ok" } else { "unhealthy" },
        "service": "proxydex-api",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        "database": database,
        "redis": redis,
        "proxies_count": count.unwrap_or(-1),
    });

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok(json_response(status, &payload))
}

pub async fn whoami(_ctx: &AppContext, rc: &RequestContext) -> Result<Response<Body>, ApiError> {
    let mut headers = serde_json::Map::new();
    for (name, value) in rc.headers.iter() {
        headers.insert(
            name.to_string(),
            json!(value.to_str().unwrap_or_default()),
        );
    }

    let agent = rc
        .headers
        .get(hyper::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let payload = json!({
        "ip": rc.client_ip,
        "headers": headers,
        "agent": agent,
    });
    Ok(json_response(StatusCode::OK, &payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(anon: i64, up: i64, down: i64) -> ProxyListRecord {
        ProxyListRecord {
            host: "proxy.example".to_string(),
            ip: "198.51.100.1".to_string(),
            port: 1080,
            anon,
            checks_up: up,
            checks_down: down,
            socks5: 1,
            ssl: 1,
            last_seen: Some(Utc::now()),
            ..Default::default()
        }
    }

    #[test]
    fn test_transform_protocols_and_anonymity() {
        let item = transform_record(&record(4, 9, 1));
        assert_eq!(item.protocols, vec!["HTTPS", "SOCKS5"]);
        assert_eq!(item.anonymity_level, "Elite");
        assert_eq!(item.uptime, 90);
        assert!(!item.last_seen.is_empty());

        assert_eq!(transform_record(&record(0, 0, 0)).anonymity_level, "Transparent");
        assert_eq!(transform_record(&record(2, 0, 0)).anonymity_level, "Anonymous");
        assert_eq!(transform_record(&record(9, 0, 0)).anonymity_level, "Unknown");
    }

    #[test]
    fn test_transform_zero_checks_zero_uptime() {
        let item = transform_record(&record(0, 0, 0));
        assert_eq!(item.uptime, 0);
    }

    #[test]
    fn test_item_serialization_omits_empty_optionals() {
        let item = transform_record(&record(4, 1, 0));
        let value = serde_json::to_value(&item).unwrap();
        assert!(value.get("city").is_none());
        assert!(value.get("asn").is_none());
        assert_eq!(value["ip"], "198.51.100.1");
    }
}
