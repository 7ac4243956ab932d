use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE, ETAG, IF_NONE_MATCH};
use hyper::{Body, HeaderMap, Response, StatusCode};
use sha2::{Digest, Sha256};

use crate::error::ApiError;

pub fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<Body> {
    raw_json_response(status, value.to_string().into_bytes())
}

pub fn raw_json_response(status: StatusCode, body: Vec<u8>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_default()
}

/// The single place the error taxonomy turns into a wire envelope.
pub fn error_response(err: &ApiError, request_id: &str, path: &str) -> Response<Body> {
    let mut envelope = serde_json::json!({
        "code": err.code(),
        "message": err.to_string(),
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        "path": path,
    });
    if !request_id.is_empty() {
        envelope["request_id"] = serde_json::Value::String(request_id.to_string());
    }
    if let Some(details) = err.details() {
        envelope["details"] = details;
    }

    json_response(err.status(), &envelope)
}

/// `Cache-Control` for a cacheable response; zero TTL means `no-store`.
pub fn cache_control_value(ttl: Duration, public: bool) -> String {
    let seconds = ttl.as_secs();
    if seconds == 0 {
        return "no-store".to_string();
    }
    let scope = if public { "public" } else { "private" };
    format!(
        "{}, max-age={}, s-maxage={}, stale-while-revalidate={}",
        scope,
        seconds,
        seconds,
        seconds * 3
    )
}

pub fn set_cache_control(headers: &mut HeaderMap, ttl: Duration, public: bool) {
    if let Ok(value) = hyper::header::HeaderValue::from_str(&cache_control_value(ttl, public)) {
        headers.insert(CACHE_CONTROL, value);
    }
}

/// Weak ETag over the response projection: data plus the pagination meta
/// and last_sync. Empty results with zero total carry no ETag at all.
pub fn build_list_etag(
    data: &serde_json::Value,
    total: i64,
    limit: i64,
    offset: i64,
    last_sync: &str,
) -> String {
    let empty = data.as_array().map(|a| a.is_empty()).unwrap_or(true);
    if empty && total == 0 {
        return String::new();
    }

    let mut meta = serde_json::json!({
        "total": total,
        "limit": limit,
        "offset": offset,
    });
    if !last_sync.is_empty() {
        meta["last_sync"] = serde_json::Value::String(last_sync.to_string());
    }
    let payload = serde_json::json!({"data": data, "meta": meta});

    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    format!("W/\"{:x}\"", hasher.finalize())
}

/// Attach the ETag and answer `If-None-Match` with an empty 304 when the
/// client already has this representation.
pub fn apply_etag(
    mut response: Response<Body>,
    etag: &str,
    request_headers: &HeaderMap,
) -> Response<Body> {
    if etag.is_empty() {
        return response;
    }
    if let Ok(value) = hyper::header::HeaderValue::from_str(etag) {
        response.headers_mut().insert(ETAG, value);
    }

    let if_none_match = request_headers
        .get(IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !if_none_match.is_empty() && etag_matches(if_none_match, etag) {
        let mut not_modified = Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .body(Body::empty())
            .unwrap_or_default();
        not_modified
            .headers_mut()
            .extend(response.headers().iter().map(|(k, v)| (k.clone(), v.clone())));
        return not_modified;
    }

    response
}

fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    let normalized = normalize_etag(etag);
    if_none_match.split(',').any(|candidate| {
        let candidate = candidate.trim();
        candidate == "*" || normalize_etag(candidate) == normalized
    })
}

fn normalize_etag(tag: &str) -> &str {
    let tag = tag.trim();
    let tag = tag.strip_prefix("W/").or_else(|| tag.strip_prefix("w/")).unwrap_or(tag);
    tag.trim_matches('"')
}
