use std::net::{IpAddr, SocketAddr};

use hyper::header::{HeaderValue, CACHE_CONTROL};
use hyper::{Body, HeaderMap, Request};
use uuid::Uuid;

use crate::error::ApiError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const REQUEST_ID_MAX_LEN: usize = 128;

/// Echo a valid client request ID or mint a fresh one.
pub fn request_id(req: &Request<Body>) -> String {
    let raw = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let sanitized = sanitize_request_id(raw);
    if sanitized.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        sanitized
    }
}

fn sanitize_request_id(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() || raw.len() > REQUEST_ID_MAX_LEN {
        return String::new();
    }
    if raw.chars().any(|c| !('!'..='~').contains(&c)) {
        return String::new();
    }
    raw.to_string()
}

/// Security headers stamped on every response. `Cache-Control: no-store`
/// is the default for dynamic paths; handlers that cache overwrite it.
pub fn apply_security_headers(headers: &mut HeaderMap) {
    headers.insert(
        "strict-transport-security",
        HeaderValue::from_static("max-age=31536000; includeSubDomains; preload"),
    );
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    headers.insert(
        "permissions-policy",
        HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
    );
    if !headers.contains_key(CACHE_CONTROL) {
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    }
}

/// Read the request body, refusing anything over `max_size` whether or not
/// the client declared a Content-Length.
pub async fn read_body(req: Request<Body>, max_size: u64) -> Result<Vec<u8>, ApiError> {
    if let Some(length) = req.headers().get(hyper::header::CONTENT_LENGTH) {
        if let Some(length) = length.to_str().ok().and_then(|v| v.parse::<u64>().ok()) {
            if length > max_size {
                return Err(ApiError::BodyTooLarge(max_size));
            }
        }
    }

    let body = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|_| ApiError::InvalidInput("failed to read request body".to_string()))?;
    if body.len() as u64 > max_size {
        return Err(ApiError::BodyTooLarge(max_size));
    }
    Ok(body.to_vec())
}

/// Client IP resolution: `CF-Connecting-IP` when valid, then the leftmost
/// `X-Forwarded-For` hop if the socket peer is a trusted proxy, else the
/// socket peer itself.
pub fn client_ip(req: &Request<Body>, remote: SocketAddr, trusted_proxies: &[String]) -> String {
    if let Some(cf) = header_str(req.headers(), "cf-connecting-ip") {
        let cf = cf.trim();
        if cf.parse::<IpAddr>().is_ok() {
            return cf.to_string();
        }
    }

    let peer = remote.ip().to_string();
    if trusted_proxies.iter().any(|p| p == &peer) {
        if let Some(forwarded) = header_str(req.headers(), "x-forwarded-for") {
            if let Some(first) = forwarded.split(',').next() {
                let first = first.trim();
                if first.parse::<IpAddr>().is_ok() {
                    return first.to_string();
                }
            }
        }
        if let Some(real_ip) = header_str(req.headers(), "x-real-ip") {
            let real_ip = real_ip.trim();
            if real_ip.parse::<IpAddr>().is_ok() {
                return real_ip.to_string();
            }
        }
    }

    peer
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
