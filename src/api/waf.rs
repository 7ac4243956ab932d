use hyper::{Body, Method, Request};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::warn;

use crate::error::ApiError;

lazy_static! {
    static ref SQL_INJECTION_PATTERN: Regex = Regex::new(
        r"(?i)(\b(SELECT|INSERT|UPDATE|DELETE|DROP|CREATE|ALTER|EXEC|UNION|SCRIPT)\b|--|;|\bOR\b.*=.*\bAND\b|\bAND\b.*=.*\bOR\b)"
    )
    .unwrap();
    static ref XSS_PATTERN: Regex =
        Regex::new(r"(?i)<script[^>]*>.*?</script>|javascript:|on\w+\s*=").unwrap();
    static ref TRAVERSAL_PATTERN: Regex = Regex::new(r"(?i)(\.\./|%2e%2e|%2f|%5c)").unwrap();
}

const MAX_USER_AGENT_LEN: usize = 512;

pub fn contains_sql_injection(input: &str) -> bool {
    SQL_INJECTION_PATTERN.is_match(input)
}

pub fn contains_xss(input: &str) -> bool {
    XSS_PATTERN.is_match(input)
}

pub fn contains_traversal(input: &str) -> bool {
    TRAVERSAL_PATTERN.is_match(input)
}

/// Gate `/api/*` requests. Non-API paths pass untouched; API requests are
/// checked for method, injection patterns over the raw path and query, the
/// decoded query pairs, and an oversized User-Agent.
pub fn check_request(req: &Request<Body>, client_ip: &str) -> Result<(), ApiError> {
    let path = req.uri().path();
    if !path.starts_with("/api/") {
        return Ok(());
    }

    let method = req.method();
    if method != Method::GET && method != Method::POST && method != Method::OPTIONS {
        return Err(ApiError::MethodNotAllowed);
    }

    let raw_query = req.uri().query().unwrap_or("");
    let raw = format!("{}?{}", path, raw_query);
    if contains_sql_injection(&raw) || contains_xss(&raw) || contains_traversal(&raw) {
        warn!("waf blocked request from {}: {}", client_ip, raw);
        return Err(ApiError::WafBlocked);
    }

    for (key, value) in url::form_urlencoded::parse(raw_query.as_bytes()) {
        if contains_sql_injection(&key) || contains_xss(&key) {
            warn!("waf blocked query key from {}: {}", client_ip, key);
            return Err(ApiError::WafBlocked);
        }
        if contains_sql_injection(&value) || contains_xss(&value) {
            warn!("waf blocked query value from {}: {}", client_ip, value);
            return Err(ApiError::WafBlocked);
        }
    }

    let user_agent = req
        .headers()
        .get(hyper::header::USER_AGENT)
        .map(|v| v.as_bytes().len())
        .unwrap_or(0);
    if user_agent > MAX_USER_AGENT_LEN {
        warn!("waf blocked long user-agent from {}", client_ip);
        return Err(ApiError::WafBlocked);
    }

    Ok(())
}
