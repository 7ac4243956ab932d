use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, HeaderMap, Response, StatusCode};

use crate::api::rate_limit::constant_time_eq;
use crate::api::AppContext;
use crate::config::Config;

/// Whether this caller may scrape `/metrics`. Open in development unless
/// explicitly locked down; in production one of the guards must pass.
pub fn metrics_access_allowed(cfg: &Config, headers: &HeaderMap, client_ip: &str) -> bool {
    if cfg.metrics_public {
        return true;
    }

    let guarded = !cfg.metrics_token.is_empty()
        || !cfg.metrics_allowed_ips.is_empty()
        || (!cfg.metrics_basic_user.is_empty() && !cfg.metrics_basic_pass.is_empty());
    if !guarded {
        return !cfg.is_production();
    }

    if cfg.metrics_allowed_ips.iter().any(|ip| ip == client_ip) {
        return true;
    }

    if !cfg.metrics_token.is_empty() {
        if let Some(token) = bearer_token(headers) {
            if constant_time_eq(token, &cfg.metrics_token) {
                return true;
            }
        }
        if let Some(query_token) = headers
            .get("x-metrics-token")
            .and_then(|v| v.to_str().ok())
        {
            if constant_time_eq(query_token, &cfg.metrics_token) {
                return true;
            }
        }
    }

    if !cfg.metrics_basic_user.is_empty() && !cfg.metrics_basic_pass.is_empty() {
        if let Some((user, pass)) = basic_credentials(headers) {
            if constant_time_eq(&user, &cfg.metrics_basic_user)
                && constant_time_eq(&pass, &cfg.metrics_basic_pass)
            {
                return true;
            }
        }
    }

    false
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let auth = headers
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())?;
    let encoded = auth.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

pub fn metrics_endpoint(ctx: &AppContext, headers: &HeaderMap, client_ip: &str) -> Response<Body> {
    if !metrics_access_allowed(&ctx.cfg, headers, client_ip) {
        return Response::builder()
            .status(StatusCode::FORBIDDEN)
            .body(Body::from("forbidden\n"))
            .unwrap_or_default();
    }

    let body = ctx.metrics.to_prometheus_format();
    let mut resp = Response::builder()
        .status(StatusCode::OK)
        .body(Body::from(body))
        .unwrap_or_default();
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        let mut cfg = Config::from_env();
        cfg.metrics_public = false;
        cfg.metrics_token = String::new();
        cfg.metrics_allowed_ips = Vec::new();
        cfg.metrics_basic_user = String::new();
        cfg.metrics_basic_pass = String::new();
        cfg.environment = "production".to_string();
        cfg
    }

    #[test]
    fn test_public_flag_opens_metrics() {
        let mut cfg = base_config();
        cfg.metrics_public = true;
        assert!(metrics_access_allowed(&cfg, &HeaderMap::new(), "203.0.113.9"));
    }

    #[test]
    fn test_unguarded_production_is_closed() {
        let cfg = base_config();
        assert!(!metrics_access_allowed(&cfg, &HeaderMap::new(), "203.0.113.9"));
    }

    #[test]
    fn test_unguarded_development_is_open() {
        let mut cfg = base_config();
        cfg.environment = "development".to_string();
        assert!(metrics_access_allowed(&cfg, &HeaderMap::new(), "203.0.113.9"));
    }

    #[test]
    fn test_allowed_ip() {
        let mut cfg = base_config();
        cfg.metrics_allowed_ips = vec!["203.0.113.9".to_string()];
        assert!(metrics_access_allowed(&cfg, &HeaderMap::new(), "203.0.113.9"));
        assert!(!metrics_access_allowed(&cfg, &HeaderMap::new(), "203.0.113.10"));
    }

    #[test]
    fn test_bearer_token() {
        let mut cfg = base_config();
        cfg.metrics_token = "scrape-token".to_string();

        let mut headers = HeaderMap::new();
        headers.insert(
            hyper::header::AUTHORIZATION,
            "Bearer scrape-token".parse().unwrap(),
        );
        assert!(metrics_access_allowed(&cfg, &headers, "203.0.113.9"));

        let mut wrong = HeaderMap::new();
        wrong.insert(hyper::header::AUTHORIZATION, "Bearer nope".parse().unwrap());
        assert!(!metrics_access_allowed(&cfg, &wrong, "203.0.113.9"));
    }

    #[test]
    fn test_basic_auth() {
        let mut cfg = base_config();
        cfg.metrics_basic_user = "prom".to_string();
        cfg.metrics_basic_pass = "secret".to_string();

        let mut headers = HeaderMap::new();
        let encoded = BASE64.encode("prom:secret");
        headers.insert(
            hyper::header::AUTHORIZATION,
            format!("Basic {}", encoded).parse().unwrap(),
        );
        assert!(metrics_access_allowed(&cfg, &headers, "203.0.113.9"));

        let mut wrong = HeaderMap::new();
        let encoded = BASE64.encode("prom:wrong");
        wrong.insert(
            hyper::header::AUTHORIZATION,
            format!("Basic {}", encoded).parse().unwrap(),
        );
        assert!(!metrics_access_allowed(&cfg, &wrong, "203.0.113.9"));
    }
}
