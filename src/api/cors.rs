use hyper::header::{HeaderValue, ORIGIN, VARY};
use hyper::{Body, Method, Request, Response, StatusCode};
use tracing::{debug, warn};

use crate::config::Config;

const ALLOWED_METHODS: &str = "GET, POST, OPTIONS, HEAD";
const ALLOWED_HEADERS: &str = "Content-Type, Authorization, X-Request-ID";
const EXPOSED_HEADERS: &str = "X-Request-ID, Content-Length, Content-Type";
const PREFLIGHT_MAX_AGE: &str = "86400";

#[derive(Debug, Clone)]
pub struct CorsConfig {
    allowed_origins: Vec<String>,
    allow_credentials: bool,
    production: bool,
}

impl CorsConfig {
    pub fn new(cfg: &Config) -> Self {
        let has_wildcard = cfg.allowed_origins.iter().any(|o| o == "*");
        if has_wildcard {
            warn!("CORS wildcard (*) origin is enabled; not recommended for production");
        }

        Self {
            allowed_origins: cfg.allowed_origins.clone(),
            allow_credentials: !has_wildcard,
            production: cfg.is_production(),
        }
    }

    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        if origin.is_empty() {
            return true;
        }
        if self.allowed_origins.iter().any(|o| o == "*") {
            return true;
        }
        origin_allowed(&self.allowed_origins, origin)
    }

    /// Returns `Some(response)` when the request is finished here (a
    /// preflight, or a production rejection of a disallowed API origin).
    pub fn apply(
        &self,
        req: &Request<Body>,
        headers: &mut hyper::HeaderMap,
    ) -> Option<Response<Body>> {
        let origin = req
            .headers()
            .get(ORIGIN)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let allowed = self.is_origin_allowed(&origin);
        if !origin.is_empty() && !allowed {
            debug!(
                "cors blocked origin {} for {} {}",
                origin,
                req.method(),
                req.uri().path()
            );
            if self.production && req.uri().path().starts_with("/api/") {
                let body = serde_json::json!({
                    "code": "CORS_BLOCKED",
                    "message": "Origin not allowed",
                });
                return Some(
                    Response::builder()
                        .status(StatusCode::FORBIDDEN)
                        .header(hyper::header::CONTENT_TYPE, "application/json")
                        .body(Body::from(body.to_string()))
                        .unwrap_or_default(),
                );
            }
        }

        if allowed && !origin.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&origin) {
                headers.insert("access-control-allow-origin", value);
            }
            // Dynamic origins must not poison shared caches.
            headers.insert(VARY, HeaderValue::from_static("Origin"));
        }
        if self.allow_credentials {
            headers.insert(
                "access-control-allow-credentials",
                HeaderValue::from_static("true"),
            );
        }
        headers.insert(
            "access-control-expose-headers",
            HeaderValue::from_static(EXPOSED_HEADERS),
        );

        if req.method() == Method::OPTIONS {
            let mut response = Response::builder()
                .status(StatusCode::NO_CONTENT)
                .body(Body::empty())
                .unwrap_or_default();
            response
                .headers_mut()
                .extend(headers.iter().map(|(k, v)| (k.clone(), v.clone())));
            response.headers_mut().insert(
                "access-control-allow-methods",
                HeaderValue::from_static(ALLOWED_METHODS),
            );
            response.headers_mut().insert(
                "access-control-allow-headers",
                HeaderValue::from_static(ALLOWED_HEADERS),
            );
            response.headers_mut().insert(
                "access-control-max-age",
                HeaderValue::from_static(PREFLIGHT_MAX_AGE),
            );
            return Some(response);
        }

        None
    }
}

/// Exact and `*.domain` wildcard origin matching.
///
/// A wildcard matches `a.domain` and `a.b.domain` but never the bare
/// `domain`; list the bare domain explicitly to allow it. The scheme and
/// port are ignored for the wildcard comparison.
pub fn origin_allowed(allowed_origins: &[String], origin: &str) -> bool {
    for allowed in allowed_origins {
        if allowed.eq_ignore_ascii_case(origin) {
            return true;
        }
        if let Some(base) = allowed.strip_prefix("*.") {
            let host = origin_host(origin);
            let suffix = format!(".{}", base.to_lowercase());
            if host.to_lowercase().ends_with(&suffix) {
                let prefix_len = host.len() - suffix.len();
                if prefix_len > 0 {
                    return true;
                }
            }
        }
    }
    false
}

fn origin_host(origin: &str) -> &str {
    let host = origin
        .strip_prefix("https://")
        .or_else(|| origin.strip_prefix("http://"))
        .unwrap_or(origin);
    match host.find(':') {
        Some(idx) => &host[..idx],
        None => host,
    }
}
