use std::sync::Arc;

use hyper::HeaderMap;
use tracing::warn;

use crate::config::Config;
use crate::counter::Counter;
use crate::error::ApiError;
use crate::rate_limiter::{window_reset, Limiter, LimiterConfig};

/// Path-derived bucket classes for the public API plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Light,
    Standard,
    Heavy,
}

impl Bucket {
    pub fn name(&self) -> &'static str {
        match self {
            Bucket::Light => "light",
            Bucket::Standard => "standard",
            Bucket::Heavy => "heavy",
        }
    }
}

/// One limiter per bucket class, all over the same counter and window.
pub struct ApiLimiters {
    light: Limiter,
    standard: Limiter,
    heavy: Limiter,
    light_limit: i64,
    standard_limit: i64,
    heavy_limit: i64,
    window: std::time::Duration,
}

/// Rate-limit header values to attach to the response whether or not the
/// request was admitted.
#[derive(Debug, Clone, Default)]
pub struct RateHeaders {
    pub limit: i64,
    pub remaining: i64,
    pub reset: i64,
}

impl RateHeaders {
    pub fn apply(&self, headers: &mut HeaderMap) {
        if self.limit <= 0 {
            return;
        }
        if let Ok(value) = self.limit.to_string().parse() {
            headers.insert("x-ratelimit-limit", value);
        }
        if let Ok(value) = self.remaining.to_string().parse() {
            headers.insert("x-ratelimit-remaining", value);
        }
        if let Ok(value) = self.reset.to_string().parse() {
            headers.insert("x-ratelimit-reset", value);
        }
    }
}

impl ApiLimiters {
    pub fn new(counter: Arc<Counter>, cfg: &Config) -> Self {
        let window = cfg.api_rate_limit_window;
        let build = |limit: i64| {
            Limiter::with_config(
                Arc::clone(&counter),
                LimiterConfig {
                    free_limit: limit,
                    basic_limit: 0,
                    pro_limit: 0,
                    window,
                },
            )
        };

        Self {
            light: build(cfg.api_rate_limit_light),
            standard: build(cfg.api_rate_limit_standard),
            heavy: build(cfg.api_rate_limit_heavy),
            light_limit: cfg.api_rate_limit_light,
            standard_limit: cfg.api_rate_limit_standard,
            heavy_limit: cfg.api_rate_limit_heavy,
            window,
        }
    }

    /// Admit an `/api/*` request by its path bucket, keyed on the client
    /// IP. `/api/health` and non-API paths are unlimited. A refusal still
    /// carries the header values so the 429 reports the window state.
    pub async fn admit(
        &self,
        path: &str,
        client_ip: &str,
    ) -> Result<Option<RateHeaders>, (ApiError, RateHeaders)> {
        if !path.starts_with("/api/") || path == "/api/health" {
            return Ok(None);
        }

        let bucket = select_bucket(path);
        let (limiter, limit) = match bucket {
            Bucket::Light => (&self.light, self.light_limit),
            Bucket::Standard => (&self.standard, self.standard_limit),
            Bucket::Heavy => (&self.heavy, self.heavy_limit),
        };
        if limit <= 0 {
            return Ok(None);
        }

        let subject = format!("api:{}:{}", bucket.name(), client_ip);
        let (allowed, count) = match limiter.allow(&subject).await {
            Ok(result) => result,
            Err(e) => {
                warn!("api rate limiter error for {}: {}", client_ip, e);
                return Err((ApiError::RateLimiterUnavailable, RateHeaders::default()));
            }
        };

        let headers = RateHeaders {
            limit,
            remaining: (limit - count).max(0),
            reset: window_reset(self.window),
        };

        if !allowed {
            return Err((ApiError::RateLimited { limit, used: count }, headers));
        }
        Ok(Some(headers))
    }
}

/// Heavier buckets for heavier endpoints; the export and key-authenticated
/// planes sit in Heavy, facet dropdowns in Light.
pub fn select_bucket(path: &str) -> Bucket {
    if path.starts_with("/api/proxies/export") {
        Bucket::Heavy
    } else if path.starts_with("/api/v1/proxies") {
        Bucket::Heavy
    } else if path.starts_with("/api/proxies") {
        Bucket::Standard
    } else if path.starts_with("/api/asn") {
        Bucket::Standard
    } else if path.starts_with("/api/facets") {
        Bucket::Light
    } else if path.starts_with("/api/whoami") {
        Bucket::Light
    } else {
        Bucket::Light
    }
}

/// Constant-time comparison; differing lengths return false immediately,
/// which does not leak anything useful.
pub fn constant_time_eq(x: &str, y: &str) -> bool {
    let x = x.as_bytes();
    let y = y.as_bytes();
    if x.len() != y.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in x.iter().zip(y.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

/// Bearer-token API key check against the configured key set.
pub fn require_api_key(headers: &HeaderMap, api_keys: &[String]) -> Result<String, ApiError> {
    if api_keys.is_empty() {
        return Err(ApiError::ApiKeysNotConfigured);
    }

    let auth = headers
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if auth.is_empty() {
        return Err(ApiError::MissingApiKey);
    }
    let Some(token) = auth.strip_prefix("Bearer ") else {
        return Err(ApiError::InvalidAuthFormat);
    };
    let token = token.trim();
    if token.is_empty() {
        return Err(ApiError::MissingApiKey);
    }

    for key in api_keys {
        if !key.is_empty() && constant_time_eq(token, key) {
            return Ok(token.to_string());
        }
    }
    Err(ApiError::InvalidApiKey)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::MemoryCounter;

    fn test_limiters(light: i64, standard: i64, heavy: i64) -> ApiLimiters {
        let mut cfg = Config::from_env();
        cfg.api_rate_limit_light = light;
        cfg.api_rate_limit_standard = standard;
        cfg.api_rate_limit_heavy = heavy;
        ApiLimiters::new(Arc::new(Counter::Memory(MemoryCounter::new())), &cfg)
    }

    #[test]
    fn test_bucket_selection() {
        assert_eq!(select_bucket("/api/proxies/export/csv"), Bucket::Heavy);
        assert_eq!(select_bucket("/api/proxies/export/jobs"), Bucket::Heavy);
        assert_eq!(select_bucket("/api/v1/proxies"), Bucket::Heavy);
        assert_eq!(select_bucket("/api/proxies"), Bucket::Standard);
        assert_eq!(select_bucket("/api/proxies/stats"), Bucket::Standard);
        assert_eq!(select_bucket("/api/asn/13335"), Bucket::Standard);
        assert_eq!(select_bucket("/api/facets/countries"), Bucket::Light);
        assert_eq!(select_bucket("/api/whoami"), Bucket::Light);
        assert_eq!(select_bucket("/api/other"), Bucket::Light);
    }

    #[tokio::test]
    async fn test_admit_standard_refuses_over_limit() {
        let limiters = test_limiters(10, 2, 10);

        let first = limiters.admit("/api/proxies", "198.51.100.7").await.unwrap();
        let headers = first.unwrap();
        assert_eq!(headers.limit, 2);
        assert_eq!(headers.remaining, 1);
        assert!(headers.reset > 0);

        limiters.admit("/api/proxies", "198.51.100.7").await.unwrap();

        let third = limiters.admit("/api/proxies", "198.51.100.7").await;
        let (err, headers) = third.unwrap_err();
        assert!(matches!(err, ApiError::RateLimited { limit: 2, used: 3 }));
        assert_eq!(headers.remaining, 0);
    }

    #[tokio::test]
    async fn test_health_and_non_api_unlimited() {
        let limiters = test_limiters(1, 1, 1);
        for _ in 0..5 {
            assert!(limiters.admit("/api/health", "ip").await.unwrap().is_none());
            assert!(limiters.admit("/metrics", "ip").await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_buckets_do_not_share_budgets() {
        let limiters = test_limiters(5, 1, 5);
        limiters.admit("/api/proxies", "ip").await.unwrap();
        assert!(limiters.admit("/api/proxies", "ip").await.is_err());
        // Light bucket unaffected.
        assert!(limiters.admit("/api/facets/countries", "ip").await.is_ok());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "secret2"));
        assert!(!constant_time_eq("secret", "secreT"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn test_require_api_key() {
        let keys = vec!["key-one".to_string(), "key-two".to_string()];
        let mut headers = HeaderMap::new();

        assert!(matches!(
            require_api_key(&headers, &[]),
            Err(ApiError::ApiKeysNotConfigured)
        ));
        assert!(matches!(
            require_api_key(&headers, &keys),
            Err(ApiError::MissingApiKey)
        ));

        headers.insert(hyper::header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert!(matches!(
            require_api_key(&headers, &keys),
            Err(ApiError::InvalidAuthFormat)
        ));

        headers.insert(hyper::header::AUTHORIZATION, "Bearer wrong".parse().unwrap());
        assert!(matches!(
            require_api_key(&headers, &keys),
            Err(ApiError::InvalidApiKey)
        ));

        headers.insert(hyper::header::AUTHORIZATION, "Bearer key-two".parse().unwrap());
        assert_eq!(require_api_key(&headers, &keys).unwrap(), "key-two");
    }

    #[test]
    fn test_rate_headers_apply() {
        let mut headers = HeaderMap::new();
        RateHeaders {
            limit: 100,
            remaining: 99,
            reset: 1_700_003_600,
        }
        .apply(&mut headers);
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "100");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "99");
        assert_eq!(headers.get("x-ratelimit-reset").unwrap(), "1700003600");
    }
}
