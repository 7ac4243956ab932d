use hyper::StatusCode;
use thiserror::Error;

/// Errors surfaced at the HTTP boundary. Each variant maps to a stable
/// machine-readable code and a status; the router builds the envelope once.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("missing api key")]
    MissingApiKey,

    #[error("invalid authorization format")]
    InvalidAuthFormat,

    #[error("invalid api key")]
    InvalidApiKey,

    #[error("api keys not configured")]
    ApiKeysNotConfigured,

    #[error("rate limit exceeded")]
    RateLimited { limit: i64, used: i64 },

    #[error("rate limiter unavailable")]
    RateLimiterUnavailable,

    #[error("proxy list not configured")]
    ProxyListUnavailable,

    #[error("export jobs unavailable")]
    ExportUnavailable,

    #[error("cache or store not configured")]
    CacheUnavailable,

    /// Carries a generic, client-safe message. The underlying database
    /// error is logged where it happened and never echoed.
    #[error("{0}")]
    Database(String),

    #[error("export job not found")]
    ExportJobNotFound,

    #[error("export job is not ready")]
    ExportJobNotReady,

    #[error("unsupported export format")]
    InvalidExportFormat,

    #[error("{0}")]
    ExportJob(String),

    #[error("request blocked by security rules")]
    WafBlocked,

    #[error("request body exceeds maximum size of {0} bytes")]
    BodyTooLarge(u64),

    #[error("unsupported method")]
    MethodNotAllowed,

    #[error("An unexpected error occurred")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::MissingApiKey | ApiError::InvalidAuthFormat | ApiError::InvalidApiKey => {
                StatusCode::UNAUTHORIZED
            }
            ApiError::ApiKeysNotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::RateLimiterUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::ProxyListUnavailable
            | ApiError::ExportUnavailable
            | ApiError::CacheUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ExportJobNotFound => StatusCode::NOT_FOUND,
            ApiError::ExportJobNotReady => StatusCode::CONFLICT,
            ApiError::InvalidExportFormat | ApiError::ExportJob(_) => StatusCode::BAD_REQUEST,
            ApiError::WafBlocked => StatusCode::BAD_REQUEST,
            ApiError::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidInput(_) => "INVALID_INPUT",
            ApiError::MissingApiKey | ApiError::InvalidAuthFormat | ApiError::InvalidApiKey => {
                "UNAUTHORIZED"
            }
            ApiError::ApiKeysNotConfigured => "API_KEYS_NOT_CONFIGURED",
            ApiError::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            ApiError::RateLimiterUnavailable => "RATE_LIMITER_ERROR",
            ApiError::ProxyListUnavailable => "PROXYLIST_UNAVAILABLE",
            ApiError::ExportUnavailable => "EXPORT_UNAVAILABLE",
            ApiError::CacheUnavailable => "CACHE_UNAVAILABLE",
            ApiError::Database(_) => "DATABASE_ERROR",
            ApiError::ExportJobNotFound => "EXPORT_JOB_NOT_FOUND",
            ApiError::ExportJobNotReady => "EXPORT_JOB_NOT_READY",
            ApiError::InvalidExportFormat => "INVALID_EXPORT_FORMAT",
            ApiError::ExportJob(_) => "EXPORT_JOB_ERROR",
            ApiError::WafBlocked => "WAF_BLOCKED",
            ApiError::BodyTooLarge(_) => "REQUEST_TOO_LARGE",
            ApiError::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ApiError::Internal => "INTERNAL_SERVER_ERROR",
        }
    }

    /// Structured details for the error envelope, where the variant has any.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            ApiError::RateLimited { limit, used } => Some(serde_json::json!({
                "limit": limit,
                "requests_used": used,
            })),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::MissingApiKey.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::RateLimited { limit: 10, used: 11 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(ApiError::ExportJobNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::ExportJobNotReady.status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::BodyTooLarge(100).status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            ApiError::Database("failed to load proxies".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_code_mapping() {
        assert_eq!(ApiError::WafBlocked.code(), "WAF_BLOCKED");
        assert_eq!(ApiError::InvalidApiKey.code(), "UNAUTHORIZED");
        assert_eq!(ApiError::RateLimiterUnavailable.code(), "RATE_LIMITER_ERROR");
        assert_eq!(ApiError::InvalidExportFormat.code(), "INVALID_EXPORT_FORMAT");
    }

    #[test]
    fn test_rate_limited_details() {
        let err = ApiError::RateLimited { limit: 100, used: 101 };
        let details = err.details().unwrap();
        assert_eq!(details["limit"], 100);
        assert_eq!(details["requests_used"], 101);
        assert!(ApiError::WafBlocked.details().is_none());
    }

    #[test]
    fn test_database_error_message_is_generic() {
        let err = ApiError::Database("failed to load proxies".into());
        assert_eq!(err.to_string(), "failed to load proxies");
    }
}
