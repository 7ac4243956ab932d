pub mod cache_warm;
pub mod cors;
pub mod export;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod rate_limit;
pub mod respond;
pub mod validators;
pub mod waf;

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use hyper::header::HeaderValue;
use hyper::{Body, HeaderMap, Method, Request, Response, StatusCode};
use serde_json::json;
use tracing::{error, warn};

use crate::api::rate_limit::ApiLimiters;
use crate::cache::ResponseCache;
use crate::config::Config;
use crate::counter::Counter;
use crate::error::ApiError;
use crate::geoip::GeoReader;
use crate::metrics::ServiceMetrics;
use crate::rate_limiter::Limiter;
use crate::store::Store;
use crate::ws::WsHandler;

const SERVICE_NAME: &str = "proxydex-api";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything the request plane needs, shared across connections.
pub struct AppContext {
    pub cfg: Config,
    pub store: Arc<Store>,
    pub cache: Option<ResponseCache>,
    pub counter: Arc<Counter>,
    pub public_limiter: Limiter,
    pub api_key_limiter: Limiter,
    pub api_limiters: ApiLimiters,
    pub geo: Option<Arc<GeoReader>>,
    pub exports: Arc<export::ExportManager>,
    pub warmer: Option<Arc<cache_warm::CacheWarmer>>,
    pub ws: Arc<WsHandler>,
    pub metrics: Arc<ServiceMetrics>,
    pub cors: cors::CorsConfig,
}

/// Per-request facts handlers need besides the body.
pub struct RequestContext {
    pub request_id: String,
    pub path: String,
    pub client_ip: String,
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
}

/// Top of the middleware chain: request-ID, CORS, panic recovery, security
/// headers, slow-request logging. Never returns an error to hyper.
pub async fn handle_request(
    ctx: Arc<AppContext>,
    remote: SocketAddr,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    ServiceMetrics::incr(&ctx.metrics.requests_total);
    let started = Instant::now();

    let request_id = middleware::request_id(&req);
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let client_ip = middleware::client_ip(&req, remote, &ctx.cfg.trusted_proxies);

    let mut cors_headers = HeaderMap::new();
    let mut response = match ctx.cors.apply(&req, &mut cors_headers) {
        Some(response) => response,
        None => {
            let routed = std::panic::AssertUnwindSafe(route(
                Arc::clone(&ctx),
                req,
                &request_id,
                &path,
                &client_ip,
            ))
            .catch_unwind()
            .await;

            match routed {
                Ok(response) => response,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(
                        request_id = %request_id,
                        method = %method,
                        path = %path,
                        "panic while handling request: {}",
                        message
                    );
                    respond::error_response(&ApiError::Internal, &request_id, &path)
                }
            }
        }
    };

    for (name, value) in cors_headers.iter() {
        response.headers_mut().insert(name.clone(), value.clone());
    }
    middleware::apply_security_headers(response.headers_mut());
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(middleware::REQUEST_ID_HEADER, value);
    }

    let elapsed = started.elapsed();
    if !ctx.cfg.slow_request_threshold.is_zero() && elapsed >= ctx.cfg.slow_request_threshold {
        warn!(
            "slow request {} {} status={} latency={:?} request_id={}",
            method,
            path,
            response.status(),
            elapsed,
            request_id
        );
    }

    Ok(response)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn route(
    ctx: Arc<AppContext>,
    req: Request<Body>,
    request_id: &str,
    path: &str,
    client_ip: &str,
) -> Response<Body> {
    // The validation plane and the root/metrics surfaces sit outside the
    // API middleware (WAF, buckets).
    if path == "/ws" {
        return ctx.ws.handle(req, client_ip.to_string()).await;
    }
    if path == "/" {
        return respond::json_response(
            StatusCode::OK,
            &json!({"status": "ok", "service": SERVICE_NAME, "version": SERVICE_VERSION}),
        );
    }
    if path == "/metrics" {
        return metrics::metrics_endpoint(&ctx, req.headers(), client_ip);
    }

    if ctx.cfg.waf_enabled {
        if let Err(e) = waf::check_request(&req, client_ip) {
            ServiceMetrics::incr(&ctx.metrics.requests_blocked_waf);
            return respond::error_response(&e, request_id, path);
        }
    }

    let rate_headers = match ctx.api_limiters.admit(path, client_ip).await {
        Ok(headers) => headers,
        Err((e, headers)) => {
            if matches!(e, ApiError::RateLimited { .. }) {
                ServiceMetrics::incr(&ctx.metrics.requests_rate_limited);
            }
            let mut resp = respond::error_response(&e, request_id, path);
            headers.apply(resp.headers_mut());
            return resp;
        }
    };

    let rc = RequestContext {
        request_id: request_id.to_string(),
        path: path.to_string(),
        client_ip: client_ip.to_string(),
        query: validators::parse_query(req.uri().query().unwrap_or("")),
        headers: req.headers().clone(),
    };

    let result = dispatch(&ctx, req, &rc).await;

    let mut response = match result {
        Ok(response) => response,
        Err(e) => respond::error_response(&e, request_id, path),
    };
    if let Some(headers) = &rate_headers {
        // Handlers that computed their own admission headers win.
        if !response.headers().contains_key("x-ratelimit-limit") {
            headers.apply(response.headers_mut());
        }
    }
    response
}

async fn dispatch(
    ctx: &AppContext,
    req: Request<Body>,
    rc: &RequestContext,
) -> Result<Response<Body>, ApiError> {
    let method = req.method().clone();
    let path = rc.path.clone();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (&method, segments.as_slice()) {
        (&Method::GET, ["api", "health"]) => handlers::health(ctx, rc).await,
        (&Method::GET, ["api", "whoami"]) => handlers::whoami(ctx, rc).await,

        (&Method::POST, ["api", "cache", "warm"]) => warm_endpoint(ctx, rc).await,

        (&Method::GET, ["api", "proxies"]) => handlers::proxy_list_public(ctx, rc).await,
        (&Method::GET, ["api", "v1", "proxies"]) => handlers::proxy_list_auth(ctx, rc).await,
        (&Method::GET, ["api", "proxies", "stats"]) => handlers::proxy_stats(ctx, rc).await,
        (&Method::GET, ["api", "proxies", "recent"]) => handlers::proxy_recent(ctx, rc).await,
        (&Method::GET, ["api", "proxies", "random"]) => handlers::proxy_random(ctx, rc).await,

        (&Method::POST, ["api", "proxies", "export", "jobs"]) => {
            let body = middleware::read_body(req, ctx.cfg.max_body_size).await?;
            export::create_export_job(ctx, rc, &body).await
        }
        (&Method::GET, ["api", "proxies", "export", "jobs", id]) => {
            export::get_export_job(ctx, rc, id).await
        }
        (&Method::GET, ["api", "proxies", "export", "jobs", id, "download"]) => {
            export::download_export_job(ctx, rc, id).await
        }
        (&Method::GET, ["api", "proxies", "export", format]) => {
            export::export_sync(ctx, rc, format).await
        }

        (&Method::GET, ["api", "facets", facet]) => {
            let facet_type = match *facet {
                "countries" => "country",
                "ports" => "port",
                "protocols" => "protocol",
                "cities" => "city",
                "regions" => "region",
                "asns" => "asn",
                _ => return Ok(not_found(rc)),
            };
            handlers::proxy_facets(ctx, rc, facet_type).await
        }
        (&Method::GET, ["api", "asn", asn]) => handlers::asn_details(ctx, rc, asn).await,

        _ => Ok(not_found(rc)),
    }
}

async fn warm_endpoint(ctx: &AppContext, rc: &RequestContext) -> Result<Response<Body>, ApiError> {
    rate_limit::require_api_key(&rc.headers, &ctx.cfg.api_keys)?;

    let Some(warmer) = &ctx.warmer else {
        return Err(ApiError::CacheUnavailable);
    };

    let warmer = Arc::clone(warmer);
    tokio::spawn(async move {
        warmer.warm().await;
    });

    Ok(respond::json_response(
        StatusCode::ACCEPTED,
        &json!({"status": "accepted", "message": "cache warm started"}),
    ))
}

fn not_found(rc: &RequestContext) -> Response<Body> {
    let envelope = json!({
        "code": "NOT_FOUND",
        "message": "resource not found",
        "request_id": rc.request_id,
        "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        "path": rc.path,
    });
    respond::json_response(StatusCode::NOT_FOUND, &envelope)
}
