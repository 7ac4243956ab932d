use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use tracing::{error, info, warn};

use proxydex::api::cache_warm::CacheWarmer;
use proxydex::api::cors::CorsConfig;
use proxydex::api::export::ExportManager;
use proxydex::api::rate_limit::ApiLimiters;
use proxydex::api::{handle_request, AppContext};
use proxydex::cache::ResponseCache;
use proxydex::config::Config;
use proxydex::counter::Counter;
use proxydex::geoip::GeoReader;
use proxydex::metrics::ServiceMetrics;
use proxydex::rate_limiter::{Limiter, LimiterConfig};
use proxydex::store::Store;
use proxydex::sync::{SyncConfig, Syncer};
use proxydex::ws::{WsConfig, WsHandler};

const REDIS_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    let mut cfg = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("proxydex={}", cfg.log_level).parse().unwrap()),
        )
        .init();

    if let Err(e) = cfg.validate() {
        error!("config validation failed: {:#}", e);
        std::process::exit(1);
    }

    let metrics = Arc::new(ServiceMetrics::new());

    let store = match Store::open(&cfg.database_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("failed to open store: {:#}", e);
            std::process::exit(1);
        }
    };

    let redis_conn = connect_redis(&cfg).await;
    if redis_conn.is_none() {
        warn!("redis unavailable at {}, running degraded", cfg.redis_addr);
    }
    let cache = redis_conn.clone().map(ResponseCache::new);

    let counter = Arc::new(Counter::from_redis(redis_conn.clone()));

    let geo = match GeoReader::load(&cfg.geoip_city_path, &cfg.geoip_asn_path) {
        Ok(reader) => reader.map(Arc::new),
        Err(e) => {
            warn!("geoip unavailable: {:#}", e);
            None
        }
    };

    let public_limiter = Limiter::with_config(
        Arc::clone(&counter),
        LimiterConfig {
            free_limit: cfg.rate_limit_per_day,
            basic_limit: cfg.rate_limit_basic,
            pro_limit: cfg.rate_limit_pro,
            window: Duration::from_secs(24 * 3600),
        },
    );
    let api_key_limiter = Limiter::with_config(
        Arc::clone(&counter),
        LimiterConfig {
            free_limit: cfg.api_rate_limit_hour,
            basic_limit: cfg.api_rate_limit_hour * 10,
            pro_limit: cfg.api_rate_limit_hour * 100,
            window: Duration::from_secs(3600),
        },
    );
    let ws_limiter = Arc::new(Limiter::with_config(
        Arc::clone(&counter),
        LimiterConfig {
            free_limit: cfg.rate_limit_per_day,
            basic_limit: 0,
            pro_limit: 0,
            window: Duration::from_secs(24 * 3600),
        },
    ));
    let api_limiters = ApiLimiters::new(Arc::clone(&counter), &cfg);

    let exports = ExportManager::new(
        Arc::clone(&store),
        redis_conn.clone(),
        cfg.export_dir.clone(),
        cfg.export_job_ttl,
        Arc::clone(&metrics),
    );

    let warmer = cache.clone().map(|cache| {
        CacheWarmer::new(
            Arc::clone(&store),
            cache,
            cfg.proxy_web_cache_ttl,
            cfg.proxy_list_window_hours,
        )
    });

    let ws = Arc::new(WsHandler::new(
        WsConfig {
            judge_url: cfg.judge_url.clone(),
            max_concurrent: cfg.max_concurrent,
            max_connections: cfg.max_websocket_connections,
            allowed_origins: cfg.allowed_origins.clone(),
            development: cfg.is_development(),
        },
        Arc::clone(&store),
        geo.clone(),
        Some(ws_limiter),
        Arc::clone(&metrics),
    ));

    let syncer = Arc::new(Syncer::new(
        SyncConfig {
            source_url: cfg.proxy_source_url.clone(),
            interval: cfg.proxy_sync_interval,
            request_timeout: cfg.proxy_request_timeout,
            retention_hours: cfg.proxy_retention_hours,
        },
        Arc::clone(&store),
        cache.clone(),
        geo.clone(),
        warmer.clone(),
        Arc::clone(&metrics),
    ));
    let sync_task = tokio::spawn(Arc::clone(&syncer).run());

    let cors = CorsConfig::new(&cfg);
    let ctx = Arc::new(AppContext {
        cfg: cfg.clone(),
        store: Arc::clone(&store),
        cache,
        counter: Arc::clone(&counter),
        public_limiter,
        api_key_limiter,
        api_limiters,
        geo,
        exports,
        warmer,
        ws,
        metrics: Arc::clone(&metrics),
        cors,
    });

    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let ctx = Arc::clone(&ctx);
        let remote = conn.remote_addr();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req| {
                handle_request(Arc::clone(&ctx), remote, req)
            }))
        }
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let server = Server::bind(&addr)
        .serve(make_svc)
        .with_graceful_shutdown(shutdown_signal());

    info!(
        "proxydex listening on {} (environment: {}, waf: {})",
        addr, cfg.environment, cfg.waf_enabled
    );

    if let Err(e) = server.await {
        error!("server error: {}", e);
    }

    info!("shutting down: draining for up to {:?}", SHUTDOWN_GRACE);
    sync_task.abort();
    counter.close();
    tokio::time::timeout(SHUTDOWN_GRACE, async {
        // Outstanding spawned work (export jobs, checks) winds down here.
        tokio::task::yield_now().await;
    })
    .await
    .ok();
    info!("bye");
}

async fn connect_redis(cfg: &Config) -> Option<redis::aio::ConnectionManager> {
    let client = match redis::Client::open(cfg.redis_url()) {
        Ok(client) => client,
        Err(e) => {
            warn!("invalid redis config: {}", e);
            return None;
        }
    };

    match tokio::time::timeout(
        REDIS_CONNECT_TIMEOUT,
        redis::aio::ConnectionManager::new(client),
    )
    .await
    {
        Ok(Ok(conn)) => {
            info!("connected to redis at {}", cfg.redis_addr);
            Some(conn)
        }
        Ok(Err(e)) => {
            warn!("redis connection failed: {}", e);
            None
        }
        Err(_) => {
            warn!("redis connection timed out");
            None
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("termination signal received");
}
