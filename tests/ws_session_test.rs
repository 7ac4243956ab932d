use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use proxydex::api::cors::CorsConfig;
use proxydex::api::export::ExportManager;
use proxydex::api::rate_limit::ApiLimiters;
use proxydex::api::{handle_request, AppContext};
use proxydex::config::Config;
use proxydex::counter::{Counter, MemoryCounter};
use proxydex::metrics::ServiceMetrics;
use proxydex::rate_limiter::{Limiter, LimiterConfig};
use proxydex::store::Store;
use proxydex::ws::{WsConfig, WsHandler};

const ORIGIN: &str = "https://example.com";

/// Boot the real HTTP server on an ephemeral port.
async fn start_server(max_ws_connections: usize) -> (SocketAddr, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();

    let mut cfg = Config::from_env();
    cfg.environment = "test".to_string();
    cfg.waf_enabled = false;
    cfg.allowed_origins = vec![ORIGIN.to_string()];
    cfg.max_websocket_connections = max_ws_connections;
    cfg.max_concurrent = 4;
    cfg.database_path = dir.path().join("ws.db");
    cfg.export_dir = dir.path().join("exports");
    // A judge nothing can reach keeps checks fast and deterministic.
    cfg.judge_url = "http://127.0.0.1:1/judge".to_string();

    let metrics = Arc::new(ServiceMetrics::new());
    let store = Arc::new(Store::open(&cfg.database_path).unwrap());
    let counter = Arc::new(Counter::Memory(MemoryCounter::new()));

    let public_limiter = Limiter::new(Arc::clone(&counter), cfg.rate_limit_per_day);
    let api_key_limiter = Limiter::with_config(
        Arc::clone(&counter),
        LimiterConfig {
            free_limit: cfg.api_rate_limit_hour,
            basic_limit: 0,
            pro_limit: 0,
            window: Duration::from_secs(3600),
        },
    );
    let api_limiters = ApiLimiters::new(Arc::clone(&counter), &cfg);
    let exports = ExportManager::new(
        Arc::clone(&store),
        None,
        cfg.export_dir.clone(),
        cfg.export_job_ttl,
        Arc::clone(&metrics),
    );
    let ws = Arc::new(WsHandler::new(
        WsConfig {
            judge_url: cfg.judge_url.clone(),
            max_concurrent: cfg.max_concurrent,
            max_connections: cfg.max_websocket_connections,
            allowed_origins: cfg.allowed_origins.clone(),
            development: false,
        },
        Arc::clone(&store),
        None,
        None,
        Arc::clone(&metrics),
    ));
    let cors = CorsConfig::new(&cfg);

    let ctx = Arc::new(AppContext {
        cfg,
        store,
        cache: None,
        counter,
        public_limiter,
        api_key_limiter,
        api_limiters,
        geo: None,
        exports,
        warmer: None,
        ws,
        metrics,
        cors,
    });

    let make_svc = make_service_fn(move |conn: &hyper::server::conn::AddrStream| {
        let ctx = Arc::clone(&ctx);
        let remote = conn.remote_addr();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req| {
                handle_request(Arc::clone(&ctx), remote, req)
            }))
        }
    });

    let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
    let addr = server.local_addr();
    tokio::spawn(async move {
        let _ = server.await;
    });
    (addr, dir)
}

fn ws_request(addr: SocketAddr) -> tokio_tungstenite::tungstenite::handshake::client::Request {
    let mut request = format!("ws://{}/ws", addr).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("origin", ORIGIN.parse().unwrap());
    request
}

#[tokio::test]
async fn test_validation_session_streams_results_then_done() {
    let (addr, _dir) = start_server(4).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(ws_request(addr))
        .await
        .expect("websocket handshake failed");

    ws.send(Message::Text(
        r#"{"proxies":["127.0.0.1:1","bad-entry"],"protocol":"socks5"}"#.to_string(),
    ))
    .await
    .unwrap();

    let mut results = Vec::new();
    let mut done = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while !done {
        let frame = tokio::time::timeout_at(deadline, ws.next())
            .await
            .expect("timed out waiting for frames")
            .expect("connection closed early")
            .expect("websocket error");
        if let Message::Text(text) = frame {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            if value.get("status") == Some(&serde_json::json!("done")) {
                done = true;
            } else {
                results.push(value);
            }
        }
    }

    assert_eq!(results.len(), 2);
    // Both checks fail: one is a dead proxy, one never parsed. Ordering is
    // not guaranteed, so match by shape.
    assert!(results.iter().all(|r| r["status"] == false));
    assert!(results.iter().all(|r| r["protocol"] == "socks5"));
    assert!(results
        .iter()
        .any(|r| r["error"] == "invalid proxy"));
    assert!(results
        .iter()
        .any(|r| r["ip"] == "127.0.0.1" && r["port"] == "1" && r["error"] != "invalid proxy"));
    assert!(results.iter().all(|r| r["checkedAt"].as_str().is_some()));

    ws.close(None).await.ok();
}

#[tokio::test]
async fn test_empty_proxy_list_keeps_session_open() {
    let (addr, _dir) = start_server(4).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(ws_request(addr))
        .await
        .unwrap();

    ws.send(Message::Text(r#"{"proxies":[],"protocol":"socks5"}"#.to_string()))
        .await
        .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let value: serde_json::Value = match frame {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("unexpected frame {:?}", other),
    };
    assert_eq!(value["error"], "empty proxy list");

    // Session survives; a follow-up frame still gets answered.
    ws.send(Message::Text(r#"{"proxies":[],"protocol":"socks5"}"#.to_string()))
        .await
        .unwrap();
    let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(frame, Message::Text(_)));

    ws.close(None).await.ok();
}

#[tokio::test]
async fn test_injection_attempt_terminates_session() {
    let (addr, _dir) = start_server(4).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(ws_request(addr))
        .await
        .unwrap();

    ws.send(Message::Text(
        r#"{"proxies":["1.2.3.4:1080; DROP TABLE proxies"],"protocol":"socks5"}"#.to_string(),
    ))
    .await
    .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    if let Message::Text(text) = frame {
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["error"], "invalid input detected");
    }

    // The server closes after an injection attempt.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(_))) => continue,
            Err(_) => panic!("session not terminated after injection attempt"),
        }
    }
}

#[tokio::test]
async fn test_second_session_from_same_ip_is_refused() {
    let (addr, _dir) = start_server(1).await;

    let (_ws, _) = tokio_tungstenite::connect_async(ws_request(addr))
        .await
        .expect("first session should connect");

    match tokio_tungstenite::connect_async(ws_request(addr)).await {
        Err(WsError::Http(response)) => {
            assert_eq!(response.status(), 429);
        }
        Ok(_) => panic!("second session unexpectedly admitted"),
        Err(other) => panic!("unexpected error: {}", other),
    }
}
