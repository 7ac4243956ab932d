use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use hyper::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::upgrade::Upgraded;
use hyper::{Body, Request, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Message, Role, WebSocketConfig};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::api::cors::origin_allowed;
use crate::api::waf::{contains_sql_injection, contains_xss};
use crate::checker::{check_proxy, parse_proxy_line, ProxyResult, ProxyTarget};
use crate::geoip::GeoReader;
use crate::metrics::ServiceMetrics;
use crate::rate_limiter::Limiter;
use crate::store::{CheckRecord, ProxyRecord, Store};

/// Client must answer a ping within this long.
const PONG_WAIT: Duration = Duration::from_secs(60);
const PING_PERIOD: Duration = Duration::from_secs(30);

/// Whole-session budget for one submitted batch.
const SESSION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const MAX_FRAME_PROXIES: usize = 500;
const READ_LIMIT: usize = 64 << 10;

/// Results are flushed every 10 entries or 100 ms, whichever first; each
/// result still goes out as its own frame.
const WRITE_BATCH: usize = 10;
const WRITE_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct WsConfig {
    pub judge_url: String,
    pub max_concurrent: usize,
    pub max_connections: usize,
    pub allowed_origins: Vec<String>,
    pub development: bool,
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    #[serde(default)]
    proxies: Vec<String>,
    #[serde(default)]
    protocol: String,
}

/// Per-process count of open sessions per source IP. This is the hard cap;
/// the shared limiter key only gives fleet-wide soft guidance.
pub struct ConnectionTracker {
    conns: Mutex<HashMap<String, usize>>,
    max_per: usize,
}

impl ConnectionTracker {
    pub fn new(max_per_ip: usize) -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
            max_per: max_per_ip,
        }
    }

    pub fn acquire(&self, ip: &str) -> bool {
        let mut conns = self.conns.lock().unwrap_or_else(|e| e.into_inner());
        let current = conns.get(ip).copied().unwrap_or(0);
        if current >= self.max_per {
            return false;
        }
        conns.insert(ip.to_string(), current + 1);
        true
    }

    pub fn release(&self, ip: &str) {
        let mut conns = self.conns.lock().unwrap_or_else(|e| e.into_inner());
        match conns.get(ip).copied().unwrap_or(0) {
            0 | 1 => {
                conns.remove(ip);
            }
            n => {
                conns.insert(ip.to_string(), n - 1);
            }
        }
    }

    pub fn count(&self, ip: &str) -> usize {
        let conns = self.conns.lock().unwrap_or_else(|e| e.into_inner());
        conns.get(ip).copied().unwrap_or(0)
    }
}

/// Validation sessions: one WebSocket per client, a bounded worker pool per
/// submitted batch, results streamed back as they land.
pub struct WsHandler {
    cfg: WsConfig,
    store: Arc<Store>,
    geo: Option<Arc<GeoReader>>,
    limiter: Option<Arc<Limiter>>,
    conn_tracker: ConnectionTracker,
    metrics: Arc<ServiceMetrics>,
}

impl WsHandler {
    pub fn new(
        cfg: WsConfig,
        store: Arc<Store>,
        geo: Option<Arc<GeoReader>>,
        limiter: Option<Arc<Limiter>>,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        let conn_tracker = ConnectionTracker::new(cfg.max_connections);
        Self {
            cfg,
            store,
            geo,
            limiter,
            conn_tracker,
            metrics,
        }
    }

    /// Admit and upgrade a `/ws` request. Admission is double-gated: the
    /// shared per-IP session counter first, then the in-process tracker.
    pub async fn handle(self: &Arc<Self>, req: Request<Body>, client_ip: String) -> Response<Body> {
        let origin = req
            .headers()
            .get("origin")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !self.origin_allowed(&origin) {
            warn!("websocket rejected from origin {:?} ({})", origin, client_ip);
            return ws_json(StatusCode::FORBIDDEN, json!({"error": "origin not allowed"}));
        }

        if let Some(limiter) = &self.limiter {
            match limiter
                .acquire_websocket(&client_ip, self.cfg.max_connections)
                .await
            {
                Ok((false, count)) => {
                    ServiceMetrics::incr(&self.metrics.ws_sessions_rejected);
                    return ws_json(
                        StatusCode::TOO_MANY_REQUESTS,
                        json!({
                            "error": "too many websocket connections",
                            "connections": count,
                            "limit": self.cfg.max_connections,
                        }),
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("websocket rate limiter error: {}", e),
            }
        }

        if !self.conn_tracker.acquire(&client_ip) {
            self.release_shared_slot(&client_ip).await;
            ServiceMetrics::incr(&self.metrics.ws_sessions_rejected);
            return ws_json(
                StatusCode::TOO_MANY_REQUESTS,
                json!({
                    "error": "connection limit exceeded for this IP",
                    "current": self.conn_tracker.count(&client_ip),
                    "limit": self.cfg.max_connections,
                    "retry_after": "60s",
                }),
            );
        }

        let Some(accept_key) = websocket_accept_key(&req) else {
            self.conn_tracker.release(&client_ip);
            self.release_shared_slot(&client_ip).await;
            return ws_json(
                StatusCode::BAD_REQUEST,
                json!({"error": "not a websocket handshake"}),
            );
        };

        ServiceMetrics::incr(&self.metrics.ws_sessions_total);
        self.metrics.ws_sessions_active.fetch_add(1, Ordering::Relaxed);

        let handler = Arc::clone(self);
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let mut ws_config = WebSocketConfig::default();
                    ws_config.max_message_size = Some(READ_LIMIT);
                    let ws =
                        WebSocketStream::from_raw_socket(upgraded, Role::Server, Some(ws_config))
                            .await;
                    handler.session(ws, &client_ip).await;
                }
                Err(e) => warn!("websocket upgrade failed for {}: {}", client_ip, e),
            }

            handler.conn_tracker.release(&client_ip);
            handler.release_shared_slot(&client_ip).await;
            handler
                .metrics
                .ws_sessions_active
                .fetch_sub(1, Ordering::Relaxed);
            info!("websocket connection closed for {}", client_ip);
        });

        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_ACCEPT, accept_key)
            .body(Body::empty())
            .unwrap_or_default()
    }

    async fn release_shared_slot(&self, client_ip: &str) {
        if let Some(limiter) = &self.limiter {
            if let Err(e) = limiter.release_websocket(client_ip).await {
                warn!("websocket slot release failed for {}: {}", client_ip, e);
            }
        }
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        if origin.is_empty() {
            return false;
        }
        let exact: Vec<String> = self
            .cfg
            .allowed_origins
            .iter()
            .filter(|o| o.as_str() != "*")
            .cloned()
            .collect();
        if origin_allowed(&exact, origin) {
            return true;
        }
        if self.cfg.development
            && (origin.starts_with("http://localhost:") || origin.starts_with("http://127.0.0.1:"))
        {
            return true;
        }
        false
    }

    async fn session(&self, ws: WebSocketStream<Upgraded>, client_ip: &str) {
        let (sink, mut stream) = ws.split();

        // One task owns the sink; everything else goes through the channel.
        let (out_tx, out_rx) = mpsc::channel::<Message>(64);
        let writer = tokio::spawn(write_loop(sink, out_rx));

        let ping_tx = out_tx.clone();
        let pinger = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_PERIOD);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if ping_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    return;
                }
            }
        });

        loop {
            match tokio::time::timeout(PONG_WAIT, stream.next()).await {
                Err(_) => {
                    debug!("websocket read deadline exceeded for {}", client_ip);
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!("websocket read error for {}: {}", client_ip, e);
                    break;
                }
                Ok(Some(Ok(Message::Text(text)))) => {
                    if !self.handle_batch(&text, &out_tx, client_ip).await {
                        break;
                    }
                }
                Ok(Some(Ok(Message::Close(_)))) => break,
                // Pings are answered by the protocol layer; pongs only serve
                // to reset the read deadline above.
                Ok(Some(Ok(_))) => {}
            }
        }

        pinger.abort();
        drop(out_tx);
        let _ = writer.await;
    }

    /// Process one submitted batch. Returns false when the session must be
    /// terminated (read-side garbage or an injection attempt).
    async fn handle_batch(
        &self,
        text: &str,
        out: &mpsc::Sender<Message>,
        client_ip: &str,
    ) -> bool {
        let request: BatchRequest = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(e) => {
                debug!("websocket bad frame from {}: {}", client_ip, e);
                return false;
            }
        };

        if request.proxies.is_empty() {
            return send_json(out, json!({"error": "empty proxy list"})).await;
        }
        if request.proxies.len() > MAX_FRAME_PROXIES {
            return send_json(out, json!({"error": "limit exceeded (max 500)"})).await;
        }
        for entry in &request.proxies {
            if contains_sql_injection(entry) || contains_xss(entry) {
                warn!("potential injection attempt from {}", client_ip);
                let _ = send_json(out, json!({"error": "invalid input detected"})).await;
                return false;
            }
        }

        let deadline = Instant::now() + SESSION_TIMEOUT;
        let (results_tx, results_rx) = mpsc::channel::<ProxyResult>(self.cfg.max_concurrent * 2);
        let batcher = tokio::spawn(batch_write_loop(out.clone(), results_rx));

        let sem = Arc::new(Semaphore::new(self.cfg.max_concurrent));
        for raw in &request.proxies {
            if Instant::now() >= deadline {
                break;
            }

            let target = match parse_proxy_line(raw, &request.protocol) {
                Ok(target) => target,
                Err(_) => {
                    let _ = results_tx
                        .send(ProxyResult::invalid(&request.protocol, "invalid proxy"))
                        .await;
                    continue;
                }
            };

            let permit = match tokio::time::timeout_at(deadline, Arc::clone(&sem).acquire_owned())
                .await
            {
                Ok(Ok(permit)) => permit,
                _ => break,
            };

            let tx = results_tx.clone();
            let store = Arc::clone(&self.store);
            let geo = self.geo.clone();
            let metrics = Arc::clone(&self.metrics);
            let judge_url = self.cfg.judge_url.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let result = match tokio::time::timeout_at(
                    deadline,
                    check_proxy(&target, &judge_url, geo.as_ref()),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => ProxyResult::invalid(&target.protocol, "session deadline exceeded"),
                };

                ServiceMetrics::incr(&metrics.checks_total);
                if result.status {
                    ServiceMetrics::incr(&metrics.checks_up);
                }

                if let Err(e) = save_result(&store, &target, &result).await {
                    warn!("failed to persist check for {}: {}", target.address, e);
                }
                let _ = tx.send(result).await;
            });
        }

        // Dropping the last sender ends the batcher once in-flight checks
        // finish; awaiting it is the drain barrier before the done frame.
        drop(results_tx);
        let _ = batcher.await;

        send_json(out, json!({"status": "done"})).await
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocketStream<Upgraded>, Message>,
    mut out_rx: mpsc::Receiver<Message>,
) {
    while let Some(msg) = out_rx.recv().await {
        if sink.send(msg).await.is_err() {
            return;
        }
    }
    let _ = sink.close().await;
}

/// Drain check results, amortizing flushes without coalescing frames.
async fn batch_write_loop(out: mpsc::Sender<Message>, mut results_rx: mpsc::Receiver<ProxyResult>) {
    let mut batch: Vec<ProxyResult> = Vec::with_capacity(WRITE_BATCH);
    let mut ticker = tokio::time::interval(WRITE_FLUSH_INTERVAL);

    loop {
        tokio::select! {
            maybe = results_rx.recv() => match maybe {
                Some(result) => {
                    batch.push(result);
                    if batch.len() >= WRITE_BATCH && !flush_results(&out, &mut batch).await {
                        return;
                    }
                }
                None => {
                    let _ = flush_results(&out, &mut batch).await;
                    return;
                }
            },
            _ = ticker.tick() => {
                if !flush_results(&out, &mut batch).await {
                    return;
                }
            }
        }
    }
}

async fn flush_results(out: &mpsc::Sender<Message>, batch: &mut Vec<ProxyResult>) -> bool {
    for result in batch.drain(..) {
        let frame = match serde_json::to_string(&result) {
            Ok(frame) => frame,
            Err(_) => continue,
        };
        if out.send(Message::Text(frame)).await.is_err() {
            return false;
        }
    }
    true
}

async fn send_json(out: &mpsc::Sender<Message>, value: serde_json::Value) -> bool {
    out.send(Message::Text(value.to_string())).await.is_ok()
}

/// Upsert the proxy snapshot and append the immutable check row.
async fn save_result(
    store: &Store,
    target: &ProxyTarget,
    result: &ProxyResult,
) -> anyhow::Result<()> {
    let proxy_id = store
        .upsert_proxy(ProxyRecord {
            address: target.address.clone(),
            protocol: target.protocol.clone(),
            country: result.country.clone(),
            anonymity: result.anonymity.clone(),
            last_status: result.status,
            last_latency: result.latency,
            ..Default::default()
        })
        .await?;

    store
        .insert_check(CheckRecord {
            proxy_id,
            address: target.address.clone(),
            protocol: target.protocol.clone(),
            status: result.status,
            latency: result.latency,
            ip: result.ip.clone(),
            country: result.country.clone(),
            anonymity: result.anonymity.clone(),
            ..Default::default()
        })
        .await?;
    Ok(())
}

fn websocket_accept_key(req: &Request<Body>) -> Option<String> {
    let upgrade = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return None;
    }
    let key = req.headers().get(SEC_WEBSOCKET_KEY)?;
    Some(derive_accept_key(key.as_bytes()))
}

fn ws_json(status: StatusCode, value: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(value.to_string()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_handler(allowed_origins: Vec<&str>, development: bool) -> Arc<WsHandler> {
        Arc::new(WsHandler::new(
            WsConfig {
                judge_url: "http://127.0.0.1:1/judge".to_string(),
                max_concurrent: 4,
                max_connections: 1,
                allowed_origins: allowed_origins.into_iter().map(String::from).collect(),
                development,
            },
            Arc::new(Store::open_in_memory().unwrap()),
            None,
            None,
            Arc::new(ServiceMetrics::new()),
        ))
    }

    #[test]
    fn test_connection_tracker_caps_per_ip() {
        let tracker = ConnectionTracker::new(2);
        assert!(tracker.acquire("203.0.113.5"));
        assert!(tracker.acquire("203.0.113.5"));
        assert!(!tracker.acquire("203.0.113.5"));
        assert!(tracker.acquire("198.51.100.7"));

        tracker.release("203.0.113.5");
        assert_eq!(tracker.count("203.0.113.5"), 1);
        assert!(tracker.acquire("203.0.113.5"));
    }

    #[test]
    fn test_connection_tracker_release_below_zero() {
        let tracker = ConnectionTracker::new(1);
        tracker.release("203.0.113.5");
        assert_eq!(tracker.count("203.0.113.5"), 0);
        assert!(tracker.acquire("203.0.113.5"));
    }

    #[test]
    fn test_origin_gate() {
        let handler = test_handler(vec!["https://example.com", "*.example.org"], false);
        assert!(handler.origin_allowed("https://example.com"));
        assert!(handler.origin_allowed("https://api.example.org"));
        assert!(!handler.origin_allowed("https://example.org"));
        assert!(!handler.origin_allowed("https://evil.com"));
        assert!(!handler.origin_allowed(""));
        assert!(!handler.origin_allowed("http://localhost:3000"));
    }

    #[test]
    fn test_origin_gate_development_localhost() {
        let handler = test_handler(vec!["https://example.com"], true);
        assert!(handler.origin_allowed("http://localhost:3000"));
        assert!(handler.origin_allowed("http://127.0.0.1:5173"));
        assert!(!handler.origin_allowed("https://evil.com"));
    }

    #[test]
    fn test_wildcard_star_is_not_a_ws_origin() {
        let handler = test_handler(vec!["*"], false);
        assert!(!handler.origin_allowed("https://anything.example"));
    }

    #[tokio::test]
    async fn test_handle_rejects_disallowed_origin() {
        let handler = test_handler(vec!["https://example.com"], false);
        let req = Request::builder()
            .uri("/ws")
            .header("origin", "https://evil.com")
            .body(Body::empty())
            .unwrap();
        let resp = handler.handle(req, "203.0.113.5".to_string()).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_handle_rejects_when_tracker_full() {
        let handler = test_handler(vec!["https://example.com"], false);
        assert!(handler.conn_tracker.acquire("203.0.113.5"));

        let req = Request::builder()
            .uri("/ws")
            .header("origin", "https://example.com")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap();
        let resp = handler.handle(req, "203.0.113.5".to_string()).await;
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"], "connection limit exceeded for this IP");
    }

    #[tokio::test]
    async fn test_handle_rejects_non_websocket_request() {
        let handler = test_handler(vec!["https://example.com"], false);
        let req = Request::builder()
            .uri("/ws")
            .header("origin", "https://example.com")
            .body(Body::empty())
            .unwrap();
        let resp = handler.handle(req, "203.0.113.5".to_string()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        // The slot taken during admission must have been returned.
        assert_eq!(handler.conn_tracker.count("203.0.113.5"), 0);
    }

    #[tokio::test]
    async fn test_save_result_persists_proxy_and_check() {
        let store = Store::open_in_memory().unwrap();
        let target = ProxyTarget {
            address: "198.51.100.1:1080".to_string(),
            protocol: "socks5".to_string(),
            ..Default::default()
        };
        let result = ProxyResult {
            ip: "198.51.100.1".to_string(),
            port: "1080".to_string(),
            protocol: "socks5".to_string(),
            status: true,
            latency: 42,
            anonymity: "anonymous".to_string(),
            ..Default::default()
        };

        save_result(&store, &target, &result).await.unwrap();
        save_result(&store, &target, &result).await.unwrap();

        let checks: i64 = store
            .call(|conn| conn.query_row("SELECT COUNT(1) FROM checks", [], |row| row.get(0)))
            .await
            .unwrap();
        assert_eq!(checks, 2);

        let proxies: i64 = store
            .call(|conn| conn.query_row("SELECT COUNT(1) FROM proxies", [], |row| row.get(0)))
            .await
            .unwrap();
        assert_eq!(proxies, 1);
    }

    #[test]
    fn test_accept_key_requires_upgrade_headers() {
        let req = Request::builder()
            .uri("/ws")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap();
        assert!(websocket_accept_key(&req).is_some());

        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        assert!(websocket_accept_key(&req).is_none());
    }
}
