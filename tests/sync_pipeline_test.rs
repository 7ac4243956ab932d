use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Response, Server};

use proxydex::metrics::ServiceMetrics;
use proxydex::store::{ProxyListFilters, Store};
use proxydex::sync::{SyncConfig, Syncer};

const FEED: &str = "\
ip;host;port;lastseen;delay;cid;country_code;country_name;city;region;asn;asn_name;org;continent_code;checks_up;checks_down;anon;http;ssl;socks4;socks5
198.51.100.1;proxy-a.example;1080;1700000000;120;a1;us;United States;New York;NY;13335;CLOUDFLARENET;Cloudflare;NA;8;2;4;0;0;0;1
198.51.100.2;proxy-b.example;3128;1700000100;300;b2;de;Germany;Berlin;BE;3320;DTAG;Deutsche Telekom;EU;5;5;1;1;0;0;0
bad-row;;;;;;;;;;;;;;;;;;;;
198.51.100.3;proxy-c.example;8080;600;80;c3;us;United States;Chicago;IL;13335;CLOUDFLARENET;Cloudflare;NA;1;0;2;1;1;0;0
";

/// Serve the fixture feed on an ephemeral local port.
async fn feed_server() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let make_svc = make_service_fn(|_| async {
        Ok::<_, Infallible>(service_fn(|_req| async {
            Ok::<_, Infallible>(Response::new(Body::from(FEED)))
        }))
    });

    let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
    let addr = server.local_addr();
    let handle = tokio::spawn(async move {
        let _ = server.await;
    });
    (addr, handle)
}

fn test_store() -> (Arc<Store>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(&dir.path().join("sync.db")).unwrap());
    (store, dir)
}

#[tokio::test]
async fn test_sync_ingests_feed_and_rebuilds_facets() {
    let (addr, server) = feed_server().await;
    let (store, _dir) = test_store();

    let syncer = Syncer::new(
        SyncConfig {
            source_url: format!("http://{}/feed.csv", addr),
            interval: Duration::from_secs(300),
            request_timeout: Duration::from_secs(5),
            retention_hours: 48,
        },
        Arc::clone(&store),
        None,
        None,
        None,
        Arc::new(ServiceMetrics::new()),
    );

    syncer.sync_once().await.unwrap();

    // The malformed row is skipped; three valid rows land.
    let (rows, total) = store.list_proxy_list(ProxyListFilters::default()).await.unwrap();
    assert_eq!(total, 3);
    let newest = &rows[0];
    // The "600 seconds ago" row has the freshest last_seen.
    assert_eq!(newest.ip, "198.51.100.3");
    assert_eq!(newest.country_code, "US");

    let countries = store.list_proxy_facets("country", 0, 0).await.unwrap();
    let us = countries.iter().find(|f| f.key == "US").unwrap();
    assert_eq!(us.count, 2);
    let de = countries.iter().find(|f| f.key == "DE").unwrap();
    assert_eq!(de.count, 1);

    let protocols = store.list_proxy_facets("protocol", 0, 0).await.unwrap();
    assert!(protocols.iter().any(|f| f.key == "socks5" && f.count == 1));
    assert!(protocols.iter().any(|f| f.key == "http" && f.count == 2));

    server.abort();
}

#[tokio::test]
async fn test_sync_is_idempotent() {
    let (addr, server) = feed_server().await;
    let (store, _dir) = test_store();

    let syncer = Syncer::new(
        SyncConfig {
            source_url: format!("http://{}/feed.csv", addr),
            interval: Duration::from_secs(300),
            request_timeout: Duration::from_secs(5),
            retention_hours: 48,
        },
        Arc::clone(&store),
        None,
        None,
        None,
        Arc::new(ServiceMetrics::new()),
    );

    syncer.sync_once().await.unwrap();
    let (rows_first, _) = store.list_proxy_list(ProxyListFilters::default()).await.unwrap();
    let created_first = rows_first[0].created_at;

    syncer.sync_once().await.unwrap();
    let (rows_second, total) = store.list_proxy_list(ProxyListFilters::default()).await.unwrap();
    assert_eq!(total, 3);
    // Re-upserting the same key keeps the original created_at.
    assert_eq!(rows_second[0].created_at, created_first);

    server.abort();
}

#[tokio::test]
async fn test_sync_retention_removes_rows_beyond_cutoff() {
    let (addr, server) = feed_server().await;
    let (store, _dir) = test_store();

    // With a 1-hour retention, the rows pinned to the fixed 2023 epoch
    // timestamps are dropped; only the "seconds ago" row survives.
    let syncer = Syncer::new(
        SyncConfig {
            source_url: format!("http://{}/feed.csv", addr),
            interval: Duration::from_secs(300),
            request_timeout: Duration::from_secs(5),
            retention_hours: 1,
        },
        Arc::clone(&store),
        None,
        None,
        None,
        Arc::new(ServiceMetrics::new()),
    );

    syncer.sync_once().await.unwrap();
    let (rows, total) = store.list_proxy_list(ProxyListFilters::default()).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(rows[0].ip, "198.51.100.3");

    server.abort();
}
