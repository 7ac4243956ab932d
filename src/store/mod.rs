mod proxy_list;

pub use proxy_list::{
    AsnCountryStat, AsnDetails, AsnProtocolSummary, FacetRecord, ProtocolCounts, ProxyListFilters,
    ProxyListRecord, ProxyStats,
};

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store worker cancelled")]
    Cancelled,
}

/// Embedded SQLite store. A single connection serializes writes; calls run
/// on the blocking pool so async callers stay cancellable.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

/// Persisted snapshot of a validated proxy, keyed by `(address, protocol)`.
#[derive(Debug, Clone, Default)]
pub struct ProxyRecord {
    pub id: i64,
    pub address: String,
    pub protocol: String,
    pub country: String,
    pub anonymity: String,
    pub last_status: bool,
    pub last_latency: i64,
    pub last_checked: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Append-only validation history row.
#[derive(Debug, Clone, Default)]
pub struct CheckRecord {
    pub id: i64,
    pub proxy_id: i64,
    pub address: String,
    pub protocol: String,
    pub status: bool,
    pub latency: i64,
    pub checked_at: Option<DateTime<Utc>>,
    pub ip: String,
    pub country: String,
    pub anonymity: String,
}

impl Store {
    pub fn open(path: &Path) -> anyhow::Result<Store> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create data dir {:?}", parent))?;
            }
        }

        let conn = Connection::open(path).with_context(|| format!("open database {:?}", path))?;
        migrate(&conn).context("migrate schema")?;

        info!("opened catalog store at {:?}", path);
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> anyhow::Result<Store> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    pub(crate) async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock_conn(&conn);
            f(&mut guard)
        })
        .await
        .map_err(|_| StoreError::Cancelled)?
        .map_err(StoreError::from)
    }

    /// Upsert the latest snapshot for `(address, protocol)` and return the
    /// row id, so check rows can reference it.
    pub async fn upsert_proxy(&self, mut record: ProxyRecord) -> Result<i64, StoreError> {
        let now = Utc::now();
        if record.created_at.is_none() {
            record.created_at = Some(now);
        }
        if record.last_checked.is_none() {
            record.last_checked = Some(now);
        }

        self.call(move |conn| {
            conn.execute(
                "INSERT INTO proxies (address, protocol, country, anonymity, last_status, last_latency, last_checked, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(address, protocol) DO UPDATE SET
                     country = excluded.country,
                     anonymity = excluded.anonymity,
                     last_status = excluded.last_status,
                     last_latency = excluded.last_latency,
                     last_checked = excluded.last_checked",
                params![
                    record.address,
                    record.protocol,
                    record.country,
                    record.anonymity,
                    record.last_status as i64,
                    record.last_latency,
                    fmt_ts(record.last_checked),
                    fmt_ts(record.created_at),
                ],
            )?;

            conn.query_row(
                "SELECT id FROM proxies WHERE address = ?1 AND protocol = ?2",
                params![record.address, record.protocol],
                |row| row.get(0),
            )
        })
        .await
    }

    pub async fn insert_check(&self, mut record: CheckRecord) -> Result<(), StoreError> {
        if record.checked_at.is_none() {
            record.checked_at = Some(Utc::now());
        }

        self.call(move |conn| {
            conn.execute(
                "INSERT INTO checks (proxy_id, status, latency, checked_at, ip, country, anonymity)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.proxy_id,
                    record.status as i64,
                    record.latency,
                    fmt_ts(record.checked_at),
                    record.ip,
                    record.country,
                    record.anonymity,
                ],
            )
            .map(|_| ())
        })
        .await
    }

    pub async fn count_proxies(&self) -> Result<i64, StoreError> {
        self.call(|conn| conn.query_row("SELECT COUNT(1) FROM proxy_list", [], |row| row.get(0)))
            .await
    }
}

pub(crate) fn lock_conn(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|e| e.into_inner())
}

/// Timestamps are stored as fixed-width UTC RFC 3339 strings, which keeps
/// lexicographic and chronological order identical.
pub(crate) fn fmt_ts(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
}

pub(crate) fn parse_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    })
}

fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS proxies (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            address TEXT NOT NULL,
            protocol TEXT NOT NULL,
            country TEXT,
            anonymity TEXT,
            last_status INTEGER,
            last_latency INTEGER,
            last_checked TEXT,
            created_at TEXT,
            UNIQUE(address, protocol)
        );

        CREATE TABLE IF NOT EXISTS checks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            proxy_id INTEGER NOT NULL,
            status INTEGER,
            latency INTEGER,
            checked_at TEXT,
            ip TEXT,
            country TEXT,
            anonymity TEXT,
            FOREIGN KEY(proxy_id) REFERENCES proxies(id)
        );

        CREATE INDEX IF NOT EXISTS idx_proxies_last_checked ON proxies(last_checked DESC);
        CREATE INDEX IF NOT EXISTS idx_checks_proxy_id ON checks(proxy_id);
        CREATE INDEX IF NOT EXISTS idx_checks_checked_at ON checks(checked_at DESC);

        CREATE TABLE IF NOT EXISTS proxy_list (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            host TEXT NOT NULL,
            ip TEXT NOT NULL,
            port INTEGER NOT NULL,
            last_seen TEXT,
            delay INTEGER DEFAULT 0,
            cid TEXT,
            country_code TEXT,
            country_name TEXT,
            city TEXT,
            region TEXT,
            asn INTEGER,
            asn_name TEXT,
            org TEXT,
            continent_code TEXT,
            checks_up INTEGER DEFAULT 0,
            checks_down INTEGER DEFAULT 0,
            anon INTEGER DEFAULT 0,
            http INTEGER DEFAULT 0,
            ssl INTEGER DEFAULT 0,
            socks4 INTEGER DEFAULT 0,
            socks5 INTEGER DEFAULT 0,
            created_at TEXT,
            updated_at TEXT,
            UNIQUE(ip, port)
        );

        CREATE INDEX IF NOT EXISTS idx_proxy_list_country ON proxy_list(country_code);
        CREATE INDEX IF NOT EXISTS idx_proxy_list_port ON proxy_list(port);
        CREATE INDEX IF NOT EXISTS idx_proxy_list_anon ON proxy_list(anon);
        CREATE INDEX IF NOT EXISTS idx_proxy_list_last_seen ON proxy_list(last_seen DESC);
        CREATE INDEX IF NOT EXISTS idx_proxy_list_city ON proxy_list(city);
        CREATE INDEX IF NOT EXISTS idx_proxy_list_region ON proxy_list(region);
        CREATE INDEX IF NOT EXISTS idx_proxy_list_asn ON proxy_list(asn);
        CREATE INDEX IF NOT EXISTS idx_proxy_list_protocol_country ON proxy_list(socks5, country_code, last_seen DESC);
        CREATE INDEX IF NOT EXISTS idx_proxy_list_country_port ON proxy_list(country_code, port, last_seen DESC);
        CREATE INDEX IF NOT EXISTS idx_proxy_list_asn_country ON proxy_list(asn, country_code);

        CREATE TABLE IF NOT EXISTS facets (
            type TEXT NOT NULL,
            key TEXT NOT NULL,
            count INTEGER DEFAULT 0,
            avg_delay REAL DEFAULT 0,
            metadata TEXT,
            updated_at TEXT,
            PRIMARY KEY (type, key)
        );
        ",
    )?;

    // WAL keeps readers unblocked while sync batches commit.
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    let _ = conn.pragma_update(None, "synchronous", "NORMAL");
    let _ = conn.pragma_update(None, "cache_size", -64000);
    let _ = conn.pragma_update(None, "temp_store", "MEMORY");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_proxy_returns_stable_id() {
        let store = Store::open_in_memory().unwrap();

        let id1 = store
            .upsert_proxy(ProxyRecord {
                address: "198.51.100.1:1080".to_string(),
                protocol: "socks5".to_string(),
                last_status: true,
                last_latency: 120,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(id1 > 0);

        let id2 = store
            .upsert_proxy(ProxyRecord {
                address: "198.51.100.1:1080".to_string(),
                protocol: "socks5".to_string(),
                country: "US".to_string(),
                last_status: false,
                last_latency: 300,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn test_insert_check_links_proxy() {
        let store = Store::open_in_memory().unwrap();
        let proxy_id = store
            .upsert_proxy(ProxyRecord {
                address: "198.51.100.1:1080".to_string(),
                protocol: "socks5".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        store
            .insert_check(CheckRecord {
                proxy_id,
                address: "198.51.100.1:1080".to_string(),
                protocol: "socks5".to_string(),
                status: true,
                latency: 88,
                ip: "198.51.100.1".to_string(),
                country: "US".to_string(),
                anonymity: "anonymous".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let count: i64 = store
            .call(move |conn| {
                conn.query_row(
                    "SELECT COUNT(1) FROM checks WHERE proxy_id = ?1",
                    params![proxy_id],
                    |row| row.get(0),
                )
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_timestamp_round_trip() {
        let now = Utc::now();
        let formatted = fmt_ts(Some(now)).unwrap();
        let parsed = parse_ts(Some(formatted)).unwrap();
        assert_eq!(parsed.timestamp(), now.timestamp());
        assert!(parse_ts(Some("garbage".to_string())).is_none());
        assert!(parse_ts(None).is_none());
    }
}
