use chrono::{DateTime, Utc};
use rusqlite::types::ToSqlOutput;
use rusqlite::{params, params_from_iter, Connection, Row, ToSql};
use serde::{Deserialize, Serialize};

use super::{fmt_ts, parse_ts, Store, StoreError};

const SELECT_COLUMNS: &str = "id, host, ip, port, last_seen, delay, cid, \
     country_code, country_name, city, region, \
     asn, asn_name, org, continent_code, \
     checks_up, checks_down, anon, \
     http, ssl, socks4, socks5, \
     created_at, updated_at";

/// One catalog row, keyed by `(ip, port)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProxyListRecord {
    pub id: i64,
    pub host: String,
    pub ip: String,
    pub port: i64,
    pub last_seen: Option<DateTime<Utc>>,
    pub delay: i64,
    pub cid: String,
    pub country_code: String,
    pub country_name: String,
    pub city: String,
    pub region: String,
    pub asn: i64,
    pub asn_name: String,
    pub org: String,
    pub continent_code: String,
    pub checks_up: i64,
    pub checks_down: i64,
    pub anon: i64,
    pub http: i64,
    pub ssl: i64,
    pub socks4: i64,
    pub socks5: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyListFilters {
    #[serde(default)]
    pub country_code: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub port: i64,
    #[serde(default)]
    pub anonymity: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub asn: i64,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FacetRecord {
    #[serde(rename = "type")]
    pub facet_type: String,
    pub key: String,
    pub count: i64,
    pub avg_delay: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AsnDetails {
    pub asn: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub org: String,
    pub count: i64,
    pub avg_delay: f64,
    pub countries: Vec<AsnCountryStat>,
    pub protocols: AsnProtocolSummary,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AsnCountryStat {
    pub code: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub count: i64,
    pub avg_delay: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AsnProtocolSummary {
    pub http: i64,
    pub https: i64,
    pub socks4: i64,
    pub socks5: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProxyStats {
    pub total: i64,
    pub countries: i64,
    pub avg_uptime: i64,
    pub protocols: ProtocolCounts,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProtocolCounts {
    pub http: i64,
    pub https: i64,
    pub socks4: i64,
    pub socks5: i64,
}

enum SqlArg {
    Text(String),
    Int(i64),
}

impl ToSql for SqlArg {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            SqlArg::Text(value) => value.to_sql(),
            SqlArg::Int(value) => value.to_sql(),
        }
    }
}

impl Store {
    /// Upsert a batch in a single transaction. `(ip, port)` conflicts
    /// update every enrichment field but keep `created_at`.
    pub async fn upsert_proxy_list_batch(
        &self,
        records: Vec<ProxyListRecord>,
    ) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        self.call(move |conn| {
            let tx = conn.transaction()?;
            let mut updated = 0;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO proxy_list (
                        host, ip, port, last_seen, delay, cid,
                        country_code, country_name, city, region,
                        asn, asn_name, org, continent_code,
                        checks_up, checks_down, anon,
                        http, ssl, socks4, socks5,
                        created_at, updated_at
                    ) VALUES (
                        ?1, ?2, ?3, ?4, ?5, ?6,
                        ?7, ?8, ?9, ?10,
                        ?11, ?12, ?13, ?14,
                        ?15, ?16, ?17,
                        ?18, ?19, ?20, ?21,
                        ?22, ?23
                    )
                    ON CONFLICT(ip, port) DO UPDATE SET
                        host = excluded.host,
                        last_seen = excluded.last_seen,
                        delay = excluded.delay,
                        cid = excluded.cid,
                        country_code = excluded.country_code,
                        country_name = excluded.country_name,
                        city = excluded.city,
                        region = excluded.region,
                        asn = excluded.asn,
                        asn_name = excluded.asn_name,
                        org = excluded.org,
                        continent_code = excluded.continent_code,
                        checks_up = excluded.checks_up,
                        checks_down = excluded.checks_down,
                        anon = excluded.anon,
                        http = excluded.http,
                        ssl = excluded.ssl,
                        socks4 = excluded.socks4,
                        socks5 = excluded.socks5,
                        updated_at = excluded.updated_at",
                )?;

                let now = Utc::now();
                for mut record in records {
                    if record.created_at.is_none() {
                        record.created_at = Some(now);
                    }
                    if record.updated_at.is_none() {
                        record.updated_at = Some(now);
                    }
                    if record.last_seen.is_none() {
                        record.last_seen = Some(now);
                    }

                    stmt.execute(params![
                        record.host,
                        record.ip,
                        record.port,
                        fmt_ts(record.last_seen),
                        record.delay,
                        record.cid,
                        record.country_code,
                        record.country_name,
                        record.city,
                        record.region,
                        record.asn,
                        record.asn_name,
                        record.org,
                        record.continent_code,
                        record.checks_up,
                        record.checks_down,
                        record.anon,
                        record.http,
                        record.ssl,
                        record.socks4,
                        record.socks5,
                        fmt_ts(record.created_at),
                        fmt_ts(record.updated_at),
                    ])?;
                    updated += 1;
                }
            }
            tx.commit()?;
            Ok(updated)
        })
        .await
    }

    /// Delete rows whose `last_seen` predates the cutoff; returns the count.
    pub async fn delete_stale_proxies(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        self.call(move |conn| {
            conn.execute(
                "DELETE FROM proxy_list WHERE last_seen < ?1",
                params![fmt_ts(Some(cutoff))],
            )
        })
        .await
    }

    /// Filtered, paginated listing. Returns the page plus the full filtered
    /// total. Ordered by `last_seen DESC, id DESC` for stable pagination.
    pub async fn list_proxy_list(
        &self,
        mut filters: ProxyListFilters,
    ) -> Result<(Vec<ProxyListRecord>, i64), StoreError> {
        if filters.limit <= 0 {
            filters.limit = 25;
        }
        if filters.limit > 100 {
            filters.limit = 100;
        }
        if filters.offset < 0 {
            filters.offset = 0;
        }

        self.call(move |conn| {
            let (where_clause, mut args) = build_where(&filters);

            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM proxy_list {}", where_clause),
                params_from_iter(args.iter()),
                |row| row.get(0),
            )?;

            let query = format!(
                "SELECT {} FROM proxy_list {} ORDER BY last_seen DESC, id DESC LIMIT ? OFFSET ?",
                SELECT_COLUMNS, where_clause
            );
            args.push(SqlArg::Int(filters.limit));
            args.push(SqlArg::Int(filters.offset));

            let mut stmt = conn.prepare(&query)?;
            let records = stmt
                .query_map(params_from_iter(args.iter()), row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok((records, total))
        })
        .await
    }

    pub async fn list_recent_proxies(
        &self,
        limit: i64,
    ) -> Result<Vec<ProxyListRecord>, StoreError> {
        let limit = clamp_sample_limit(limit);
        self.call(move |conn| {
            let query = format!(
                "SELECT {} FROM proxy_list ORDER BY last_seen DESC, id DESC LIMIT ?1",
                SELECT_COLUMNS
            );
            let mut stmt = conn.prepare(&query)?;
            let rows = stmt
                .query_map(params![limit], row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>();
            rows
        })
        .await
    }

    pub async fn list_random_proxies(
        &self,
        limit: i64,
    ) -> Result<Vec<ProxyListRecord>, StoreError> {
        let limit = clamp_sample_limit(limit);
        self.call(move |conn| {
            let query = format!(
                "SELECT {} FROM proxy_list ORDER BY RANDOM() LIMIT ?1",
                SELECT_COLUMNS
            );
            let mut stmt = conn.prepare(&query)?;
            let rows = stmt
                .query_map(params![limit], row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>();
            rows
        })
        .await
    }

    pub async fn proxy_stats(&self) -> Result<ProxyStats, StoreError> {
        self.call(|conn| {
            let (total, countries, checks_up, checks_down, http, https, socks4, socks5) = conn
                .query_row(
                    "SELECT
                        COUNT(*),
                        COUNT(DISTINCT CASE WHEN country_code IS NOT NULL AND country_code != '' THEN country_code END),
                        COALESCE(SUM(checks_up), 0),
                        COALESCE(SUM(checks_down), 0),
                        COALESCE(SUM(CASE WHEN http = 1 THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN ssl = 1 THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN socks4 = 1 THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN socks5 = 1 THEN 1 ELSE 0 END), 0)
                     FROM proxy_list",
                    [],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, i64>(5)?,
                            row.get::<_, i64>(6)?,
                            row.get::<_, i64>(7)?,
                        ))
                    },
                )?;

            let total_checks = checks_up + checks_down;
            let avg_uptime = if total_checks > 0 {
                (checks_up as f64 / total_checks as f64 * 100.0).round() as i64
            } else {
                0
            };

            Ok(ProxyStats {
                total,
                countries,
                avg_uptime,
                protocols: ProtocolCounts {
                    http,
                    https,
                    socks4,
                    socks5,
                },
            })
        })
        .await
    }

    pub async fn list_proxy_facets(
        &self,
        facet_type: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FacetRecord>, StoreError> {
        let facet_type = facet_type.to_string();
        self.call(move |conn| {
            let mut query = String::from(
                "SELECT type, key, count, avg_delay, metadata, updated_at
                 FROM facets WHERE type = ?1
                 ORDER BY count DESC, key ASC",
            );
            let mut args = vec![SqlArg::Text(facet_type)];
            if limit > 0 {
                query.push_str(" LIMIT ?2 OFFSET ?3");
                args.push(SqlArg::Int(limit));
                args.push(SqlArg::Int(offset.max(0)));
            }

            let mut stmt = conn.prepare(&query)?;
            let rows = stmt
                .query_map(params_from_iter(args.iter()), row_to_facet)?
                .collect::<rusqlite::Result<Vec<_>>>();
            rows
        })
        .await
    }

    pub async fn count_proxy_facets(&self, facet_type: &str) -> Result<i64, StoreError> {
        let facet_type = facet_type.to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM facets WHERE type = ?1",
                params![facet_type],
                |row| row.get(0),
            )
        })
        .await
    }

    /// ASN drilldown: aggregate row, top 10 countries, protocol counts.
    pub async fn asn_details(&self, asn: i64) -> Result<AsnDetails, StoreError> {
        if asn <= 0 {
            return Ok(AsnDetails {
                asn,
                ..Default::default()
            });
        }

        self.call(move |conn| {
            let mut details = AsnDetails {
                asn,
                ..Default::default()
            };

            let header = conn.query_row(
                "SELECT COALESCE(asn, 0),
                        COALESCE(asn_name, ''),
                        COALESCE(org, ''),
                        COUNT(*),
                        COALESCE(AVG(delay), 0)
                 FROM proxy_list
                 WHERE asn = ?1
                 GROUP BY asn, asn_name, org",
                params![asn],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, f64>(4)?,
                    ))
                },
            );
            match header {
                Ok((_, name, org, count, avg_delay)) => {
                    details.name = name;
                    details.org = org;
                    details.count = count;
                    details.avg_delay = avg_delay;
                }
                Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(details),
                Err(e) => return Err(e),
            }

            let mut stmt = conn.prepare(
                "SELECT country_code, COALESCE(country_name, ''), COUNT(*), COALESCE(AVG(delay), 0)
                 FROM proxy_list
                 WHERE asn = ?1 AND country_code IS NOT NULL AND country_code != ''
                 GROUP BY country_code, country_name
                 ORDER BY COUNT(*) DESC
                 LIMIT 10",
            )?;
            details.countries = stmt
                .query_map(params![asn], |row| {
                    Ok(AsnCountryStat {
                        code: row.get::<_, String>(0)?.to_uppercase(),
                        name: row.get(1)?,
                        count: row.get(2)?,
                        avg_delay: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            details.protocols = conn.query_row(
                "SELECT
                    COALESCE(SUM(CASE WHEN http = 1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN ssl = 1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN socks4 = 1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN socks5 = 1 THEN 1 ELSE 0 END), 0)
                 FROM proxy_list WHERE asn = ?1",
                params![asn],
                |row| {
                    Ok(AsnProtocolSummary {
                        http: row.get(0)?,
                        https: row.get(1)?,
                        socks4: row.get(2)?,
                        socks5: row.get(3)?,
                    })
                },
            )?;

            Ok(details)
        })
        .await
    }

    /// Wipe and reinsert the facet table from the catalog, atomically.
    pub async fn rebuild_proxy_facets(&self) -> Result<(), StoreError> {
        self.call(|conn| {
            let records = compute_facets(conn)?;

            let tx = conn.transaction()?;
            tx.execute("DELETE FROM facets", [])?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO facets (type, key, count, avg_delay, metadata, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for record in &records {
                    let metadata = record
                        .metadata
                        .as_ref()
                        .map(|value| value.to_string());
                    stmt.execute(params![
                        record.facet_type,
                        record.key,
                        record.count,
                        record.avg_delay,
                        metadata,
                        fmt_ts(record.updated_at),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

fn clamp_sample_limit(limit: i64) -> i64 {
    if limit <= 0 {
        10
    } else if limit > 100 {
        100
    } else {
        limit
    }
}

fn build_where(filters: &ProxyListFilters) -> (String, Vec<SqlArg>) {
    let mut clauses = vec!["1=1".to_string()];
    let mut args = Vec::new();

    if !filters.country_code.is_empty() {
        clauses.push("country_code = ?".to_string());
        args.push(SqlArg::Text(filters.country_code.to_uppercase()));
    }
    if filters.port > 0 {
        clauses.push("port = ?".to_string());
        args.push(SqlArg::Int(filters.port));
    }
    if !filters.protocol.is_empty() {
        if let Some(column) = protocol_column(&filters.protocol) {
            clauses.push(format!("{} = 1", column));
        }
    }
    if !filters.city.is_empty() {
        clauses.push("LOWER(city) = LOWER(?)".to_string());
        args.push(SqlArg::Text(filters.city.clone()));
    }
    if !filters.region.is_empty() {
        clauses.push("LOWER(region) = LOWER(?)".to_string());
        args.push(SqlArg::Text(filters.region.clone()));
    }
    if filters.asn > 0 {
        clauses.push("asn = ?".to_string());
        args.push(SqlArg::Int(filters.asn));
    }
    if !filters.anonymity.is_empty() {
        let levels = anonymity_levels(&filters.anonymity);
        if !levels.is_empty() {
            let placeholders = vec!["?"; levels.len()].join(",");
            clauses.push(format!("anon IN ({})", placeholders));
            for level in levels {
                args.push(SqlArg::Int(level));
            }
        }
    }
    if let Some(since) = filters.since {
        clauses.push("last_seen >= ?".to_string());
        args.push(SqlArg::Text(fmt_ts(Some(since)).unwrap_or_default()));
    }

    (format!("WHERE {}", clauses.join(" AND ")), args)
}

fn protocol_column(protocol: &str) -> Option<&'static str> {
    match protocol.to_lowercase().as_str() {
        "http" => Some("http"),
        "https" => Some("ssl"),
        "socks4" => Some("socks4"),
        "socks5" => Some("socks5"),
        _ => None,
    }
}

/// Anonymity labels map onto the 0..5 feed ordinal in pairs.
fn anonymity_levels(level: &str) -> Vec<i64> {
    match level.to_lowercase().as_str() {
        "elite" => vec![4, 5],
        "anonymous" => vec![2, 3],
        "transparent" => vec![0, 1],
        _ => Vec::new(),
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<ProxyListRecord> {
    Ok(ProxyListRecord {
        id: row.get(0)?,
        host: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        ip: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        port: row.get(3)?,
        last_seen: parse_ts(row.get(4)?),
        delay: row.get::<_, Option<i64>>(5)?.unwrap_or(0),
        cid: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        country_code: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        country_name: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
        city: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
        region: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
        asn: row.get::<_, Option<i64>>(11)?.unwrap_or(0),
        asn_name: row.get::<_, Option<String>>(12)?.unwrap_or_default(),
        org: row.get::<_, Option<String>>(13)?.unwrap_or_default(),
        continent_code: row.get::<_, Option<String>>(14)?.unwrap_or_default(),
        checks_up: row.get::<_, Option<i64>>(15)?.unwrap_or(0),
        checks_down: row.get::<_, Option<i64>>(16)?.unwrap_or(0),
        anon: row.get::<_, Option<i64>>(17)?.unwrap_or(0),
        http: row.get::<_, Option<i64>>(18)?.unwrap_or(0),
        ssl: row.get::<_, Option<i64>>(19)?.unwrap_or(0),
        socks4: row.get::<_, Option<i64>>(20)?.unwrap_or(0),
        socks5: row.get::<_, Option<i64>>(21)?.unwrap_or(0),
        created_at: parse_ts(row.get(22)?),
        updated_at: parse_ts(row.get(23)?),
    })
}

fn row_to_facet(row: &Row<'_>) -> rusqlite::Result<FacetRecord> {
    let metadata: Option<String> = row.get(4)?;
    let metadata = metadata
        .filter(|raw| !raw.is_empty())
        .and_then(|raw| serde_json::from_str(&raw).ok());

    Ok(FacetRecord {
        facet_type: row.get(0)?,
        key: row.get(1)?,
        count: row.get(2)?,
        avg_delay: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
        metadata,
        updated_at: parse_ts(row.get(5)?),
    })
}

/// Group-by projections of the catalog, one pass per facet type.
fn compute_facets(conn: &Connection) -> rusqlite::Result<Vec<FacetRecord>> {
    let now = Utc::now();
    let mut records = Vec::new();

    let mut stmt = conn.prepare(
        "SELECT country_code, COALESCE(country_name, ''), COUNT(*), COALESCE(AVG(delay), 0)
         FROM proxy_list
         WHERE country_code IS NOT NULL AND country_code != ''
         GROUP BY country_code, country_name",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, f64>(3)?,
        ))
    })?;
    for row in rows {
        let (code, name, count, avg_delay) = row?;
        let mut meta = serde_json::Map::new();
        if !name.is_empty() {
            meta.insert("name".to_string(), serde_json::Value::String(name));
        }
        records.push(FacetRecord {
            facet_type: "country".to_string(),
            key: code.to_uppercase(),
            count,
            avg_delay,
            metadata: Some(serde_json::Value::Object(meta)),
            updated_at: Some(now),
        });
    }

    let mut stmt = conn.prepare(
        "SELECT port, COUNT(*), COALESCE(AVG(delay), 0) FROM proxy_list GROUP BY port",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, f64>(2)?,
        ))
    })?;
    for row in rows {
        let (port, count, avg_delay) = row?;
        records.push(FacetRecord {
            facet_type: "port".to_string(),
            key: port.to_string(),
            count,
            avg_delay,
            metadata: None,
            updated_at: Some(now),
        });
    }

    let mut stmt = conn.prepare(
        "SELECT COALESCE(country_code, ''), COALESCE(country_name, ''), city, COUNT(*), COALESCE(AVG(delay), 0)
         FROM proxy_list
         WHERE city IS NOT NULL AND city != ''
         GROUP BY country_code, country_name, city",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, f64>(4)?,
        ))
    })?;
    for row in rows {
        let (code, country_name, city, count, avg_delay) = row?;
        let mut meta = serde_json::Map::new();
        meta.insert("name".to_string(), serde_json::Value::String(city.clone()));
        if !code.is_empty() {
            meta.insert(
                "country_code".to_string(),
                serde_json::Value::String(code.to_uppercase()),
            );
        }
        if !country_name.is_empty() {
            meta.insert(
                "country_name".to_string(),
                serde_json::Value::String(country_name),
            );
        }
        let key = if code.is_empty() {
            city
        } else {
            format!("{}|{}", code.to_uppercase(), city)
        };
        records.push(FacetRecord {
            facet_type: "city".to_string(),
            key,
            count,
            avg_delay,
            metadata: Some(serde_json::Value::Object(meta)),
            updated_at: Some(now),
        });
    }

    let mut stmt = conn.prepare(
        "SELECT COALESCE(country_code, ''), COALESCE(country_name, ''), region, COUNT(*), COALESCE(AVG(delay), 0)
         FROM proxy_list
         WHERE region IS NOT NULL AND region != ''
         GROUP BY country_code, country_name, region",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, f64>(4)?,
        ))
    })?;
    for row in rows {
        let (code, country_name, region, count, avg_delay) = row?;
        let mut meta = serde_json::Map::new();
        meta.insert("name".to_string(), serde_json::Value::String(region.clone()));
        if !code.is_empty() {
            meta.insert(
                "country_code".to_string(),
                serde_json::Value::String(code.to_uppercase()),
            );
        }
        if !country_name.is_empty() {
            meta.insert(
                "country_name".to_string(),
                serde_json::Value::String(country_name),
            );
        }
        let key = if code.is_empty() {
            region
        } else {
            format!("{}|{}", code.to_uppercase(), region)
        };
        records.push(FacetRecord {
            facet_type: "region".to_string(),
            key,
            count,
            avg_delay,
            metadata: Some(serde_json::Value::Object(meta)),
            updated_at: Some(now),
        });
    }

    let mut stmt = conn.prepare(
        "SELECT asn, COALESCE(asn_name, ''), COALESCE(org, ''), COUNT(*), COALESCE(AVG(delay), 0)
         FROM proxy_list
         WHERE asn IS NOT NULL AND asn > 0
         GROUP BY asn, asn_name, org",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, f64>(4)?,
        ))
    })?;
    for row in rows {
        let (asn, name, org, count, avg_delay) = row?;
        let mut meta = serde_json::Map::new();
        if !name.is_empty() {
            meta.insert("name".to_string(), serde_json::Value::String(name));
        }
        if !org.is_empty() {
            meta.insert("org".to_string(), serde_json::Value::String(org));
        }
        records.push(FacetRecord {
            facet_type: "asn".to_string(),
            key: asn.to_string(),
            count,
            avg_delay,
            metadata: Some(serde_json::Value::Object(meta)),
            updated_at: Some(now),
        });
    }

    let (http, https, socks4, socks5) = conn.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN http = 1 THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN ssl = 1 THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN socks4 = 1 THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN socks5 = 1 THEN 1 ELSE 0 END), 0)
         FROM proxy_list",
        [],
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        },
    )?;
    for (key, count) in [
        ("http", http),
        ("https", https),
        ("socks4", socks4),
        ("socks5", socks5),
    ] {
        if count == 0 {
            continue;
        }
        records.push(FacetRecord {
            facet_type: "protocol".to_string(),
            key: key.to_string(),
            count,
            avg_delay: 0.0,
            metadata: None,
            updated_at: Some(now),
        });
    }

    Ok(records)
}
