use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};

use crate::store::ProxyListRecord;

const DEFAULT_BATCH_SIZE: usize = 2000;

/// Incremental parser for the semicolon-delimited catalog feed. Chunks are
/// pushed as they arrive off the wire; complete batches of records come
/// back out, so the whole feed never has to sit in memory.
///
/// The first row is the header; fields are resolved by lower-cased header
/// name, unknown headers are ignored and missing ones read as empty.
/// Rows without a valid IP or with a port outside 1..65535 are skipped.
pub struct FeedParser {
    buf: Vec<u8>,
    headers: Option<HashMap<String, usize>>,
    batch: Vec<ProxyListRecord>,
    batch_size: usize,
    processed: usize,
    now: DateTime<Utc>,
}

impl FeedParser {
    pub fn new(batch_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            headers: None,
            batch: Vec::new(),
            batch_size: if batch_size == 0 {
                DEFAULT_BATCH_SIZE
            } else {
                batch_size
            },
            processed: 0,
            now: Utc::now(),
        }
    }

    /// Feed a chunk; returns every batch completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<ProxyListRecord>> {
        self.buf.extend_from_slice(chunk);

        let mut batches = Vec::new();
        while let Some(newline) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=newline).collect();
            if let Some(batch) = self.consume_line(&line[..line.len() - 1]) {
                batches.push(batch);
            }
        }
        batches
    }

    /// Flush the trailing unterminated line and the final partial batch.
    pub fn finish(mut self) -> (Vec<Vec<ProxyListRecord>>, usize) {
        let mut batches = Vec::new();
        if !self.buf.is_empty() {
            let line = std::mem::take(&mut self.buf);
            if let Some(batch) = self.consume_line(&line) {
                batches.push(batch);
            }
        }
        if !self.batch.is_empty() {
            batches.push(std::mem::take(&mut self.batch));
        }
        (batches, self.processed)
    }

    pub fn processed(&self) -> usize {
        self.processed
    }

    fn consume_line(&mut self, line: &[u8]) -> Option<Vec<ProxyListRecord>> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            return None;
        }

        let fields: Vec<&str> = line.split(';').map(str::trim).collect();

        let Some(headers) = &self.headers else {
            let mut index = HashMap::new();
            for (idx, header) in fields.iter().enumerate() {
                index.insert(header.to_lowercase(), idx);
            }
            self.headers = Some(index);
            return None;
        };

        let get = |key: &str| -> &str {
            headers
                .get(key)
                .and_then(|&idx| fields.get(idx))
                .copied()
                .unwrap_or("")
        };

        let host = get("host");
        let mut ip = get("ip");
        if ip.is_empty() {
            ip = host;
        }
        let port = parse_int(get("port"));
        if ip.parse::<std::net::IpAddr>().is_err() || !(1..=65535).contains(&port) {
            return None;
        }

        let last_seen = parse_last_seen(get("lastseen"), self.now).unwrap_or(self.now);

        let host = if host.is_empty() { ip } else { host };
        let record = ProxyListRecord {
            id: 0,
            host: host.to_string(),
            ip: ip.to_string(),
            port,
            last_seen: Some(last_seen),
            delay: parse_int(get("delay")),
            cid: get("cid").to_string(),
            country_code: get("country_code").to_uppercase(),
            country_name: get("country_name").to_string(),
            city: get("city").to_string(),
            region: get("region").to_string(),
            asn: parse_int(get("asn")),
            asn_name: get("asn_name").to_string(),
            org: get("org").to_string(),
            continent_code: get("continent_code").to_uppercase(),
            checks_up: parse_int(get("checks_up")),
            checks_down: parse_int(get("checks_down")),
            anon: parse_int(get("anon")),
            http: parse_int(get("http")),
            ssl: parse_int(get("ssl")),
            socks4: parse_int(get("socks4")),
            socks5: parse_int(get("socks5")),
            created_at: Some(self.now),
            updated_at: Some(self.now),
        };

        self.batch.push(record);
        self.processed += 1;

        if self.batch.len() >= self.batch_size {
            Some(std::mem::take(&mut self.batch))
        } else {
            None
        }
    }
}

fn parse_int(raw: &str) -> i64 {
    raw.trim().parse().unwrap_or(0)
}

/// The feed's `lastseen` column is encoded loosely: values above 10^12 are
/// Unix milliseconds, above 10^9 Unix seconds, anything smaller is
/// "seconds ago from now".
fn parse_last_seen(raw: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let value: i64 = raw.trim().parse().ok()?;
    if value <= 0 {
        return None;
    }
    if value > 1_000_000_000_000 {
        Utc.timestamp_millis_opt(value).single()
    } else if value > 1_000_000_000 {
        Utc.timestamp_opt(value, 0).single()
    } else {
        Some(now - chrono::Duration::seconds(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str =
        "ip;host;port;lastseen;delay;cid;country_code;country_name;city;region;asn;asn_name;org;continent_code;checks_up;checks_down;anon;http;ssl;socks4;socks5\n";

    fn parse_all(input: &str) -> (Vec<ProxyListRecord>, usize) {
        let mut parser = FeedParser::new(0);
        let mut records = Vec::new();
        for batch in parser.push(input.as_bytes()) {
            records.extend(batch);
        }
        let (batches, processed) = parser.finish();
        for batch in batches {
            records.extend(batch);
        }
        (records, processed)
    }

    #[test]
    fn test_parses_full_row() {
        let input = format!(
            "{}198.51.100.1;proxy.example;1080;1700000000;120;abc;us;United States;New York;NY;13335;CLOUDFLARENET;Cloudflare;NA;8;2;4;0;0;0;1\n",
            HEADER
        );
        let (records, processed) = parse_all(&input);
        assert_eq!(processed, 1);
        let record = &records[0];
        assert_eq!(record.ip, "198.51.100.1");
        assert_eq!(record.host, "proxy.example");
        assert_eq!(record.port, 1080);
        assert_eq!(record.country_code, "US");
        assert_eq!(record.anon, 4);
        assert_eq!(record.socks5, 1);
        assert_eq!(record.last_seen.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_skips_invalid_rows() {
        let input = format!(
            "{};;1080;;;;;;;;;;;;;;;;;;\n198.51.100.1;;0;;;;;;;;;;;;;;;;;;\n198.51.100.1;;70000;;;;;;;;;;;;;;;;;;\nnot-an-ip;;1080;;;;;;;;;;;;;;;;;;\n198.51.100.9;;1080;;;;;;;;;;;;;;;;;;\n",
            HEADER
        );
        let (records, processed) = parse_all(&input);
        assert_eq!(processed, 1);
        assert_eq!(records[0].ip, "198.51.100.9");
    }

    #[test]
    fn test_unknown_headers_ignored_missing_empty() {
        let input = "ip;port;mystery\n198.51.100.1;8080;whatever\n";
        let (records, processed) = parse_all(input);
        assert_eq!(processed, 1);
        assert_eq!(records[0].port, 8080);
        assert_eq!(records[0].country_code, "");
        assert_eq!(records[0].host, "198.51.100.1");
    }

    #[test]
    fn test_lastseen_heuristics() {
        let now = Utc::now();
        assert_eq!(
            parse_last_seen("1700000000000", now).unwrap().timestamp(),
            1_700_000_000
        );
        assert_eq!(
            parse_last_seen("1700000000", now).unwrap().timestamp(),
            1_700_000_000
        );
        let ago = parse_last_seen("300", now).unwrap();
        assert_eq!((now - ago).num_seconds(), 300);
        assert!(parse_last_seen("", now).is_none());
        assert!(parse_last_seen("-5", now).is_none());
        assert!(parse_last_seen("abc", now).is_none());
    }

    #[test]
    fn test_batching_across_chunks() {
        let mut parser = FeedParser::new(2);
        let mut input = String::from("ip;port\n");
        for i in 1..=5 {
            input.push_str(&format!("198.51.100.{};1080\n", i));
        }

        // Feed byte by byte to exercise partial-line buffering.
        let mut batches = Vec::new();
        for byte in input.as_bytes() {
            batches.extend(parser.push(&[*byte]));
        }
        let (tail, processed) = parser.finish();
        batches.extend(tail);

        assert_eq!(processed, 5);
        let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_trailing_line_without_newline() {
        let input = "ip;port\n198.51.100.1;1080";
        let mut parser = FeedParser::new(100);
        parser.push(input.as_bytes());
        let (batches, processed) = parser.finish();
        assert_eq!(processed, 1);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].port, 1080);
    }

    #[test]
    fn test_crlf_lines() {
        let input = "ip;port\r\n198.51.100.1;1080\r\n";
        let (records, processed) = parse_all(input);
        assert_eq!(processed, 1);
        assert_eq!(records[0].port, 1080);
    }
}
