mod parser;

pub use parser::parse_proxy_line;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use crate::geoip::GeoReader;

/// Overall deadline for one check, transport acquire to response.
const CHECK_TIMEOUT: Duration = Duration::from_secs(12);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 10;

/// The judge echoes the caller's observable IP; only this much of the body
/// is ever read.
const MAX_JUDGE_BODY: usize = 256;

lazy_static! {
    static ref IPV4_PATTERN: Regex = Regex::new(r"(?:\d{1,3}\.){3}\d{1,3}").unwrap();
}

/// One proxy to validate, parsed from a client submission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProxyTarget {
    pub address: String,
    pub protocol: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Per-proxy validation outcome, streamed back to the client as its own
/// frame. Failures ride in `error`; they never terminate the session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProxyResult {
    pub ip: String,
    pub port: String,
    pub protocol: String,
    pub status: bool,
    pub latency: i64,
    pub country: String,
    pub anonymity: String,
    #[serde(rename = "checkedAt")]
    pub checked_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProxyResult {
    pub fn with_checked_at(mut self) -> Self {
        if self.checked_at.is_empty() {
            self.checked_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        }
        self
    }

    pub fn invalid(protocol: &str, reason: &str) -> Self {
        ProxyResult {
            protocol: protocol.to_lowercase(),
            status: false,
            error: Some(reason.to_string()),
            ..Default::default()
        }
        .with_checked_at()
    }
}

/// Dial the judge through the target proxy and classify what comes back.
pub async fn check_proxy(
    target: &ProxyTarget,
    judge_url: &str,
    geo: Option<&Arc<GeoReader>>,
) -> ProxyResult {
    let start = Instant::now();
    let mut result = ProxyResult {
        protocol: target.protocol.to_lowercase(),
        status: false,
        ..Default::default()
    };

    if let Some((host, port)) = target.address.rsplit_once(':') {
        result.ip = host.to_string();
        result.port = port.to_string();
    }

    let client = match build_client(target) {
        Ok(client) => client,
        Err(e) => {
            result.error = Some(e);
            return result.with_checked_at();
        }
    };

    let resp = match client.get(judge_url).send().await {
        Ok(resp) => resp,
        Err(e) => {
            result.error = Some(e.to_string());
            return result.with_checked_at();
        }
    };

    result.status = resp.status().is_success();

    let body = read_limited(resp).await;
    result.latency = start.elapsed().as_millis() as i64;

    if let Some(found) = IPV4_PATTERN.find(&body) {
        let exit_ip = found.as_str();
        result.anonymity = classify_anonymity(exit_ip, &result.ip);
        if result.ip.is_empty() {
            result.ip = exit_ip.to_string();
        }
    }

    if let Some(geo) = geo {
        if !result.ip.is_empty() {
            result.country = geo.lookup_country(&result.ip);
        }
    }

    result.with_checked_at()
}

/// Read at most `MAX_JUDGE_BODY` bytes of the response body.
async fn read_limited(mut resp: reqwest::Response) -> String {
    let mut buf = Vec::with_capacity(MAX_JUDGE_BODY);
    while buf.len() < MAX_JUDGE_BODY {
        match resp.chunk().await {
            Ok(Some(chunk)) => {
                let room = MAX_JUDGE_BODY - buf.len();
                buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
            }
            Ok(None) | Err(_) => break,
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Build a client whose connections are tunnelled through the target.
fn build_client(target: &ProxyTarget) -> Result<reqwest::Client, String> {
    let proxy = match target.protocol.to_lowercase().as_str() {
        "socks5" | "socks" => {
            let url = match (&target.username, &target.password) {
                (Some(user), Some(pass)) => {
                    format!("socks5://{}:{}@{}", user, pass, target.address)
                }
                _ => format!("socks5://{}", target.address),
            };
            reqwest::Proxy::all(&url).map_err(|e| e.to_string())?
        }
        "http" | "https" => {
            let mut proxy =
                reqwest::Proxy::all(&format!("http://{}", target.address)).map_err(|e| e.to_string())?;
            if let (Some(user), Some(pass)) = (&target.username, &target.password) {
                proxy = proxy.basic_auth(user, pass);
            }
            proxy
        }
        _ => return Err("unsupported proxy protocol".to_string()),
    };

    reqwest::Client::builder()
        .proxy(proxy)
        .timeout(CHECK_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .http1_only()
        .build()
        .map_err(|e| e.to_string())
}

/// A proxy is "anonymous" when the judge sees the proxy's own IP instead
/// of ours; anything else stays "unknown".
fn classify_anonymity(exit_ip: &str, proxy_ip: &str) -> String {
    if exit_ip.is_empty() {
        return "unknown".to_string();
    }
    if !proxy_ip.is_empty() && exit_ip == proxy_ip {
        return "anonymous".to_string();
    }
    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_anonymity() {
        assert_eq!(classify_anonymity("", "198.51.100.1"), "unknown");
        assert_eq!(classify_anonymity("203.0.113.9", "198.51.100.1"), "unknown");
        assert_eq!(
            classify_anonymity("198.51.100.1", "198.51.100.1"),
            "anonymous"
        );
        assert_eq!(classify_anonymity("198.51.100.1", ""), "unknown");
    }

    #[test]
    fn test_ipv4_extraction() {
        let body = "your address is 203.0.113.9 via gateway";
        assert_eq!(IPV4_PATTERN.find(body).unwrap().as_str(), "203.0.113.9");
        assert!(IPV4_PATTERN.find("no address here").is_none());
    }

    #[test]
    fn test_build_client_rejects_unknown_protocol() {
        let target = ProxyTarget {
            address: "198.51.100.1:1080".to_string(),
            protocol: "socks4".to_string(),
            ..Default::default()
        };
        let err = build_client(&target).unwrap_err();
        assert_eq!(err, "unsupported proxy protocol");
    }

    #[test]
    fn test_build_client_socks5_and_http() {
        let socks = ProxyTarget {
            address: "198.51.100.1:1080".to_string(),
            protocol: "socks5".to_string(),
            username: Some("alice".to_string()),
            password: Some("s3cret".to_string()),
        };
        assert!(build_client(&socks).is_ok());

        let http = ProxyTarget {
            address: "198.51.100.1:3128".to_string(),
            protocol: "http".to_string(),
            ..Default::default()
        };
        assert!(build_client(&http).is_ok());
    }

    #[tokio::test]
    async fn test_check_unreachable_proxy_reports_error() {
        let target = ProxyTarget {
            address: "127.0.0.1:1".to_string(),
            protocol: "http".to_string(),
            ..Default::default()
        };
        let result = check_proxy(&target, "http://127.0.0.1:1/judge", None).await;
        assert!(!result.status);
        assert!(result.error.is_some());
        assert_eq!(result.ip, "127.0.0.1");
        assert_eq!(result.port, "1");
        assert!(!result.checked_at.is_empty());
    }

    #[test]
    fn test_invalid_result_shape() {
        let result = ProxyResult::invalid("SOCKS5", "invalid proxy");
        assert_eq!(result.protocol, "socks5");
        assert!(!result.status);
        assert_eq!(result.error.as_deref(), Some("invalid proxy"));
        assert!(!result.checked_at.is_empty());
    }
}
