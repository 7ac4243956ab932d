use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use tracing::warn;

/// Service configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub redis_addr: String,
    pub redis_password: String,
    pub redis_db: i64,
    pub database_path: PathBuf,
    pub database_url: String,
    pub judge_url: String,
    pub geoip_city_path: String,
    pub geoip_asn_path: String,
    pub proxy_source_url: String,
    pub proxy_sync_interval: Duration,
    pub proxy_request_timeout: Duration,
    pub proxy_web_cache_ttl: Duration,
    pub proxy_api_cache_ttl: Duration,
    pub proxy_list_window_hours: i64,
    pub proxy_retention_hours: i64,
    pub api_keys: Vec<String>,
    pub api_rate_limit_hour: i64,
    pub api_rate_limit_window: Duration,
    pub api_rate_limit_light: i64,
    pub api_rate_limit_standard: i64,
    pub api_rate_limit_heavy: i64,
    pub rate_limit_free: i64,
    pub rate_limit_basic: i64,
    pub rate_limit_pro: i64,
    pub rate_limit_per_day: i64,
    pub max_concurrent: usize,
    pub max_websocket_connections: usize,
    pub allowed_origins: Vec<String>,
    pub trusted_proxies: Vec<String>,
    pub environment: String,
    pub max_body_size: u64,
    pub log_level: String,
    pub slow_request_threshold: Duration,
    pub waf_enabled: bool,
    pub export_dir: PathBuf,
    pub export_job_ttl: Duration,
    pub metrics_token: String,
    pub metrics_public: bool,
    pub metrics_allowed_ips: Vec<String>,
    pub metrics_basic_user: String,
    pub metrics_basic_pass: String,
}

impl Config {
    /// Load configuration from the environment, applying defaults.
    pub fn from_env() -> Self {
        let environment = get_env("ENVIRONMENT", "development");
        let waf_default = environment == "production";

        Self {
            port: get_env_parsed("PORT", 8080u16),
            redis_addr: get_env("REDIS_ADDR", "localhost:6379"),
            redis_password: get_env("REDIS_PASSWORD", ""),
            redis_db: get_env_parsed("REDIS_DB", 0i64),
            database_path: PathBuf::from(get_env("DB_PATH", "./data/proxydex.db")),
            database_url: get_env("DATABASE_URL", ""),
            judge_url: get_env("JUDGE_URL", "https://api.ipify.org?format=text"),
            geoip_city_path: get_env("GEOIP_CITY_DB", &get_env("GEOIP_DB", "")),
            geoip_asn_path: get_env("GEOIP_ASN_DB", ""),
            proxy_source_url: get_env("PROXY_SOURCE_URL", ""),
            proxy_sync_interval: get_env_duration("PROXY_SYNC_INTERVAL", Duration::from_secs(300)),
            proxy_request_timeout: get_env_duration("PROXY_REQUEST_TIMEOUT", Duration::from_secs(30)),
            proxy_web_cache_ttl: get_env_duration("PROXY_WEB_CACHE_TTL", Duration::from_secs(3600)),
            proxy_api_cache_ttl: get_env_duration("PROXY_API_CACHE_TTL", Duration::from_secs(300)),
            proxy_list_window_hours: get_env_parsed("PROXY_LIST_WINDOW_HOURS", 48i64),
            proxy_retention_hours: get_env_parsed("PROXY_RETENTION_HOURS", 48i64),
            api_keys: get_env_list("API_KEYS", ""),
            api_rate_limit_hour: get_env_parsed("API_RATE_LIMIT_HOUR", 1000i64),
            api_rate_limit_window: get_env_duration("API_RATE_LIMIT_WINDOW", Duration::from_secs(3600)),
            api_rate_limit_light: get_env_parsed("API_RATE_LIMIT_LIGHT", 3000i64),
            api_rate_limit_standard: get_env_parsed("API_RATE_LIMIT_STANDARD", 1200i64),
            api_rate_limit_heavy: get_env_parsed("API_RATE_LIMIT_HEAVY", 300i64),
            rate_limit_free: get_env_parsed("RATE_LIMIT_FREE", 100i64),
            rate_limit_basic: get_env_parsed("RATE_LIMIT_BASIC", 1000i64),
            rate_limit_pro: get_env_parsed("RATE_LIMIT_PRO", 10000i64),
            rate_limit_per_day: get_env_parsed("RATE_LIMIT_PER_DAY", 100i64),
            max_concurrent: get_env_parsed("MAX_CONCURRENT", 50usize),
            max_websocket_connections: get_env_parsed("MAX_WEBSOCKET_CONNECTIONS", 10usize),
            allowed_origins: get_env_list("ALLOWED_ORIGINS", "*"),
            trusted_proxies: get_env_list("TRUSTED_PROXIES", "127.0.0.1,::1"),
            environment,
            max_body_size: get_env_parsed("MAX_BODY_SIZE_KB", 100u64) * 1024,
            log_level: get_env("LOG_LEVEL", "info"),
            slow_request_threshold: get_env_duration("SLOW_REQUEST_THRESHOLD", Duration::from_secs(2)),
            waf_enabled: get_env_bool("WAF_ENABLED", waf_default),
            export_dir: PathBuf::from(get_env("EXPORT_DIR", "./data/exports")),
            export_job_ttl: get_env_duration("EXPORT_JOB_TTL", Duration::from_secs(2 * 3600)),
            metrics_token: get_env("METRICS_TOKEN", ""),
            metrics_public: get_env_bool("METRICS_PUBLIC", false),
            metrics_allowed_ips: get_env_list("METRICS_ALLOWED_IPS", ""),
            metrics_basic_user: get_env("METRICS_BASIC_USER", ""),
            metrics_basic_pass: get_env("METRICS_BASIC_PASS", ""),
        }
    }

    /// Validate and clamp configuration. Hard errors abort startup; soft
    /// violations are clamped with a warning.
    pub fn validate(&mut self) -> anyhow::Result<()> {
        if self.port == 0 {
            bail!("invalid port: cannot be 0");
        }
        if self.redis_db < 0 || self.redis_db > 15 {
            bail!("invalid redis db number: {}", self.redis_db);
        }

        if self.is_production() {
            if self.allowed_origins.is_empty() {
                bail!("ALLOWED_ORIGINS required in production");
            }
            if self.allowed_origins.iter().any(|o| o == "*") {
                bail!("ALLOWED_ORIGINS cannot include '*' in production");
            }
            if !self.metrics_public
                && self.metrics_allowed_ips.is_empty()
                && self.metrics_token.is_empty()
                && (self.metrics_basic_user.is_empty() || self.metrics_basic_pass.is_empty())
            {
                warn!("metrics locked down: configure METRICS_ALLOWED_IPS, METRICS_TOKEN or METRICS_BASIC_USER/METRICS_BASIC_PASS to access /metrics");
            }
        }

        self.max_concurrent = self.max_concurrent.clamp(1, 500);
        if self.max_websocket_connections < 1 {
            self.max_websocket_connections = 5;
        }
        if self.api_rate_limit_light <= 0 {
            self.api_rate_limit_light = 3000;
        }
        if self.api_rate_limit_standard <= 0 {
            self.api_rate_limit_standard = 1200;
        }
        if self.api_rate_limit_heavy <= 0 {
            self.api_rate_limit_heavy = 300;
        }
        if self.api_rate_limit_window.is_zero() {
            self.api_rate_limit_window = Duration::from_secs(3600);
        }
        if self.proxy_list_window_hours <= 0 {
            self.proxy_list_window_hours = 48;
        }
        if self.proxy_retention_hours < self.proxy_list_window_hours {
            warn!(
                "PROXY_RETENTION_HOURS={} too low; raising to {} to satisfy the list window",
                self.proxy_retention_hours, self.proxy_list_window_hours
            );
            self.proxy_retention_hours = self.proxy_list_window_hours;
        }
        if self.export_job_ttl.is_zero() {
            self.export_job_ttl = Duration::from_secs(2 * 3600);
        }

        Ok(())
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }

    /// Redis connection URL in the form the client expects.
    pub fn redis_url(&self) -> String {
        if self.redis_password.is_empty() {
            format!("redis://{}/{}", self.redis_addr, self.redis_db)
        } else {
            format!("redis://:{}@{}/{}", self.redis_password, self.redis_addr, self.redis_db)
        }
    }
}

fn get_env(key: &str, fallback: &str) -> String {
    match std::env::var(key) {
        Ok(val) if !val.is_empty() => val,
        _ => fallback.to_string(),
    }
}

fn get_env_parsed<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    match std::env::var(key) {
        Ok(val) => val.trim().parse().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn get_env_bool(key: &str, fallback: bool) -> bool {
    let val = get_env(key, "");
    match val.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => true,
        "0" | "false" | "no" | "n" | "off" => false,
        _ => fallback,
    }
}

/// Durations accept integer seconds or a `30s` / `5m` / `2h` suffix.
fn get_env_duration(key: &str, fallback: Duration) -> Duration {
    let raw = get_env(key, "");
    let raw = raw.trim();
    if raw.is_empty() {
        return fallback;
    }
    parse_duration(raw).unwrap_or(fallback)
}

fn parse_duration(raw: &str) -> Option<Duration> {
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let (value, unit) = raw.split_at(raw.len().checked_sub(1)?);
    let value: u64 = value.trim().parse().ok()?;
    match unit {
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

fn get_env_list(key: &str, fallback: &str) -> Vec<String> {
    get_env(key, fallback)
        .split(',')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_lock() -> std::sync::MutexGuard<'static, ()> {
        static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
        ENV_LOCK.lock().unwrap()
    }

    #[test]
    fn test_defaults() {
        let _env = env_lock();
        for var in &[
            "PORT",
            "REDIS_ADDR",
            "ENVIRONMENT",
            "ALLOWED_ORIGINS",
            "MAX_CONCURRENT",
            "WAF_ENABLED",
        ] {
            std::env::remove_var(var);
        }

        let cfg = Config::from_env();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.redis_addr, "localhost:6379");
        assert_eq!(cfg.proxy_sync_interval, Duration::from_secs(300));
        assert_eq!(cfg.max_concurrent, 50);
        assert_eq!(cfg.max_websocket_connections, 10);
        assert_eq!(cfg.allowed_origins, vec!["*".to_string()]);
        assert!(!cfg.waf_enabled);
        assert!(cfg.is_development());
    }

    #[test]
    fn test_duration_suffixes() {
        assert_eq!(parse_duration("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("abc"), None);
    }

    #[test]
    fn test_validate_clamps_concurrency() {
        let _env = env_lock();
        let mut cfg = Config::from_env();
        cfg.max_concurrent = 0;
        cfg.validate().unwrap();
        assert_eq!(cfg.max_concurrent, 1);

        cfg.max_concurrent = 10_000;
        cfg.validate().unwrap();
        assert_eq!(cfg.max_concurrent, 500);
    }

    #[test]
    fn test_validate_raises_retention_to_window() {
        let _env = env_lock();
        let mut cfg = Config::from_env();
        cfg.proxy_list_window_hours = 72;
        cfg.proxy_retention_hours = 24;
        cfg.validate().unwrap();
        assert_eq!(cfg.proxy_retention_hours, 72);
    }

    #[test]
    fn test_production_rejects_wildcard_origin() {
        let _env = env_lock();
        let mut cfg = Config::from_env();
        cfg.environment = "production".to_string();
        cfg.allowed_origins = vec!["*".to_string()];
        assert!(cfg.validate().is_err());

        cfg.allowed_origins = vec!["https://example.com".to_string()];
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_invalid_redis_db_rejected() {
        let _env = env_lock();
        let mut cfg = Config::from_env();
        cfg.redis_db = 16;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_redis_url() {
        let _env = env_lock();
        let mut cfg = Config::from_env();
        cfg.redis_addr = "cache:6379".to_string();
        cfg.redis_db = 2;
        assert_eq!(cfg.redis_url(), "redis://cache:6379/2");

        cfg.redis_password = "secret".to_string();
        assert_eq!(cfg.redis_url(), "redis://:secret@cache:6379/2");
    }

    #[test]
    fn test_env_list_filters_empty_items() {
        let _env = env_lock();
        std::env::set_var("TEST_LIST_VAR", "a, b,, c ,");
        let list = get_env_list("TEST_LIST_VAR", "");
        assert_eq!(list, vec!["a", "b", "c"]);
        std::env::remove_var("TEST_LIST_VAR");
    }
}
