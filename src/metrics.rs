use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// Process-wide service counters, exported in Prometheus text format.
pub struct ServiceMetrics {
    started_at: Instant,

    pub requests_total: AtomicU64,
    pub requests_blocked_waf: AtomicU64,
    pub requests_rate_limited: AtomicU64,

    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,

    pub ws_sessions_total: AtomicU64,
    pub ws_sessions_active: AtomicI64,
    pub ws_sessions_rejected: AtomicU64,

    pub checks_total: AtomicU64,
    pub checks_up: AtomicU64,

    pub sync_runs_total: AtomicU64,
    pub sync_failures_total: AtomicU64,
    pub sync_records_total: AtomicU64,

    pub export_jobs_total: AtomicU64,
    pub export_jobs_failed: AtomicU64,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            requests_total: AtomicU64::new(0),
            requests_blocked_waf: AtomicU64::new(0),
            requests_rate_limited: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            ws_sessions_total: AtomicU64::new(0),
            ws_sessions_active: AtomicI64::new(0),
            ws_sessions_rejected: AtomicU64::new(0),
            checks_total: AtomicU64::new(0),
            checks_up: AtomicU64::new(0),
            sync_runs_total: AtomicU64::new(0),
            sync_failures_total: AtomicU64::new(0),
            sync_records_total: AtomicU64::new(0),
            export_jobs_total: AtomicU64::new(0),
            export_jobs_failed: AtomicU64::new(0),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, delta: u64) {
        counter.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Render all counters in the Prometheus text exposition format.
    pub fn to_prometheus_format(&self) -> String {
        let mut out = String::with_capacity(2048);

        write_metric(
            &mut out,
            "proxydex_uptime_seconds",
            "gauge",
            "Service uptime in seconds",
            self.uptime_seconds() as i64,
        );
        write_metric(
            &mut out,
            "proxydex_requests_total",
            "counter",
            "HTTP requests processed",
            self.requests_total.load(Ordering::Relaxed) as i64,
        );
        write_metric(
            &mut out,
            "proxydex_requests_blocked_waf_total",
            "counter",
            "Requests rejected by the WAF gate",
            self.requests_blocked_waf.load(Ordering::Relaxed) as i64,
        );
        write_metric(
            &mut out,
            "proxydex_requests_rate_limited_total",
            "counter",
            "Requests refused by the rate limiter",
            self.requests_rate_limited.load(Ordering::Relaxed) as i64,
        );
        write_metric(
            &mut out,
            "proxydex_cache_hits_total",
            "counter",
            "Response cache hits",
            self.cache_hits.load(Ordering::Relaxed) as i64,
        );
        write_metric(
            &mut out,
            "proxydex_cache_misses_total",
            "counter",
            "Response cache misses",
            self.cache_misses.load(Ordering::Relaxed) as i64,
        );
        write_metric(
            &mut out,
            "proxydex_ws_sessions_total",
            "counter",
            "WebSocket validation sessions accepted",
            self.ws_sessions_total.load(Ordering::Relaxed) as i64,
        );
        write_metric(
            &mut out,
            "proxydex_ws_sessions_active",
            "gauge",
            "WebSocket validation sessions currently open",
            self.ws_sessions_active.load(Ordering::Relaxed),
        );
        write_metric(
            &mut out,
            "proxydex_ws_sessions_rejected_total",
            "counter",
            "WebSocket sessions refused at admission",
            self.ws_sessions_rejected.load(Ordering::Relaxed) as i64,
        );
        write_metric(
            &mut out,
            "proxydex_checks_total",
            "counter",
            "Proxy checks performed",
            self.checks_total.load(Ordering::Relaxed) as i64,
        );
        write_metric(
            &mut out,
            "proxydex_checks_up_total",
            "counter",
            "Proxy checks that succeeded",
            self.checks_up.load(Ordering::Relaxed) as i64,
        );
        write_metric(
            &mut out,
            "proxydex_sync_runs_total",
            "counter",
            "Catalog sync runs completed",
            self.sync_runs_total.load(Ordering::Relaxed) as i64,
        );
        write_metric(
            &mut out,
            "proxydex_sync_failures_total",
            "counter",
            "Catalog sync runs that failed",
            self.sync_failures_total.load(Ordering::Relaxed) as i64,
        );
        write_metric(
            &mut out,
            "proxydex_sync_records_total",
            "counter",
            "Catalog records upserted by sync",
            self.sync_records_total.load(Ordering::Relaxed) as i64,
        );
        write_metric(
            &mut out,
            "proxydex_export_jobs_total",
            "counter",
            "Export jobs created",
            self.export_jobs_total.load(Ordering::Relaxed) as i64,
        );
        write_metric(
            &mut out,
            "proxydex_export_jobs_failed_total",
            "counter",
            "Export jobs that failed",
            self.export_jobs_failed.load(Ordering::Relaxed) as i64,
        );

        out
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn write_metric(out: &mut String, name: &str, kind: &str, help: &str, value: i64) {
    out.push_str(&format!(
        "# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n"
    ));
}
