use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::warn;

use crate::counter::Counter;

const KEY_PREFIX: &str = "ratelimit";

/// Slack added on top of the window TTL so a key outlives clock skew.
const WINDOW_SLACK: Duration = Duration::from_secs(60);

/// Rate limit tier. Each tier is a distinct per-subject budget over the
/// same window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Free,
    Basic,
    Pro,
}

#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub free_limit: i64,
    pub basic_limit: i64,
    pub pro_limit: i64,
    pub window: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            free_limit: 100,
            basic_limit: 1000,
            pro_limit: 10000,
            window: Duration::from_secs(3600),
        }
    }
}

/// Fixed-window rate limiter over the shared counter. Admission is a single
/// atomic increment-with-expiry; the (limit+1)-th request in a window is
/// refused.
pub struct Limiter {
    counter: Arc<Counter>,
    free_limit: i64,
    basic_limit: i64,
    pro_limit: i64,
    window: Duration,
}

impl Limiter {
    pub fn new(counter: Arc<Counter>, limit: i64) -> Self {
        Self::with_config(
            counter,
            LimiterConfig {
                free_limit: limit,
                basic_limit: limit * 10,
                pro_limit: limit * 100,
                window: Duration::from_secs(3600),
            },
        )
    }

    pub fn with_config(counter: Arc<Counter>, mut cfg: LimiterConfig) -> Self {
        if cfg.free_limit <= 0 {
            cfg.free_limit = 100;
        }
        if cfg.basic_limit <= 0 {
            cfg.basic_limit = cfg.free_limit * 10;
        }
        if cfg.pro_limit <= 0 {
            cfg.pro_limit = cfg.free_limit * 100;
        }
        if cfg.window.is_zero() {
            cfg.window = Duration::from_secs(3600);
        }

        Self {
            counter,
            free_limit: cfg.free_limit,
            basic_limit: cfg.basic_limit,
            pro_limit: cfg.pro_limit,
            window: cfg.window,
        }
    }

    /// Admit `subject` under the Free tier.
    pub async fn allow(&self, subject: &str) -> Result<(bool, i64)> {
        self.allow_tier(subject, Tier::Free).await
    }

    /// Admit `subject` under `tier`. Returns `(allowed, count)` where
    /// `count` is the subject's position within the current window.
    pub async fn allow_tier(&self, subject: &str, tier: Tier) -> Result<(bool, i64)> {
        let limit = self.limit_for(tier);
        self.window_allow(subject, limit).await
    }

    async fn window_allow(&self, subject: &str, limit: i64) -> Result<(bool, i64)> {
        let window_secs = self.window.as_secs() as i64;
        let window_start = Utc::now().timestamp() / window_secs * window_secs;
        let key = format!("{}:sw:{}:{}", KEY_PREFIX, subject, window_start);

        let count = self
            .counter
            .incr_with_expiry(&key, self.window + WINDOW_SLACK)
            .await?;
        Ok((count <= limit, count))
    }

    /// WebSocket admission: the key holds the current concurrent-session
    /// count, not a request count. Read-check-write, deliberately an
    /// approximation; the in-process connection tracker is the hard cap.
    pub async fn acquire_websocket(&self, subject: &str, limit: usize) -> Result<(bool, i64)> {
        let limit = if limit == 0 { 10 } else { limit } as i64;
        let key = format!("{}:ws:{}", KEY_PREFIX, subject);

        let count = self.counter.get(&key).await.unwrap_or(0);
        if count >= limit {
            return Ok((false, count));
        }

        let new_count = count + 1;
        if let Err(e) = self.counter.set(&key, new_count, self.window).await {
            warn!("failed to set websocket counter: {}", e);
        }
        Ok((new_count <= limit, new_count))
    }

    /// Release one WebSocket session slot; the key is deleted at zero.
    pub async fn release_websocket(&self, subject: &str) -> Result<()> {
        let key = format!("{}:ws:{}", KEY_PREFIX, subject);
        let count = match self.counter.get(&key).await {
            Ok(count) => count,
            Err(_) => return self.counter.del(&key).await,
        };

        if count <= 1 {
            return self.counter.del(&key).await;
        }
        self.counter.set(&key, count - 1, self.window).await
    }

    /// Current usage snapshot for a subject alongside the tier budgets.
    pub async fn usage(&self, subject: &str) -> HashMap<&'static str, i64> {
        let window_secs = self.window.as_secs() as i64;
        let window_start = Utc::now().timestamp() / window_secs * window_secs;
        let key = format!("{}:sw:{}:{}", KEY_PREFIX, subject, window_start);

        let current = self.counter.get(&key).await.unwrap_or(0);
        HashMap::from([
            ("current", current),
            ("free", self.free_limit),
            ("basic", self.basic_limit),
            ("pro", self.pro_limit),
        ])
    }

    pub fn limit_for(&self, tier: Tier) -> i64 {
        match tier {
            Tier::Free => self.free_limit,
            Tier::Basic => self.basic_limit,
            Tier::Pro => self.pro_limit,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Unix timestamp at which the current fixed window resets.
pub fn window_reset(window: Duration) -> i64 {
    let window_secs = window.as_secs() as i64;
    if window_secs <= 0 {
        return 0;
    }
    let now = Utc::now().timestamp();
    now / window_secs * window_secs + window_secs
}
