use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Sweep cadence for the in-process counter.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

// Atomic INCR + first-increment EXPIRE in one round trip. Running this
// server-side means a concurrent window cannot race between the increment
// and the expiry and leak an immortal key.
const INCR_WITH_EXPIRY_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return current
"#;

/// Increment-with-TTL counter used by the rate limiter and the WebSocket
/// session accounting. Two forms: a shared Redis counter for multi-process
/// deployments, and an in-process fallback map.
pub enum Counter {
    Redis(RedisCounter),
    Memory(MemoryCounter),
}

impl Counter {
    /// Build the shared counter when a Redis connection is available,
    /// otherwise degrade to the in-process map rather than failing closed.
    pub fn from_redis(conn: Option<ConnectionManager>) -> Counter {
        match conn {
            Some(conn) => Counter::Redis(RedisCounter::new(conn)),
            None => {
                info!("redis unavailable, using in-process rate counter");
                Counter::Memory(MemoryCounter::new())
            }
        }
    }

    pub async fn incr(&self, key: &str) -> Result<i64> {
        match self {
            Counter::Redis(c) => c.incr(key).await,
            Counter::Memory(c) => Ok(c.incr(key)),
        }
    }

    pub async fn get(&self, key: &str) -> Result<i64> {
        match self {
            Counter::Redis(c) => c.get(key).await,
            Counter::Memory(c) => Ok(c.get(key)),
        }
    }

    pub async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<()> {
        match self {
            Counter::Redis(c) => c.set(key, value, ttl).await,
            Counter::Memory(c) => {
                c.set(key, value, ttl);
                Ok(())
            }
        }
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        match self {
            Counter::Redis(c) => c.expire(key, ttl).await,
            Counter::Memory(c) => {
                c.expire(key, ttl);
                Ok(())
            }
        }
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        match self {
            Counter::Redis(c) => c.del(key).await,
            Counter::Memory(c) => {
                c.del(key);
                Ok(())
            }
        }
    }

    /// Increment and, on the first increment of the key, arm its TTL.
    /// Subsequent increments never reset the TTL.
    pub async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64> {
        match self {
            Counter::Redis(c) => c.incr_with_expiry(key, ttl).await,
            Counter::Memory(c) => Ok(c.incr_with_expiry(key, ttl)),
        }
    }

    pub fn close(&self) {
        if let Counter::Memory(c) = self {
            c.close();
        }
    }
}

pub struct RedisCounter {
    conn: ConnectionManager,
    incr_script: redis::Script,
}

impl RedisCounter {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            incr_script: redis::Script::new(INCR_WITH_EXPIRY_SCRIPT),
        }
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        conn.incr(key, 1).await.context("redis INCR")
    }

    async fn get(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = conn.get(key).await.context("redis GET")?;
        Ok(value.unwrap_or(0))
    }

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex(key, value, ttl.as_secs())
            .await
            .context("redis SETEX")
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.expire(key, ttl.as_secs() as i64)
            .await
            .context("redis EXPIRE")
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del(key).await.context("redis DEL")
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut conn = self.conn.clone();
        self.incr_script
            .key(key)
            .arg(ttl.as_secs())
            .invoke_async(&mut conn)
            .await
            .context("redis INCR with expiry script")
    }
}

struct MemoryEntry {
    value: i64,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if now > deadline)
    }
}

/// In-process counter: a synchronized map with per-key deadlines and a
/// background sweeper that drops expired keys.
pub struct MemoryCounter {
    state: Arc<Mutex<HashMap<String, MemoryEntry>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryCounter {
    pub fn new() -> Self {
        let state: Arc<Mutex<HashMap<String, MemoryEntry>>> = Arc::new(Mutex::new(HashMap::new()));

        let sweep_state = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let now = Instant::now();
                match sweep_state.lock() {
                    Ok(mut map) => {
                        let before = map.len();
                        map.retain(|_, entry| !entry.expired(now));
                        let removed = before - map.len();
                        if removed > 0 {
                            debug!("rate counter sweep removed {} expired keys", removed);
                        }
                    }
                    Err(e) => warn!("rate counter sweep skipped: {}", e),
                }
            }
        });

        Self {
            state,
            sweeper: Mutex::new(Some(handle)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemoryEntry>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn incr(&self, key: &str) -> i64 {
        let mut map = self.lock();
        let now = Instant::now();
        if map.get(key).is_some_and(|entry| entry.expired(now)) {
            map.remove(key);
        }
        let entry = map.entry(key.to_string()).or_insert(MemoryEntry {
            value: 0,
            expires_at: None,
        });
        entry.value += 1;
        entry.value
    }

    fn get(&self, key: &str) -> i64 {
        let mut map = self.lock();
        let now = Instant::now();
        if map.get(key).is_some_and(|entry| entry.expired(now)) {
            map.remove(key);
            return 0;
        }
        map.get(key).map(|entry| entry.value).unwrap_or(0)
    }

    fn set(&self, key: &str, value: i64, ttl: Duration) {
        let mut map = self.lock();
        map.insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
    }

    fn expire(&self, key: &str, ttl: Duration) {
        let mut map = self.lock();
        if ttl.is_zero() {
            map.remove(key);
            return;
        }
        if let Some(entry) = map.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
    }

    fn del(&self, key: &str) {
        self.lock().remove(key);
    }

    fn incr_with_expiry(&self, key: &str, ttl: Duration) -> i64 {
        let mut map = self.lock();
        let now = Instant::now();
        if map.get(key).is_some_and(|entry| entry.expired(now)) {
            map.remove(key);
        }
        let entry = map.entry(key.to_string()).or_insert(MemoryEntry {
            value: 0,
            expires_at: None,
        });
        entry.value += 1;
        if entry.value == 1 {
            entry.expires_at = Some(now + ttl);
        }
        entry.value
    }

    /// Stop the background sweeper.
    pub fn close(&self) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = sweeper.take() {
            handle.abort();
        }
    }
}

impl Default for MemoryCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryCounter {
    fn drop(&mut self) {
        self.close();
    }
}
