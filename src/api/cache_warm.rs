use std::sync::Arc;
use std::time::Duration;

use chrono::SecondsFormat;
use serde_json::json;
use tracing::{debug, warn};

use crate::api::handlers::{transform_record, ProxyListItem};
use crate::cache::{self, ResponseCache};
use crate::store::{ProxyListFilters, Store};

/// Whole-warm budget; whatever is not precomputed by then is left to
/// demand-fill.
const WARM_BUDGET: Duration = Duration::from_secs(30);

const WARM_RECENT_LIMIT: i64 = 10;
const WARM_COUNTRY_LIMIT: i64 = 20;
const WARM_PAGE_LIMIT: i64 = 25;

const STATS_TTL: Duration = Duration::from_secs(60);
const RECENT_TTL: Duration = Duration::from_secs(30);

/// Precomputes the hot responses after a sync: stats, the recent page and
/// the first page for the busiest countries. Every write targets the
/// current cache epoch, so readers that snapshot the same epoch hit them.
pub struct CacheWarmer {
    store: Arc<Store>,
    cache: ResponseCache,
    web_ttl: Duration,
    list_window_hours: i64,
}

impl CacheWarmer {
    pub fn new(
        store: Arc<Store>,
        cache: ResponseCache,
        web_ttl: Duration,
        list_window_hours: i64,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            cache,
            web_ttl,
            list_window_hours,
        })
    }

    pub async fn warm(&self) {
        if tokio::time::timeout(WARM_BUDGET, self.warm_inner())
            .await
            .is_err()
        {
            warn!("cache warm aborted after {:?} budget", WARM_BUDGET);
        }
    }

    async fn warm_inner(&self) {
        let version = self.cache.version().await;
        let last_sync = self
            .cache
            .last_sync()
            .await
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true));

        if let Ok(stats) = self.store.proxy_stats().await {
            let mut meta = json!({"cached": true, "cache_age": 0});
            if let Some(last_sync) = &last_sync {
                meta["last_sync"] = json!(last_sync);
            }
            let payload = json!({"data": stats, "meta": meta});
            self.cache
                .set(
                    &cache::stats_key(&version),
                    payload.to_string().as_bytes(),
                    STATS_TTL,
                )
                .await;
        }

        if let Ok(records) = self.store.list_recent_proxies(WARM_RECENT_LIMIT).await {
            let data: Vec<ProxyListItem> = records.iter().map(transform_record).collect();
            let mut meta = json!({"limit": WARM_RECENT_LIMIT, "cached": true, "cache_age": 0});
            if let Some(last_sync) = &last_sync {
                meta["last_sync"] = json!(last_sync);
            }
            let payload = json!({"data": data, "meta": meta});
            self.cache
                .set(
                    &cache::recent_key(WARM_RECENT_LIMIT, &version),
                    payload.to_string().as_bytes(),
                    RECENT_TTL,
                )
                .await;
        }

        if self.web_ttl.is_zero() {
            return;
        }
        let facets = match self
            .store
            .list_proxy_facets("country", WARM_COUNTRY_LIMIT, 0)
            .await
        {
            Ok(facets) => facets,
            Err(e) => {
                warn!("cache warm could not list country facets: {}", e);
                return;
            }
        };

        let mut warmed = 0;
        for facet in facets {
            let code = facet.key.trim().to_uppercase();
            if code.is_empty() {
                continue;
            }

            let mut filters = ProxyListFilters {
                country_code: code,
                limit: WARM_PAGE_LIMIT,
                offset: 0,
                ..Default::default()
            };
            if self.list_window_hours > 0 {
                filters.since =
                    Some(chrono::Utc::now() - chrono::Duration::hours(self.list_window_hours));
            }

            let Ok((records, total)) = self.store.list_proxy_list(filters.clone()).await else {
                continue;
            };
            let data: Vec<ProxyListItem> = records.iter().map(transform_record).collect();

            let mut meta = json!({
                "total": total,
                "limit": filters.limit,
                "offset": filters.offset,
                "cached": true,
                "cache_age": 0,
            });
            if let Some(last_sync) = &last_sync {
                meta["last_sync"] = json!(last_sync);
            }
            let payload = json!({"data": data, "meta": meta});
            self.cache
                .set(
                    &cache::list_key(&filters, false, &version),
                    payload.to_string().as_bytes(),
                    self.web_ttl,
                )
                .await;
            warmed += 1;
        }

        debug!("cache warm precomputed {} country pages", warmed);
    }
}
