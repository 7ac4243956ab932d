use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use chrono::{Duration as ChronoDuration, Utc};
use futures::StreamExt;
use tracing::{info, warn};

use crate::api::cache_warm::CacheWarmer;
use crate::cache::ResponseCache;
use crate::geoip::GeoReader;
use crate::metrics::ServiceMetrics;
use crate::store::{ProxyListRecord, Store};

/// Hard cap on one sync tick; an overrun is abandoned and the next tick
/// starts fresh.
const SYNC_DEADLINE: Duration = Duration::from_secs(5 * 60);

const BATCH_SIZE: usize = 5000;

const SERVICE_USER_AGENT: &str = "proxydex/1.0";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source_url: String,
    pub interval: Duration,
    pub request_timeout: Duration,
    pub retention_hours: i64,
}

/// Periodic catalog sync: fetch the feed, parse and enrich it in batches,
/// upsert, rebuild facets, drop stale rows, then flip the cache epoch.
/// Batches commit independently so the store is never held in one long
/// write transaction.
pub struct Syncer {
    cfg: SyncConfig,
    store: Arc<Store>,
    cache: Option<ResponseCache>,
    geo: Option<Arc<GeoReader>>,
    warmer: Option<Arc<CacheWarmer>>,
    metrics: Arc<ServiceMetrics>,
    client: reqwest::Client,
}

impl Syncer {
    pub fn new(
        mut cfg: SyncConfig,
        store: Arc<Store>,
        cache: Option<ResponseCache>,
        geo: Option<Arc<GeoReader>>,
        warmer: Option<Arc<CacheWarmer>>,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        if cfg.interval.is_zero() {
            cfg.interval = Duration::from_secs(300);
        }
        if cfg.request_timeout.is_zero() {
            cfg.request_timeout = Duration::from_secs(30);
        }
        let client = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .unwrap_or_default();

        Self {
            cfg,
            store,
            cache,
            geo,
            warmer,
            metrics,
            client,
        }
    }

    /// Ticker loop. The first sync runs immediately; a failed tick's retry
    /// is simply the next tick.
    pub async fn run(self: Arc<Self>) {
        if self.cfg.source_url.is_empty() {
            info!("proxy source url not configured, sync disabled");
            return;
        }

        let mut ticker = tokio::time::interval(self.cfg.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match tokio::time::timeout(SYNC_DEADLINE, self.sync_once()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    ServiceMetrics::incr(&self.metrics.sync_failures_total);
                    warn!("sync failed: {:#}", e);
                }
                Err(_) => {
                    ServiceMetrics::incr(&self.metrics.sync_failures_total);
                    warn!("sync aborted after {:?} deadline", SYNC_DEADLINE);
                }
            }
        }
    }

    /// One full sync pass; also what each tick runs.
    pub async fn sync_once(&self) -> anyhow::Result<()> {
        let start = Instant::now();

        let resp = self
            .client
            .get(&self.cfg.source_url)
            .header(reqwest::header::USER_AGENT, SERVICE_USER_AGENT)
            .send()
            .await
            .context("fetch feed")?;
        if !resp.status().is_success() {
            bail!("fetch feed: status {}", resp.status());
        }

        let mut parser = crate::feed::FeedParser::new(BATCH_SIZE);
        let mut stream = resp.bytes_stream();
        let mut updated = 0usize;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("read feed body")?;
            for batch in parser.push(&chunk) {
                updated += self.apply_batch(batch).await?;
            }
        }
        let (tail, processed) = parser.finish();
        for batch in tail {
            updated += self.apply_batch(batch).await?;
        }

        self.store
            .rebuild_proxy_facets()
            .await
            .context("rebuild facets")?;

        if self.cfg.retention_hours > 0 {
            let cutoff = Utc::now() - ChronoDuration::hours(self.cfg.retention_hours);
            match self.store.delete_stale_proxies(cutoff).await {
                Ok(removed) if removed > 0 => {
                    info!("retention removed {} proxies unseen since {}", removed, cutoff)
                }
                Ok(_) => {}
                Err(e) => warn!("retention sweep failed: {}", e),
            }
        }

        // The epoch bump happens after all batch commits and the facet
        // rebuild; readers snapshotting the new epoch see only new data.
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.bump_version().await {
                warn!("cache epoch bump failed: {}", e);
            }
            if let Err(e) = cache.set_last_sync(Utc::now()).await {
                warn!("last_sync update failed: {}", e);
            }
        }

        if let Some(warmer) = &self.warmer {
            let warmer = Arc::clone(warmer);
            tokio::spawn(async move {
                warmer.warm().await;
            });
        }

        ServiceMetrics::incr(&self.metrics.sync_runs_total);
        ServiceMetrics::add(&self.metrics.sync_records_total, updated as u64);
        info!(
            "synced {}/{} records in {:?}",
            updated,
            processed,
            start.elapsed()
        );
        Ok(())
    }

    async fn apply_batch(&self, mut batch: Vec<ProxyListRecord>) -> anyhow::Result<usize> {
        self.enrich(&mut batch);
        let count = self
            .store
            .upsert_proxy_list_batch(batch)
            .await
            .context("upsert batch")?;
        Ok(count)
    }

    /// Fill geo/ASN gaps; a field already present in the feed wins.
    fn enrich(&self, records: &mut [ProxyListRecord]) {
        let Some(geo) = &self.geo else {
            return;
        };

        for record in records.iter_mut() {
            if record.ip.is_empty() {
                continue;
            }

            if record.country_code.is_empty()
                || record.country_name.is_empty()
                || record.city.is_empty()
                || record.region.is_empty()
                || record.continent_code.is_empty()
            {
                let city = geo.lookup_city(&record.ip);
                if record.country_code.is_empty() {
                    record.country_code = city.country_code;
                }
                if record.country_name.is_empty() {
                    record.country_name = city.country_name;
                }
                if record.city.is_empty() {
                    record.city = city.city;
                }
                if record.region.is_empty() {
                    record.region = city.region;
                }
                if record.continent_code.is_empty() {
                    record.continent_code = city.continent_code;
                }
            }

            if record.asn == 0 || record.asn_name.is_empty() || record.org.is_empty() {
                let asn = geo.lookup_asn(&record.ip);
                if record.asn == 0 {
                    record.asn = asn.number;
                }
                if record.asn_name.is_empty() {
                    record.asn_name = asn.name;
                }
                if record.org.is_empty() {
                    record.org = asn.organization;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_syncer(source_url: &str) -> Syncer {
        Syncer::new(
            SyncConfig {
                source_url: source_url.to_string(),
                interval: Duration::from_secs(300),
                request_timeout: Duration::from_secs(5),
                retention_hours: 48,
            },
            Arc::new(Store::open_in_memory().unwrap()),
            None,
            None,
            None,
            Arc::new(ServiceMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_apply_batch_without_geo_keeps_fields() {
        let syncer = test_syncer("");
        let record = ProxyListRecord {
            host: "198.51.100.1".to_string(),
            ip: "198.51.100.1".to_string(),
            port: 1080,
            country_code: "US".to_string(),
            ..Default::default()
        };

        let count = syncer.apply_batch(vec![record]).await.unwrap();
        assert_eq!(count, 1);

        let (rows, total) = syncer
            .store
            .list_proxy_list(Default::default())
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].country_code, "US");
    }

    #[tokio::test]
    async fn test_sync_once_fails_on_unreachable_source() {
        // Reserved TEST-NET address: the fetch step must error, leaving the
        // store untouched.
        let syncer = test_syncer("http://192.0.2.1:9/feed.csv");
        assert!(syncer.sync_once().await.is_err());
        let (_, total) = syncer
            .store
            .list_proxy_list(Default::default())
            .await
            .unwrap();
        assert_eq!(total, 0);
    }
}
