use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_TYPE, LOCATION};
use hyper::{Body, Response, StatusCode};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::api::respond::{json_response, raw_json_response};
use crate::api::validators::{
    parse_asn, parse_bool, parse_limit, parse_offset, parse_port, sanitize_anonymity,
    sanitize_country, sanitize_label, sanitize_protocol,
};
use crate::api::{AppContext, RequestContext};
use crate::error::ApiError;
use crate::metrics::ServiceMetrics;
use crate::store::{ProxyListFilters, Store};

use super::handlers::{transform_record, ProxyListItem};

const EXPORT_DEFAULT_LIMIT: i64 = 5000;
const EXPORT_MAX_TOTAL: i64 = 100_000;
const EXPORT_DEFAULT_PAGE_SIZE: i64 = 5000;
const EXPORT_MAX_PAGE_SIZE: i64 = 5000;

/// Hard cap on one export job's runtime.
const JOB_TIMEOUT: Duration = Duration::from_secs(15 * 60);

const CSV_HEADER: [&str; 14] = [
    "ip",
    "port",
    "country_code",
    "country_name",
    "city",
    "region",
    "asn",
    "asn_name",
    "org",
    "protocols",
    "anonymity",
    "uptime",
    "delay_ms",
    "last_seen",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportJobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Expired,
}

/// One asynchronous export job. The record itself is persisted (shared KV
/// when available, else in-process); the artifact lives on disk until
/// `expires_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportJob {
    pub id: String,
    pub status: ExportJobStatus,
    pub format: String,
    pub filters: ProxyListFilters,
    pub limit: i64,
    pub offset: i64,
    pub page_size: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub processed: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub size_bytes: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub file_path: PathBuf,
}

fn is_zero_i64(value: &i64) -> bool {
    *value == 0
}

pub struct ExportManager {
    store: Arc<Store>,
    redis: Option<ConnectionManager>,
    dir: PathBuf,
    ttl: Duration,
    jobs: Mutex<HashMap<String, ExportJob>>,
    metrics: Arc<crate::metrics::ServiceMetrics>,
}

impl ExportManager {
    pub fn new(
        store: Arc<Store>,
        redis: Option<ConnectionManager>,
        dir: PathBuf,
        ttl: Duration,
        metrics: Arc<crate::metrics::ServiceMetrics>,
    ) -> Arc<Self> {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("failed to create export dir {:?}: {}", dir, e);
        }
        Arc::new(Self {
            store,
            redis,
            dir,
            ttl,
            jobs: Mutex::new(HashMap::new()),
            metrics,
        })
    }

    pub async fn create_job(
        self: &Arc<Self>,
        format: &str,
        mut filters: ProxyListFilters,
        limit: i64,
        offset: i64,
        page_size: i64,
    ) -> Result<ExportJob, ApiError> {
        let format = normalize_format(format);
        if !is_export_format_supported(&format) {
            return Err(ApiError::ExportJob(format!(
                "unsupported export format: {}",
                format
            )));
        }

        let limit = if limit <= 0 {
            EXPORT_DEFAULT_LIMIT
        } else {
            limit.min(EXPORT_MAX_TOTAL)
        };
        let page_size = if page_size <= 0 {
            EXPORT_DEFAULT_PAGE_SIZE
        } else {
            page_size.min(EXPORT_MAX_PAGE_SIZE)
        };
        if filters.limit <= 0 {
            filters.limit = page_size;
        }
        filters.offset = offset;

        let id = uuid::Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        let job = ExportJob {
            file_path: self.dir.join(format!("proxy-export-{}.{}", id, format)),
            id,
            status: ExportJobStatus::Queued,
            format,
            filters,
            limit,
            offset,
            page_size,
            created_at: now,
            updated_at: now,
            expires_at: now + chrono::Duration::from_std(self.ttl).unwrap_or_default(),
            processed: 0,
            size_bytes: 0,
            error: None,
        };

        self.save_job(&job).await;
        ServiceMetrics::incr(&self.metrics.export_jobs_total);

        let manager = Arc::clone(self);
        let spawned = job.clone();
        tokio::spawn(async move {
            manager.run_job(spawned).await;
        });

        Ok(job)
    }

    /// Fetch a job; an expired job is cleaned up inline and reported as
    /// missing.
    pub async fn get_job(&self, id: &str) -> Result<ExportJob, ApiError> {
        if id.is_empty() {
            return Err(ApiError::ExportJobNotFound);
        }

        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            let raw: Option<String> = conn.get(job_key(id)).await.unwrap_or(None);
            let Some(raw) = raw else {
                return Err(ApiError::ExportJobNotFound);
            };
            let mut job: ExportJob =
                serde_json::from_str(&raw).map_err(|_| ApiError::ExportJobNotFound)?;
            if job.file_path.as_os_str().is_empty() {
                job.file_path = self
                    .dir
                    .join(format!("proxy-export-{}.{}", job.id, job.format));
            }
            if job.expires_at < Utc::now() {
                let _: Result<(), _> = conn.del(job_key(id)).await;
                cleanup_export_file(&job.file_path).await;
                return Err(ApiError::ExportJobNotFound);
            }
            return Ok(job);
        }

        let job = {
            let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            jobs.get(id).cloned()
        };
        let Some(job) = job else {
            return Err(ApiError::ExportJobNotFound);
        };
        if job.expires_at < Utc::now() {
            self.delete_job(id).await;
            cleanup_export_file(&job.file_path).await;
            return Err(ApiError::ExportJobNotFound);
        }
        Ok(job)
    }

    async fn run_job(self: Arc<Self>, mut job: ExportJob) {
        job.status = ExportJobStatus::Running;
        job.updated_at = Utc::now();
        self.save_job(&job).await;

        let produced = tokio::time::timeout(JOB_TIMEOUT, self.produce(&job)).await;
        let result = match produced {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("export timed out after {:?}", JOB_TIMEOUT)),
        };

        match result {
            Ok((processed, size_bytes)) => {
                job.processed = processed;
                job.size_bytes = size_bytes;
                job.status = ExportJobStatus::Completed;
                job.updated_at = Utc::now();
                self.save_job(&job).await;
                info!(
                    "export job {} completed: {} rows, {} bytes",
                    job.id, processed, size_bytes
                );
            }
            Err(e) => {
                ServiceMetrics::incr(&self.metrics.export_jobs_failed);
                warn!("export job {} failed: {:#}", job.id, e);
                cleanup_export_file(&job.file_path).await;
                job.status = ExportJobStatus::Failed;
                job.error = Some(e.to_string());
                job.updated_at = Utc::now();
                self.save_job(&job).await;
            }
        }

        self.schedule_cleanup(&job);
    }

    async fn produce(&self, job: &ExportJob) -> anyhow::Result<(i64, i64)> {
        let file = tokio::fs::File::create(&job.file_path).await?;
        let mut writer = tokio::io::BufWriter::new(file);

        let processed = export_proxy_list(
            &mut writer,
            &self.store,
            &job.format,
            job.filters.clone(),
            job.limit,
            job.page_size,
        )
        .await?;
        writer.flush().await?;
        writer.into_inner().sync_all().await?;

        let size = tokio::fs::metadata(&job.file_path).await?.len() as i64;
        Ok((processed, size))
    }

    async fn save_job(&self, job: &ExportJob) {
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            if let Ok(payload) = serde_json::to_string(job) {
                let result: Result<(), _> = conn
                    .set_ex(job_key(&job.id), payload, self.ttl.as_secs())
                    .await;
                if let Err(e) = result {
                    warn!("failed to persist export job {}: {}", job.id, e);
                }
            }
            return;
        }
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.insert(job.id.clone(), job.clone());
    }

    async fn delete_job(&self, id: &str) {
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            let _: Result<(), _> = conn.del(job_key(id)).await;
            return;
        }
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.remove(id);
    }

    /// Remove the artifact and the record when the job's TTL lapses.
    fn schedule_cleanup(self: &Arc<Self>, job: &ExportJob) {
        let manager = Arc::clone(self);
        let id = job.id.clone();
        let file_path = job.file_path.clone();
        let delay = (job.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::from_secs(3600));

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            cleanup_export_file(&file_path).await;
            manager.delete_job(&id).await;
        });
    }
}

fn job_key(id: &str) -> String {
    format!("proxylist:export:job:{}", id)
}

async fn cleanup_export_file(path: &PathBuf) {
    if path.as_os_str().is_empty() {
        return;
    }
    let _ = tokio::fs::remove_file(path).await;
}

pub fn is_export_format_supported(format: &str) -> bool {
    matches!(
        format,
        "txt" | "text" | "list" | "csv" | "json" | "clash" | "surfshark"
    )
}

fn normalize_format(format: &str) -> String {
    format.trim_start_matches('.').trim().to_lowercase()
}

/// Pull pages from the store and serialize them into `writer` until the
/// requested total is reached or the store runs short. Flushes at page
/// boundaries so downloads stream steadily.
pub async fn export_proxy_list<W>(
    writer: &mut W,
    store: &Store,
    format: &str,
    mut filters: ProxyListFilters,
    total_limit: i64,
    page_size: i64,
) -> anyhow::Result<i64>
where
    W: AsyncWrite + Unpin,
{
    if total_limit <= 0 {
        return Ok(0);
    }
    let format = normalize_format(format);
    if !is_export_format_supported(&format) {
        anyhow::bail!("unsupported export format: {}", format);
    }
    let page_size = if page_size <= 0 {
        EXPORT_DEFAULT_PAGE_SIZE
    } else {
        page_size
    };

    match format.as_str() {
        "csv" => {
            writer.write_all(csv_row(&CSV_HEADER).as_bytes()).await?;
        }
        "json" => writer.write_all(b"{\"data\":[").await?,
        "clash" => writer.write_all(b"proxies:\n").await?,
        _ => {}
    }

    let mut processed: i64 = 0;
    let mut remaining = total_limit;
    let mut offset = filters.offset;
    let mut index: i64 = 0;
    let mut first_json = true;

    while remaining > 0 {
        let batch_limit = remaining.min(page_size);
        filters.limit = batch_limit;
        filters.offset = offset;

        let (records, _) = store.list_proxy_list(filters.clone()).await?;
        if records.is_empty() {
            break;
        }
        let fetched = records.len() as i64;

        for record in &records {
            let item = transform_record(record);
            match format.as_str() {
                "txt" | "text" | "list" => {
                    writer
                        .write_all(format!("{}:{}\n", item.ip, item.port).as_bytes())
                        .await?;
                }
                "csv" => {
                    writer.write_all(csv_item_row(&item).as_bytes()).await?;
                }
                "json" => {
                    if !first_json {
                        writer.write_all(b",").await?;
                    }
                    first_json = false;
                    writer.write_all(serde_json::to_vec(&item)?.as_slice()).await?;
                }
                "clash" => {
                    let (proxy_type, tls) = preferred_proxy_type(&item);
                    let name = format!("proxy-{}-{}", index + 1, item.ip);
                    writer
                        .write_all(format!("  - name: \"{}\"\n", name).as_bytes())
                        .await?;
                    writer
                        .write_all(format!("    type: {}\n", proxy_type).as_bytes())
                        .await?;
                    writer
                        .write_all(format!("    server: {}\n", item.ip).as_bytes())
                        .await?;
                    writer
                        .write_all(format!("    port: {}\n", item.port).as_bytes())
                        .await?;
                    if tls {
                        writer.write_all(b"    tls: true\n").await?;
                    }
                }
                "surfshark" => {
                    let scheme = preferred_proxy_scheme(&item);
                    writer
                        .write_all(format!("{}://{}:{}\n", scheme, item.ip, item.port).as_bytes())
                        .await?;
                }
                _ => {}
            }
            processed += 1;
            index += 1;
        }

        writer.flush().await?;

        offset += fetched;
        remaining -= fetched;
        if fetched < batch_limit {
            break;
        }
    }

    if format == "json" {
        writer.write_all(b"]}").await?;
    }
    writer.flush().await?;

    Ok(processed)
}

fn csv_item_row(item: &ProxyListItem) -> String {
    let asn = if item.asn == 0 {
        String::new()
    } else {
        item.asn.to_string()
    };
    csv_row(&[
        &item.ip,
        &item.port.to_string(),
        &item.country_code,
        &item.country_name,
        &item.city,
        &item.region,
        &asn,
        &item.asn_name,
        &item.org,
        &item.protocols.join("|"),
        &item.anonymity_level,
        &item.uptime.to_string(),
        &item.delay.to_string(),
        &item.last_seen,
    ])
}

fn csv_row(fields: &[&str]) -> String {
    let mut row = String::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            row.push(',');
        }
        row.push_str(&csv_escape(field));
    }
    row.push('\n');
    row
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Preferred single protocol for formats that can only carry one.
fn preferred_proxy_type(item: &ProxyListItem) -> (&'static str, bool) {
    if item.socks5 == 1 {
        ("socks5", false)
    } else if item.socks4 == 1 {
        ("socks4", false)
    } else if item.ssl == 1 {
        ("http", true)
    } else {
        ("http", false)
    }
}

fn preferred_proxy_scheme(item: &ProxyListItem) -> &'static str {
    if item.socks5 == 1 {
        "socks5"
    } else if item.socks4 == 1 {
        "socks4"
    } else if item.ssl == 1 {
        "https"
    } else {
        "http"
    }
}

struct ExportOptions {
    format: String,
    filters: ProxyListFilters,
    total_limit: i64,
    page_size: i64,
    offset: i64,
    stream: bool,
    async_job: bool,
}

fn parse_export_options(rc: &RequestContext, format: &str) -> ExportOptions {
    let q = |name: &str| rc.query.get(name).map(String::as_str).unwrap_or("");

    let page_size = parse_limit(q("page_size"), EXPORT_DEFAULT_PAGE_SIZE, EXPORT_MAX_PAGE_SIZE);
    let total_limit = parse_limit(q("limit"), EXPORT_DEFAULT_LIMIT, EXPORT_MAX_TOTAL);
    let mut offset = parse_offset(q("offset"));
    let page = parse_limit(q("page"), 0, 1_000_000);
    if page > 1 {
        offset = (page - 1) * page_size;
    }

    ExportOptions {
        format: format.to_string(),
        filters: ProxyListFilters {
            country_code: sanitize_country(q("country")),
            protocol: sanitize_protocol(q("protocol")),
            port: parse_port(q("port")),
            anonymity: sanitize_anonymity(q("anonymity")),
            city: sanitize_label(q("city")),
            region: sanitize_label(q("region")),
            asn: parse_asn(q("asn")),
            limit: page_size,
            offset,
            since: None,
        },
        total_limit,
        page_size,
        offset,
        stream: parse_bool(q("stream")),
        async_job: parse_bool(q("async")),
    }
}

fn export_filename(format: &str, protocol: &str) -> String {
    let date = Utc::now().format("%Y-%m-%d");
    if protocol.is_empty() {
        format!("proxy-export-{}.{}", date, format)
    } else {
        format!("proxy-export-{}-{}.{}", protocol, date, format)
    }
}

fn export_content_type(format: &str) -> &'static str {
    match format {
        "csv" => "text/csv; charset=utf-8",
        "json" => "application/json; charset=utf-8",
        "clash" => "text/yaml; charset=utf-8",
        _ => "text/plain; charset=utf-8",
    }
}

fn set_export_headers(headers: &mut hyper::HeaderMap, format: &str, filename: &str) {
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(export_content_type(format)),
    );
    if let Ok(value) =
        HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename))
    {
        headers.insert(CONTENT_DISPOSITION, value);
    }
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
}

fn job_links(job: &ExportJob) -> (String, String) {
    let status = format!("/api/proxies/export/jobs/{}", job.id);
    let download = format!("{}/download", status);
    (status, download)
}

fn job_accepted_response(job: &ExportJob) -> Response<Body> {
    let (status_url, download_url) = job_links(job);
    let payload = json!({
        "data": job,
        "links": {"status": status_url.clone(), "download": download_url},
    });
    let mut resp = json_response(StatusCode::ACCEPTED, &payload);
    if let Ok(value) = HeaderValue::from_str(&status_url) {
        resp.headers_mut().insert(LOCATION, value);
    }
    resp
}

/// GET /api/proxies/export/:format — synchronous, streaming, or handed off
/// to the job manager with `async=1`.
pub async fn export_sync(
    ctx: &AppContext,
    rc: &RequestContext,
    format_param: &str,
) -> Result<Response<Body>, ApiError> {
    let format = normalize_format(format_param);
    if !is_export_format_supported(&format) {
        return Err(ApiError::InvalidExportFormat);
    }

    let opts = parse_export_options(rc, &format);

    if opts.async_job {
        let job = ctx
            .exports
            .create_job(
                &opts.format,
                opts.filters,
                opts.total_limit,
                opts.offset,
                opts.page_size,
            )
            .await?;
        return Ok(job_accepted_response(&job));
    }

    let filename = export_filename(&format, &opts.filters.protocol);

    if opts.stream || opts.total_limit > opts.page_size {
        let (mut writer, reader) = tokio::io::duplex(16 * 1024);
        let store = Arc::clone(&ctx.store);
        let stream_format = opts.format.clone();
        let filters = opts.filters.clone();
        let (total_limit, page_size) = (opts.total_limit, opts.page_size);
        tokio::spawn(async move {
            if let Err(e) = export_proxy_list(
                &mut writer,
                &store,
                &stream_format,
                filters,
                total_limit,
                page_size,
            )
            .await
            {
                warn!("streaming export failed: {:#}", e);
            }
            let _ = writer.shutdown().await;
        });

        let mut resp = Response::builder()
            .status(StatusCode::OK)
            .body(Body::wrap_stream(ReaderStream::new(reader)))
            .unwrap_or_default();
        set_export_headers(resp.headers_mut(), &format, &filename);
        return Ok(resp);
    }

    let mut buf: Vec<u8> = Vec::new();
    export_proxy_list(
        &mut buf,
        &ctx.store,
        &opts.format,
        opts.filters,
        opts.total_limit,
        opts.page_size,
    )
    .await
    .map_err(|e| {
        warn!("export failed: {:#}", e);
        ApiError::Database("failed to export proxies".to_string())
    })?;

    let mut resp = raw_json_response(StatusCode::OK, buf);
    set_export_headers(resp.headers_mut(), &format, &filename);
    Ok(resp)
}

#[derive(Debug, Default, Deserialize)]
struct CreateJobRequest {
    #[serde(default)]
    format: String,
    #[serde(default)]
    country: String,
    #[serde(default)]
    protocol: String,
    #[serde(default)]
    port: i64,
    #[serde(default)]
    anonymity: String,
    #[serde(default)]
    city: String,
    #[serde(default)]
    region: String,
    #[serde(default)]
    asn: i64,
    #[serde(default)]
    limit: i64,
    #[serde(default)]
    offset: i64,
    #[serde(default)]
    page_size: i64,
}

/// POST /api/proxies/export/jobs — body fields win, query params fill the
/// gaps.
pub async fn create_export_job(
    ctx: &AppContext,
    rc: &RequestContext,
    body: &[u8],
) -> Result<Response<Body>, ApiError> {
    let mut req: CreateJobRequest = if body.is_empty() {
        CreateJobRequest::default()
    } else {
        serde_json::from_slice(body).unwrap_or_default()
    };

    let q = |name: &str| rc.query.get(name).map(String::as_str).unwrap_or("");
    if req.format.is_empty() {
        req.format = q("format").to_string();
    }
    if req.country.is_empty() {
        req.country = q("country").to_string();
    }
    if req.protocol.is_empty() {
        req.protocol = q("protocol").to_string();
    }
    if req.port == 0 {
        req.port = parse_port(q("port"));
    }
    if req.anonymity.is_empty() {
        req.anonymity = q("anonymity").to_string();
    }
    if req.city.is_empty() {
        req.city = q("city").to_string();
    }
    if req.region.is_empty() {
        req.region = q("region").to_string();
    }
    if req.asn == 0 {
        req.asn = parse_asn(q("asn"));
    }
    if req.limit == 0 {
        req.limit = parse_limit(q("limit"), EXPORT_DEFAULT_LIMIT, EXPORT_MAX_TOTAL);
    }
    if req.page_size == 0 {
        req.page_size = parse_limit(q("page_size"), EXPORT_DEFAULT_PAGE_SIZE, EXPORT_MAX_PAGE_SIZE);
    }

    let filters = ProxyListFilters {
        country_code: sanitize_country(&req.country),
        protocol: sanitize_protocol(&req.protocol),
        port: req.port,
        anonymity: sanitize_anonymity(&req.anonymity),
        city: sanitize_label(&req.city),
        region: sanitize_label(&req.region),
        asn: req.asn,
        limit: req.page_size,
        offset: req.offset,
        since: None,
    };

    let job = ctx
        .exports
        .create_job(&req.format, filters, req.limit, req.offset, req.page_size)
        .await?;
    Ok(job_accepted_response(&job))
}

/// GET /api/proxies/export/jobs/:id
pub async fn get_export_job(
    ctx: &AppContext,
    _rc: &RequestContext,
    id: &str,
) -> Result<Response<Body>, ApiError> {
    let job = ctx.exports.get_job(id.trim()).await?;

    let mut payload = json!({"data": job});
    if job.status == ExportJobStatus::Completed {
        let (_, download_url) = job_links(&job);
        payload["links"] = json!({"download": download_url});
    }
    Ok(json_response(StatusCode::OK, &payload))
}

/// GET /api/proxies/export/jobs/:id/download
pub async fn download_export_job(
    ctx: &AppContext,
    _rc: &RequestContext,
    id: &str,
) -> Result<Response<Body>, ApiError> {
    let job = ctx.exports.get_job(id.trim()).await?;
    if job.status != ExportJobStatus::Completed {
        return Err(ApiError::ExportJobNotReady);
    }
    if job.file_path.as_os_str().is_empty() {
        return Err(ApiError::ExportJobNotFound);
    }

    let file = tokio::fs::File::open(&job.file_path)
        .await
        .map_err(|_| ApiError::ExportJobNotFound)?;

    let filename = job
        .file_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("proxy-export")
        .to_string();

    let mut resp = Response::builder()
        .status(StatusCode::OK)
        .body(Body::wrap_stream(ReaderStream::new(file)))
        .unwrap_or_default();
    set_export_headers(resp.headers_mut(), &job.format, &filename);
    resp.headers_mut().insert(
        CACHE_CONTROL,
        HeaderValue::from_static("private, max-age=60"),
    );
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ProxyListRecord;

    fn seed_record(ip: &str, socks5: i64, ssl: i64) -> ProxyListRecord {
        ProxyListRecord {
            host: ip.to_string(),
            ip: ip.to_string(),
            port: 1080,
            socks5,
            ssl,
            country_code: "US".to_string(),
            org: "Example, Inc".to_string(),
            last_seen: Some(Utc::now()),
            ..Default::default()
        }
    }

    async fn seeded_store(n: usize) -> Arc<Store> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let records: Vec<_> = (1..=n)
            .map(|i| seed_record(&format!("198.51.100.{}", i), 1, 0))
            .collect();
        store.upsert_proxy_list_batch(records).await.unwrap();
        store
    }

    #[test]
    fn test_format_support() {
        for format in ["txt", "text", "list", "csv", "json", "clash", "surfshark"] {
            assert!(is_export_format_supported(format));
        }
        assert!(!is_export_format_supported("xml"));
        assert!(!is_export_format_supported(""));
    }

    #[test]
    fn test_csv_escape() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[tokio::test]
    async fn test_export_txt() {
        let store = seeded_store(3).await;
        let mut buf: Vec<u8> = Vec::new();
        let processed = export_proxy_list(
            &mut buf,
            &store,
            "txt",
            ProxyListFilters::default(),
            100,
            50,
        )
        .await
        .unwrap();
        assert_eq!(processed, 3);

        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.lines().all(|line| line.ends_with(":1080")));
    }

    #[tokio::test]
    async fn test_export_csv_header_and_quoting() {
        let store = seeded_store(1).await;
        let mut buf: Vec<u8> = Vec::new();
        export_proxy_list(&mut buf, &store, "csv", ProxyListFilters::default(), 100, 50)
            .await
            .unwrap();

        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "ip,port,country_code,country_name,city,region,asn,asn_name,org,protocols,anonymity,uptime,delay_ms,last_seen"
        );
        // The org contains a comma and must be quoted.
        assert!(lines.next().unwrap().contains("\"Example, Inc\""));
    }

    #[tokio::test]
    async fn test_export_json_is_valid() {
        let store = seeded_store(2).await;
        let mut buf: Vec<u8> = Vec::new();
        export_proxy_list(&mut buf, &store, "json", ProxyListFilters::default(), 100, 1)
            .await
            .unwrap();

        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(value["data"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_export_clash_and_surfshark_protocol_mapping() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .upsert_proxy_list_batch(vec![
                seed_record("198.51.100.1", 1, 0),
                seed_record("198.51.100.2", 0, 1),
            ])
            .await
            .unwrap();

        let mut buf: Vec<u8> = Vec::new();
        export_proxy_list(&mut buf, &store, "clash", ProxyListFilters::default(), 100, 50)
            .await
            .unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("proxies:\n"));
        assert!(text.contains("type: socks5"));
        assert!(text.contains("tls: true"));

        let mut buf: Vec<u8> = Vec::new();
        export_proxy_list(
            &mut buf,
            &store,
            "surfshark",
            ProxyListFilters::default(),
            100,
            50,
        )
        .await
        .unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("socks5://198.51.100.1:1080"));
        assert!(text.contains("https://198.51.100.2:1080"));
    }

    #[tokio::test]
    async fn test_export_respects_total_limit() {
        let store = seeded_store(10).await;
        let mut buf: Vec<u8> = Vec::new();
        let processed = export_proxy_list(
            &mut buf,
            &store,
            "txt",
            ProxyListFilters::default(),
            4,
            2,
        )
        .await
        .unwrap();
        assert_eq!(processed, 4);
    }

    #[tokio::test]
    async fn test_export_zero_limit_is_empty() {
        let store = seeded_store(3).await;
        let mut buf: Vec<u8> = Vec::new();
        let processed =
            export_proxy_list(&mut buf, &store, "txt", ProxyListFilters::default(), 0, 50)
                .await
                .unwrap();
        assert_eq!(processed, 0);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_job_lifecycle_in_process() {
        let store = seeded_store(5).await;
        let dir = tempfile::tempdir().unwrap();
        let manager = ExportManager::new(
            Arc::clone(&store),
            None,
            dir.path().to_path_buf(),
            Duration::from_secs(3600),
            Arc::new(crate::metrics::ServiceMetrics::new()),
        );

        let job = manager
            .create_job("csv", ProxyListFilters::default(), 5, 0, 2)
            .await
            .unwrap();
        assert_eq!(job.id.len(), 32);
        assert_eq!(job.status, ExportJobStatus::Queued);

        // Poll until the background worker finishes.
        let mut finished = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let current = manager.get_job(&job.id).await.unwrap();
            if current.status == ExportJobStatus::Completed {
                finished = Some(current);
                break;
            }
        }
        let finished = finished.expect("job did not complete");
        assert_eq!(finished.processed, 5);
        assert!(finished.size_bytes > 0);

        let content = std::fs::read_to_string(&finished.file_path).unwrap();
        assert!(content.starts_with("ip,port,country_code"));
    }

    #[tokio::test]
    async fn test_job_unknown_format_rejected() {
        let store = seeded_store(1).await;
        let dir = tempfile::tempdir().unwrap();
        let manager = ExportManager::new(
            store,
            None,
            dir.path().to_path_buf(),
            Duration::from_secs(3600),
            Arc::new(crate::metrics::ServiceMetrics::new()),
        );
        let result = manager
            .create_job("xml", ProxyListFilters::default(), 5, 0, 2)
            .await;
        assert!(matches!(result, Err(ApiError::ExportJob(_))));
    }

    #[tokio::test]
    async fn test_expired_job_is_not_found() {
        let store = seeded_store(1).await;
        let dir = tempfile::tempdir().unwrap();
        let manager = ExportManager::new(
            store,
            None,
            dir.path().to_path_buf(),
            Duration::from_millis(10),
            Arc::new(crate::metrics::ServiceMetrics::new()),
        );

        let job = manager
            .create_job("txt", ProxyListFilters::default(), 1, 0, 1)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(
            manager.get_job(&job.id).await,
            Err(ApiError::ExportJobNotFound)
        ));
    }

    #[tokio::test]
    async fn test_missing_job_not_found() {
        let store = seeded_store(1).await;
        let dir = tempfile::tempdir().unwrap();
        let manager = ExportManager::new(
            store,
            None,
            dir.path().to_path_buf(),
            Duration::from_secs(3600),
            Arc::new(crate::metrics::ServiceMetrics::new()),
        );
        assert!(matches!(
            manager.get_job("deadbeef").await,
            Err(ApiError::ExportJobNotFound)
        ));
    }
}
