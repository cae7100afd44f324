use crate::cache::{CacheEngine, CacheOutcome, Tier};
use actix_web::{get, web, App, HttpResponse, HttpServer, Responder};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use tracing::{error, info};

/// Every `result` label value of `cache_total`.
const CACHE_RESULTS: [&str; 6] = ["hit", "miss", "ok", "too_old", "invalidate", "item_missing"];

pub struct AdminState {
    pub metrics: Arc<ProxyMetrics>,
    pub engine: Arc<CacheEngine>,
}

/// Prometheus registry shared by the listeners and the admin server.
/// Every metric name is `<prefix>pkgproxy_<name>`.
#[derive(Clone)]
pub struct ProxyMetrics {
    pub registry: Registry,
    /// All requests, whatever the method or outcome.
    pub requests_total: IntCounter,
    pub remote_ok_total: IntCounter,
    pub remote_errors_total: IntCounter,
    /// Requests rejected for using a method other than GET, HEAD or PATCH.
    pub http_nonget_requests_total: IntCounter,
    pub http_requests_total: IntCounter,
    pub https_requests_total: IntCounter,
    /// `hit`/`miss` from the presence check, then the freshness outcome.
    pub cache_total: IntCounterVec,
    /// Index/storage disagreements that survived the automatic re-fetch.
    pub cache_anomalies_total: IntCounter,
    pub host_requests_total: IntCounterVec,
    /// Size of bodies served from the cache, by tier.
    pub cache_read_bytes: HistogramVec,
}

impl ProxyMetrics {
    pub fn new(prefix: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let name = |n: &str| format!("{prefix}pkgproxy_{n}");

        let counter = |n: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let c = IntCounter::new(name(n), help)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let requests_total = counter("requests_total", "Total requests received")?;
        let remote_ok_total = counter("remote_ok_total", "Successful upstream fetches")?;
        let remote_errors_total = counter("remote_errors_total", "Failed upstream fetches")?;
        let http_nonget_requests_total = counter(
            "http_nonget_requests_total",
            "Requests rejected for their method",
        )?;
        let http_requests_total = counter("http_requests_total", "Requests on the HTTP listener")?;
        let https_requests_total =
            counter("https_requests_total", "Requests on the HTTPS listener")?;
        let cache_anomalies_total = counter(
            "cache_anomalies_total",
            "Cache entries whose stored content could not be read or rebuilt",
        )?;

        let cache_total = IntCounterVec::new(
            Opts::new(name("cache_total"), "Cache lookups by result"),
            &["result"],
        )?;
        let host_requests_total = IntCounterVec::new(
            Opts::new(name("host_requests_total"), "Requests per upstream host"),
            &["host"],
        )?;
        let cache_read_bytes = HistogramVec::new(
            HistogramOpts::new(name("cache_read_bytes"), "Bytes served from the cache")
                .buckets(prometheus::exponential_buckets(1024.0, 4.0, 10)?),
            &["tier"],
        )?;
        registry.register(Box::new(cache_total.clone()))?;
        registry.register(Box::new(host_requests_total.clone()))?;
        registry.register(Box::new(cache_read_bytes.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            remote_ok_total,
            remote_errors_total,
            http_nonget_requests_total,
            http_requests_total,
            https_requests_total,
            cache_total,
            cache_anomalies_total,
            host_requests_total,
            cache_read_bytes,
        })
    }

    pub fn record_presence(&self, existed: bool) {
        let label = if existed { "hit" } else { "miss" };
        self.cache_total.with_label_values(&[label]).inc();
    }

    /// A `Miss` was already counted by [`record_presence`](Self::record_presence).
    pub fn record_outcome(&self, outcome: CacheOutcome) {
        if outcome != CacheOutcome::Miss {
            self.cache_total.with_label_values(&[outcome.as_str()]).inc();
        }
    }

    /// A request failed because the index and the tier disagreed even after
    /// the re-fetch. Counted as `item_missing` too, like a recovered one.
    pub fn record_anomaly(&self) {
        self.cache_total.with_label_values(&["item_missing"]).inc();
        self.cache_anomalies_total.inc();
    }

    pub fn record_read(&self, tier: Tier, bytes: u64) {
        self.cache_read_bytes
            .with_label_values(&[tier.as_str()])
            .observe(bytes as f64);
    }

    /// Encodes all registered metrics into Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            error!(error = %e, "failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().body("OK")
}

#[get("/metrics")]
async fn metrics_endpoint(state: web::Data<AdminState>) -> impl Responder {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4; charset=utf-8")
        .body(state.metrics.encode())
}

#[get("/api/stats")]
async fn api_stats(state: web::Data<AdminState>) -> impl Responder {
    let m = &state.metrics;
    let stats = state.engine.stats();

    let mut results = serde_json::Map::new();
    for label in CACHE_RESULTS {
        let count = m.cache_total.with_label_values(&[label]).get();
        results.insert(label.to_string(), serde_json::json!(count));
    }

    HttpResponse::Ok().json(serde_json::json!({
        "cache": {
            "entries": stats.entries,
            "memory_bytes": stats.memory_bytes,
            "file_bytes": stats.file_bytes,
            "results": results,
        },
        "requests_total": m.requests_total.get(),
        "http_requests_total": m.http_requests_total.get(),
        "https_requests_total": m.https_requests_total.get(),
        "http_nonget_requests_total": m.http_nonget_requests_total.get(),
        "remote_ok_total": m.remote_ok_total.get(),
        "remote_errors_total": m.remote_errors_total.get(),
        "cache_anomalies_total": m.cache_anomalies_total.get(),
    }))
}

pub async fn start_admin_server(bind_addr: String, state: AdminState) {
    let admin_state = web::Data::new(state);

    let server = match HttpServer::new(move || {
        App::new()
            .app_data(admin_state.clone())
            .service(health)
            .service(metrics_endpoint)
            .service(api_stats)
    })
    .workers(1)
    .disable_signals()
    .bind(&bind_addr)
    {
        Ok(server) => server.run(),
        Err(e) => {
            error!(bind = %bind_addr, error = %e, "cannot bind metrics listener");
            return;
        }
    };

    info!("metrics listening on http://{}", bind_addr);
    if let Err(e) = server.await {
        error!(error = %e, "admin server error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_carry_prefix() {
        let m = ProxyMetrics::new("corp_").unwrap();
        m.requests_total.inc();
        m.record_presence(false);
        m.record_outcome(CacheOutcome::Miss);
        m.record_presence(true);
        m.record_outcome(CacheOutcome::Stale);
        m.record_read(Tier::File, 4096);

        let text = m.encode();
        assert!(text.contains("corp_pkgproxy_requests_total 1"));
        assert!(text.contains("corp_pkgproxy_cache_total{result=\"miss\"} 1"));
        assert!(text.contains("corp_pkgproxy_cache_total{result=\"hit\"} 1"));
        assert!(text.contains("corp_pkgproxy_cache_total{result=\"too_old\"} 1"));
        assert!(text.contains("corp_pkgproxy_cache_read_bytes_count{tier=\"file\"} 1"));
    }

    #[test]
    fn anomalies_are_counted() {
        let m = ProxyMetrics::new("").unwrap();
        m.record_anomaly();
        m.record_outcome(CacheOutcome::Recovered);

        let text = m.encode();
        assert!(text.contains("pkgproxy_cache_anomalies_total 1"));
        assert!(text.contains("pkgproxy_cache_total{result=\"item_missing\"} 2"));
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let m = ProxyMetrics::new("").unwrap();
        let dup = IntCounter::new("pkgproxy_requests_total", "dup").unwrap();
        assert!(m.registry.register(Box::new(dup)).is_err());
    }
}
