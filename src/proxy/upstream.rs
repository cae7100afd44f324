use futures_util::TryStreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

use crate::admin::ProxyMetrics;
use crate::cache::{CacheError, Fetched, Upstream};
use crate::config::AppConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Fetches mirror content over HTTP(S) with reqwest.
pub struct HttpUpstream {
    client: reqwest::Client,
    proxy: Option<String>,
    metrics: Option<Arc<ProxyMetrics>>,
}

impl HttpUpstream {
    pub fn new(
        config: &AppConfig,
        metrics: Option<Arc<ProxyMetrics>>,
    ) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.upstream_timeout)
            .user_agent(concat!("pkgproxy/", env!("CARGO_PKG_VERSION")));
        builder = match &config.proxy {
            Some(proxy) => builder.proxy(reqwest::Proxy::all(proxy.as_str())?),
            None => builder.no_proxy(),
        };

        Ok(Self {
            client: builder.build()?,
            proxy: config.proxy.clone(),
            metrics,
        })
    }

    fn record(&self, ok: bool) {
        if let Some(m) = &self.metrics {
            if ok {
                m.remote_ok_total.inc();
            } else {
                m.remote_errors_total.inc();
            }
        }
    }
}

impl Upstream for HttpUpstream {
    async fn fetch(&self, url: &str) -> Result<Fetched, CacheError> {
        match &self.proxy {
            Some(proxy) => info!(url, proxy = %proxy, "GET via proxy"),
            None => info!(url, "GET"),
        }
        let started = Instant::now();

        let response = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                self.record(false);
                warn!(url, error = %e, "upstream request failed");
                return Err(CacheError::fetch_failed(url, e));
            }
        };

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            self.record(false);
            warn!(url, %status, "upstream returned non-200");
            return Err(CacheError::fetch_failed(url, format!("returned {status}")));
        }
        self.record(true);
        debug!(url, elapsed = ?started.elapsed(), "upstream headers received");

        let content_length = response.content_length();
        let stream = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Fetched::new(
            StreamReader::new(Box::pin(stream)),
            content_length,
        ))
    }
}
