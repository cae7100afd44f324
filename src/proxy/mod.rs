use arc_swap::ArcSwap;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::header::{self, HeaderValue};
use hyper::server::conn::{http1, http2};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use std::convert::Infallible;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admin::ProxyMetrics;
use crate::cache::{CacheEngine, CacheError, CacheKey, CacheOutcome, CachedContent, Upstream};
use crate::config::AppConfig;
use crate::telemetry::access_log::{AccessLogEntry, AccessLogger};

pub mod local;
pub mod tls;
pub mod upstream;

pub use upstream::HttpUpstream;

pub type ProxyBody = BoxBody<Bytes, std::io::Error>;

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";
const CACHE_HEADER: &str = "x-pkgproxy-cache";

/// Scheme of the listener a request arrived on; the default scheme of the
/// upstream URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    fn prefix(self) -> &'static str {
        match self {
            Scheme::Http => "http://",
            Scheme::Https => "https://",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        })
    }
}

/// Everything a request handler needs, shared by both listeners.
pub struct ProxyState<U> {
    /// Swapped on SIGHUP.
    pub config: Arc<ArcSwap<AppConfig>>,
    pub engine: Arc<CacheEngine>,
    pub upstream: Arc<U>,
    pub metrics: Arc<ProxyMetrics>,
    pub access_logger: Option<Arc<AccessLogger>>,
}

pub(crate) fn empty_response(status: StatusCode) -> Response<ProxyBody> {
    let mut resp = Response::new(Empty::<Bytes>::new().map_err(|never| match never {}).boxed());
    *resp.status_mut() = status;
    resp
}

pub(crate) fn text_response(status: StatusCode, msg: &'static str) -> Response<ProxyBody> {
    let mut resp = Response::new(
        Full::new(Bytes::from_static(msg.as_bytes()))
            .map_err(|never| match never {})
            .boxed(),
    );
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

/// Accepts connections on `listener` until `shutdown` fires. With a
/// `tls_acceptor` every connection is TLS.
pub async fn start_proxy<U>(
    listener: TcpListener,
    scheme: Scheme,
    tls_acceptor: Option<TlsAcceptor>,
    state: Arc<ProxyState<U>>,
    shutdown: CancellationToken,
) where
    U: Upstream + 'static,
{
    match listener.local_addr() {
        Ok(addr) => info!("listening on {}://{}/", scheme, addr),
        Err(e) => warn!(error = %e, "listener has no local address"),
    }

    loop {
        let (stream, peer) = tokio::select! {
            result = listener.accept() => match result {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "accept error");
                    continue;
                }
            },
            _ = shutdown.cancelled() => {
                info!(%scheme, "listener shutting down");
                break;
            }
        };

        let state = Arc::clone(&state);
        let tls_acceptor = tls_acceptor.clone();
        tokio::spawn(async move {
            match tls_acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        let h2 = tls_stream.get_ref().1.alpn_protocol() == Some(b"h2".as_slice());
                        let io = TokioIo::new(tls_stream);
                        if h2 {
                            serve_h2_connection(io, peer, scheme, state).await
                        } else {
                            serve_connection(io, peer, scheme, state).await
                        }
                    }
                    Err(e) => debug!(%peer, error = %e, "TLS handshake failed"),
                },
                None => serve_connection(TokioIo::new(stream), peer, scheme, state).await,
            }
        });
    }
}

async fn serve_connection<I, U>(
    io: TokioIo<I>,
    peer: SocketAddr,
    scheme: Scheme,
    state: Arc<ProxyState<U>>,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    U: Upstream + 'static,
{
    let timeout = state.config.load().timeout;
    let svc = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_request(req, peer, scheme, state).await }
    });

    if let Err(e) = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(timeout)
        .serve_connection(io, svc)
        .await
    {
        debug!(%peer, error = ?e, "error serving connection");
    }
}

/// HTTP/2, only offered to TLS clients that negotiate `h2` via ALPN.
async fn serve_h2_connection<I, U>(
    io: TokioIo<I>,
    peer: SocketAddr,
    scheme: Scheme,
    state: Arc<ProxyState<U>>,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    U: Upstream + 'static,
{
    let svc = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_request(req, peer, scheme, state).await }
    });

    if let Err(e) = http2::Builder::new(TokioExecutor::new())
        .timer(TokioTimer::new())
        .serve_connection(io, svc)
        .await
    {
        debug!(%peer, error = ?e, "error serving HTTP/2 connection");
    }
}

/// The request as the dispatcher resolved it, for logging.
struct Dispatched {
    response: Response<ProxyBody>,
    url: String,
    outcome: Option<CacheOutcome>,
}

impl Dispatched {
    fn plain(response: Response<ProxyBody>, url: impl Into<String>) -> Self {
        Self {
            response,
            url: url.into(),
            outcome: None,
        }
    }
}

/// Handles one client request: resolves the upstream URL, serves it through
/// the cache and writes the access log line.
pub async fn handle_request<U, B>(
    req: Request<B>,
    peer: SocketAddr,
    scheme: Scheme,
    state: Arc<ProxyState<U>>,
) -> Result<Response<ProxyBody>, Infallible>
where
    U: Upstream + 'static,
{
    let started = Instant::now();
    state.metrics.requests_total.inc();
    let config = state.config.load_full();
    let client_ip = client_ip(&req, peer.ip(), &config);

    let dispatched = dispatch(&req, client_ip, scheme, &config, &state).await;

    let status = dispatched.response.status();
    let cache = dispatched.outcome.map_or("-", CacheOutcome::as_str);
    info!(
        client = %client_ip,
        method = %req.method(),
        url = %dispatched.url,
        status = status.as_u16(),
        cache,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );

    if let Some(logger) = &state.access_logger {
        let header_str = |name: header::HeaderName| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string()
        };
        let bytes_sent = if req.method() == Method::HEAD {
            0
        } else {
            dispatched
                .response
                .headers()
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        };
        logger.log(AccessLogEntry {
            timestamp: Utc::now(),
            client_ip: client_ip.to_string(),
            method: req.method().to_string(),
            url: dispatched.url.clone(),
            status: status.as_u16(),
            latency_ms: started.elapsed().as_millis() as u64,
            bytes_sent,
            cache: cache.to_string(),
            referer: header_str(header::REFERER),
            user_agent: header_str(header::USER_AGENT),
        });
    }

    Ok(dispatched.response)
}

async fn dispatch<U, B>(
    req: &Request<B>,
    client_ip: IpAddr,
    scheme: Scheme,
    config: &AppConfig,
    state: &ProxyState<U>,
) -> Dispatched
where
    U: Upstream + 'static,
{
    let metrics = &state.metrics;
    let path = req
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str())
        .trim_start_matches('/');

    let method = req.method();
    if method != Method::GET && method != Method::HEAD && method != Method::PATCH {
        metrics.http_nonget_requests_total.inc();
        warn!(%method, path, client = %client_ip, "method not allowed");
        let mut resp = text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "only GET, HEAD and PATCH are allowed\n",
        );
        resp.headers_mut()
            .insert(header::ALLOW, HeaderValue::from_static("GET, HEAD, PATCH"));
        return Dispatched::plain(resp, path);
    }
    match scheme {
        Scheme::Http => metrics.http_requests_total.inc(),
        Scheme::Https => metrics.https_requests_total.inc(),
    }
    let head_only = method == Method::HEAD;

    let (upstream_scheme, rest) = if let Some(rest) = path.strip_prefix("https:") {
        (Scheme::Https, rest.trim_start_matches('/'))
    } else if let Some(rest) = path.strip_prefix("http:") {
        (Scheme::Http, rest.trim_start_matches('/'))
    } else if let Some(rest) = path.strip_prefix("local/") {
        let resp = local::serve_local_file(config.local_root.as_deref(), rest, head_only).await;
        return Dispatched::plain(resp, path);
    } else {
        (scheme, path)
    };

    let url = format!("{}{}", upstream_scheme.prefix(), rest);
    let key = match CacheKey::parse(&url) {
        Ok(k) => k,
        Err(e) => {
            warn!(url, error = %e, "rejecting request");
            return Dispatched::plain(
                text_response(StatusCode::BAD_REQUEST, "invalid resource URL\n"),
                url,
            );
        }
    };
    metrics.host_requests_total.with_label_values(&[key.host()]).inc();

    let ttl = config.ttl_for_host(request_host(req));
    let force = method == Method::PATCH;
    debug!(key = %key, ?ttl, force, "serving from cache");

    match state.engine.serve(&key, ttl, force, &state.upstream).await {
        Ok(content) => {
            let outcome = content.outcome;
            metrics.record_presence(outcome != CacheOutcome::Miss);
            metrics.record_outcome(outcome);
            metrics.record_read(content.tier, content.size);
            let response = content_response(content, rest, head_only, req);
            Dispatched {
                response,
                url,
                outcome: Some(outcome),
            }
        }
        Err(e) => {
            if matches!(e, CacheError::ConsistencyAnomaly { .. }) {
                metrics.record_anomaly();
                error!(key = %key, error = %e, "cache failure");
            } else {
                warn!(key = %key, error = %e, "could not retrieve resource");
            }
            let status = if matches!(e, CacheError::InvalidKey { .. }) {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::BAD_GATEWAY
            };
            Dispatched::plain(
                text_response(status, "could not retrieve resource\n"),
                url,
            )
        }
    }
}

/// `Host` without the port, falling back to the request URI's authority.
fn request_host<B>(req: &Request<B>) -> &str {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host())
        .unwrap_or("");
    match host.rsplit_once(':') {
        Some((name, port))
            if !port.is_empty()
                && port.bytes().all(|b| b.is_ascii_digit())
                && (!name.contains(':') || name.ends_with(']')) =>
        {
            name
        }
        _ => host,
    }
}

/// The socket peer, unless it is a trusted proxy that names the real client
/// in `X-Forwarded-For` (last hop) or `X-Real-IP`.
pub fn client_ip<B>(req: &Request<B>, peer: IpAddr, config: &AppConfig) -> IpAddr {
    if !config.is_trusted_proxy(peer) {
        return peer;
    }
    let parse = |v: &str| v.trim().parse::<IpAddr>().ok();
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit(',').next())
        .and_then(parse)
        .or_else(|| {
            req.headers()
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .and_then(parse)
        })
        .unwrap_or(peer)
}

fn content_response<B>(
    content: CachedContent,
    path: &str,
    head_only: bool,
    req: &Request<B>,
) -> Response<ProxyBody> {
    let modified: DateTime<Utc> = content.loaded_at.into();
    let not_modified = req
        .headers()
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        .is_some_and(|since| modified.timestamp() <= since.timestamp());

    let mut response = if not_modified {
        empty_response(StatusCode::NOT_MODIFIED)
    } else if head_only {
        empty_response(StatusCode::OK)
    } else {
        let stream = tokio_util::io::ReaderStream::new(content.reader);
        let body = http_body_util::StreamBody::new(
            stream.map(|result| result.map(hyper::body::Frame::data)),
        );
        Response::new(BodyExt::boxed(body))
    };

    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&modified.format(HTTP_DATE).to_string()) {
        headers.insert(header::LAST_MODIFIED, v);
    }
    headers.insert(
        CACHE_HEADER,
        HeaderValue::from_static(content.outcome.as_str()),
    );
    if not_modified {
        return response;
    }

    let path = path.split('?').next().unwrap_or(path);
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    if let Ok(v) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(header::CONTENT_TYPE, v);
    }
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_static("attachment"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(content.size));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: &[(&str, &str)]) -> Request<()> {
        let mut builder = Request::builder().uri("/mirror.example/a.deb");
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn client_ip_trusts_only_configured_networks() {
        let mut cfg = AppConfig::default();
        let peer: IpAddr = "10.1.2.3".parse().unwrap();
        let req = request(&[("x-forwarded-for", "203.0.113.5, 198.51.100.7")]);
        assert_eq!(client_ip(&req, peer, &cfg), peer);

        cfg.proxy_networks = vec![crate::config::TrustedNetwork::parse("10.0.0.0/8").unwrap()];
        assert_eq!(
            client_ip(&req, peer, &cfg),
            "198.51.100.7".parse::<IpAddr>().unwrap()
        );

        let req = request(&[("x-real-ip", "203.0.113.5")]);
        assert_eq!(
            client_ip(&req, peer, &cfg),
            "203.0.113.5".parse::<IpAddr>().unwrap()
        );

        let req = request(&[("x-forwarded-for", "garbage")]);
        assert_eq!(client_ip(&req, peer, &cfg), peer);
    }

    #[test]
    fn host_strips_port() {
        assert_eq!(request_host(&request(&[("host", "deb.proxy:8080")])), "deb.proxy");
        assert_eq!(request_host(&request(&[("host", "deb.proxy")])), "deb.proxy");
        assert_eq!(request_host(&request(&[("host", "[::1]:8080")])), "[::1]");
        assert_eq!(request_host(&request(&[])), "");
    }
}
