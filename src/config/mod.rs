pub mod parser;

use regex::Regex;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use parser::Directive;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("line {line}: unknown directive '{name}'")]
    UnknownDirective { line: usize, name: String },
    #[error("line {line}: invalid value for '{name}': {reason}")]
    InvalidValue {
        line: usize,
        name: String,
        reason: String,
    },
    #[error("service '{service}': invalid regex: {source}")]
    Regex {
        service: String,
        #[source]
        source: regex::Error,
    },
    #[error("service '{service}' needs both 'regex' and 'ttl'")]
    IncompleteService { service: String },
    #[error("neither listen_port nor listen_ssl_port is set")]
    NoListener,
}

/// Per-host TTL override: the first rule whose regex matches the request's
/// `Host` wins.
#[derive(Debug, Clone)]
pub struct ServiceTtlRule {
    pub name: String,
    pub regex: Regex,
    pub ttl: Duration,
}

/// A CIDR block whose members may set `X-Forwarded-For` / `X-Real-IP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustedNetwork {
    addr: IpAddr,
    prefix: u8,
}

impl TrustedNetwork {
    /// Parses `10.0.0.0/8`, `fd00::/8`, or a bare address (full-length prefix).
    pub fn parse(s: &str) -> Option<Self> {
        let (addr, prefix) = match s.split_once('/') {
            Some((a, p)) => (a.parse::<IpAddr>().ok()?, Some(p.parse::<u8>().ok()?)),
            None => (s.parse::<IpAddr>().ok()?, None),
        };
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = prefix.unwrap_or(max);
        (prefix <= max).then_some(Self { addr, prefix })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - self.prefix as u32).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - self.prefix as u32).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

/// The global application configuration state.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_address: String,
    /// Plain HTTP port; 0 disables the listener.
    pub listen_port: u16,
    /// HTTPS port; 0 disables the listener.
    pub listen_ssl_port: u16,
    pub ssl_certificate: Option<PathBuf>,
    pub ssl_certificate_key: Option<PathBuf>,
    pub no_ssl: bool,
    /// Client connection timeout (header read).
    pub timeout: Duration,
    /// Total time allowed for one upstream fetch.
    pub upstream_timeout: Duration,
    pub cache_folder: PathBuf,
    /// Bodies up to this many bytes are kept in memory.
    pub memory_threshold: u64,
    pub default_cache_ttl: Duration,
    /// Outbound HTTP proxy URL for upstream fetches.
    pub proxy: Option<String>,
    pub proxy_networks: Vec<TrustedNetwork>,
    /// Directory served under the `local/` URL prefix.
    pub local_root: Option<PathBuf>,
    pub prometheus_listen: String,
    pub prometheus_metric_prefix: String,
    /// Path to write access logs. If None, access logging is disabled.
    pub access_log_path: Option<String>,
    /// Format of access log entries: "json" (default), "combined", or "common".
    pub access_log_format: Option<String>,
    pub worker_threads: usize,
    pub debug: bool,
    pub services: Vec<ServiceTtlRule>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            listen_port: 8080,
            listen_ssl_port: 0,
            ssl_certificate: None,
            ssl_certificate_key: None,
            no_ssl: false,
            timeout: Duration::from_secs(60),
            upstream_timeout: Duration::from_secs(180),
            cache_folder: PathBuf::from("./cache"),
            memory_threshold: 1024 * 1024,
            default_cache_ttl: Duration::from_secs(3600),
            proxy: None,
            proxy_networks: Vec::new(),
            local_root: None,
            prometheus_listen: "127.0.0.1:2112".to_string(),
            prometheus_metric_prefix: String::new(),
            access_log_path: None,
            access_log_format: None,
            worker_threads: 4,
            debug: false,
            services: Vec::new(),
        }
    }
}

impl AppConfig {
    /// TTL for requests addressed to `host`.
    pub fn ttl_for_host(&self, host: &str) -> Duration {
        self.services
            .iter()
            .find(|rule| rule.regex.is_match(host))
            .map_or(self.default_cache_ttl, |rule| rule.ttl)
    }

    pub fn is_trusted_proxy(&self, peer: IpAddr) -> bool {
        self.proxy_networks.iter().any(|net| net.contains(peer))
    }

    pub fn http_bind(&self) -> Option<String> {
        (self.listen_port != 0).then(|| format!("{}:{}", self.listen_address, self.listen_port))
    }

    pub fn https_bind(&self) -> Option<String> {
        (self.listen_ssl_port != 0 && !self.no_ssl)
            .then(|| format!("{}:{}", self.listen_address, self.listen_ssl_port))
    }
}

/// Reads and parses the config file at `path`.
pub fn load_config(path: impl AsRef<Path>) -> Result<AppConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content)
}

/// Builds an [`AppConfig`] from configuration text, starting from defaults.
pub fn parse_config(content: &str) -> Result<AppConfig, ConfigError> {
    let file = parser::parse_config_file(content)?;
    let mut cfg = AppConfig::default();

    for d in &file.directives {
        match d.name.as_str() {
            "listen_address" => cfg.listen_address = single(d)?.to_string(),
            "listen_port" => cfg.listen_port = number(d)?,
            "listen_ssl_port" => cfg.listen_ssl_port = number(d)?,
            "ssl_certificate" => cfg.ssl_certificate = Some(PathBuf::from(single(d)?)),
            "ssl_certificate_key" => cfg.ssl_certificate_key = Some(PathBuf::from(single(d)?)),
            "no_ssl" => cfg.no_ssl = flag(d)?,
            "timeout" => cfg.timeout = duration(d)?,
            "upstream_timeout" => cfg.upstream_timeout = duration(d)?,
            "cache_folder" => cfg.cache_folder = PathBuf::from(single(d)?),
            "memory_threshold" => cfg.memory_threshold = byte_size(d)?,
            "default_cache_ttl" => cfg.default_cache_ttl = duration(d)?,
            "proxy" => cfg.proxy = Some(single(d)?.to_string()).filter(|p| !p.is_empty()),
            "proxy_networks" => {
                cfg.proxy_networks = d
                    .values
                    .iter()
                    .map(|v| {
                        TrustedNetwork::parse(v)
                            .ok_or_else(|| invalid(d, format!("'{v}' is not an address or CIDR")))
                    })
                    .collect::<Result<_, _>>()?;
            }
            "local_root" => cfg.local_root = Some(PathBuf::from(single(d)?)),
            "prometheus_listen" => cfg.prometheus_listen = single(d)?.to_string(),
            "prometheus_metric_prefix" => cfg.prometheus_metric_prefix = single(d)?.to_string(),
            "access_log" => cfg.access_log_path = Some(single(d)?.to_string()),
            "access_log_format" => {
                let format = single(d)?;
                if !matches!(format, "json" | "combined" | "common") {
                    return Err(invalid(d, "expected json, combined or common"));
                }
                cfg.access_log_format = Some(format.to_string());
            }
            "worker_threads" => {
                cfg.worker_threads = number(d)?;
                if cfg.worker_threads == 0 {
                    return Err(invalid(d, "must be at least 1"));
                }
            }
            "debug" => cfg.debug = flag(d)?,
            _ => {
                return Err(ConfigError::UnknownDirective {
                    line: d.line,
                    name: d.name.clone(),
                })
            }
        }
    }

    for block in &file.services {
        let mut regex = None;
        let mut ttl = None;
        for d in &block.directives {
            match d.name.as_str() {
                "regex" => {
                    let compiled = Regex::new(single(d)?).map_err(|source| ConfigError::Regex {
                        service: block.name.clone(),
                        source,
                    })?;
                    regex = Some(compiled);
                }
                "ttl" => ttl = Some(duration(d)?),
                _ => {
                    return Err(ConfigError::UnknownDirective {
                        line: d.line,
                        name: d.name.clone(),
                    })
                }
            }
        }
        let (Some(regex), Some(ttl)) = (regex, ttl) else {
            return Err(ConfigError::IncompleteService {
                service: block.name.clone(),
            });
        };
        cfg.services.push(ServiceTtlRule {
            name: block.name.clone(),
            regex,
            ttl,
        });
    }

    if cfg.listen_port == 0 && cfg.listen_ssl_port == 0 {
        return Err(ConfigError::NoListener);
    }
    Ok(cfg)
}

fn invalid(d: &Directive, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        line: d.line,
        name: d.name.clone(),
        reason: reason.into(),
    }
}

fn single(d: &Directive) -> Result<&str, ConfigError> {
    match d.values.as_slice() {
        [v] => Ok(v),
        _ => Err(invalid(d, format!("expected one value, got {}", d.values.len()))),
    }
}

fn number<T: std::str::FromStr>(d: &Directive) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    let v = single(d)?;
    v.parse().map_err(|e| invalid(d, format!("'{v}': {e}")))
}

fn flag(d: &Directive) -> Result<bool, ConfigError> {
    match single(d)? {
        "on" | "true" | "yes" => Ok(true),
        "off" | "false" | "no" => Ok(false),
        other => Err(invalid(d, format!("'{other}' is not a boolean"))),
    }
}

/// Humantime duration; a bare number means seconds.
fn duration(d: &Directive) -> Result<Duration, ConfigError> {
    let v = single(d)?;
    if let Ok(secs) = v.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(v).map_err(|e| invalid(d, format!("'{v}': {e}")))
}

/// Byte count with an optional `k`, `m` or `g` suffix (powers of 1024).
fn byte_size(d: &Directive) -> Result<u64, ConfigError> {
    let v = single(d)?;
    let lower = v.to_ascii_lowercase();
    let (digits, shift) = match lower.as_bytes().last() {
        Some(b'k') => (&lower[..lower.len() - 1], 10),
        Some(b'm') => (&lower[..lower.len() - 1], 20),
        Some(b'g') => (&lower[..lower.len() - 1], 30),
        _ => (lower.as_str(), 0),
    };
    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(1u64 << shift))
        .ok_or_else(|| invalid(d, format!("'{v}' is not a byte size")))
}
