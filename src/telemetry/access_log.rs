use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{error, info};

/// The output format for access log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Newline-delimited JSON.
    #[default]
    Json,
    /// `$ip - - [$time] "$method $url HTTP/1.1" $status $bytes "$referer" "$ua" $cache`
    Combined,
    /// `$ip - - [$time] "$method $url HTTP/1.1" $status $bytes`
    Common,
}

impl LogFormat {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "combined" => LogFormat::Combined,
            "common" => LogFormat::Common,
            _ => LogFormat::Json,
        }
    }
}

/// One served request.
#[derive(Debug, Serialize)]
pub struct AccessLogEntry {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub method: String,
    /// Upstream URL the request resolved to, or the raw path if it never did.
    pub url: String,
    pub status: u16,
    pub latency_ms: u64,
    pub bytes_sent: u64,
    /// Cache outcome (`miss`, `ok`, `too_old`, ...); `-` when the cache was not consulted.
    pub cache: String,
    pub referer: String,
    pub user_agent: String,
}

impl AccessLogEntry {
    fn clf_time(&self) -> String {
        self.timestamp.format("%d/%b/%Y:%H:%M:%S %z").to_string()
    }

    fn as_combined(&self) -> String {
        format!(
            "{} - - [{}] \"{} {} HTTP/1.1\" {} {} \"{}\" \"{}\" {}",
            self.client_ip,
            self.clf_time(),
            self.method,
            self.url,
            self.status,
            self.bytes_sent,
            self.referer,
            self.user_agent,
            self.cache,
        )
    }

    fn as_common(&self) -> String {
        format!(
            "{} - - [{}] \"{} {} HTTP/1.1\" {} {}",
            self.client_ip,
            self.clf_time(),
            self.method,
            self.url,
            self.status,
            self.bytes_sent,
        )
    }

    pub fn render(&self, format: LogFormat) -> Option<String> {
        match format {
            LogFormat::Json => serde_json::to_string(self).ok(),
            LogFormat::Combined => Some(self.as_combined()),
            LogFormat::Common => Some(self.as_common()),
        }
    }
}

/// Appends entries to a file from a background task so request handlers
/// never wait on disk.
pub struct AccessLogger {
    sender: mpsc::UnboundedSender<AccessLogEntry>,
}

impl AccessLogger {
    /// Must be called inside a tokio runtime.
    pub fn new(log_path: &str, format: LogFormat) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<AccessLogEntry>();
        let path = log_path.to_string();

        tokio::spawn(async move {
            if let Some(parent) = Path::new(&path).parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }

            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await;

            match file {
                Ok(mut f) => {
                    info!(path = %path, ?format, "access log writer started");
                    while let Some(entry) = receiver.recv().await {
                        let Some(mut line) = entry.render(format) else {
                            continue;
                        };
                        line.push('\n');
                        if let Err(e) = f.write_all(line.as_bytes()).await {
                            error!(path = %path, error = %e, "access log write failed");
                        }
                    }
                }
                Err(e) => {
                    error!(path = %path, error = %e, "failed to open access log");
                    while receiver.recv().await.is_some() {}
                }
            }
        });

        Self { sender }
    }

    /// Non-blocking; entries are dropped once the writer task is gone.
    pub fn log(&self, entry: AccessLogEntry) {
        let _ = self.sender.send(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry() -> AccessLogEntry {
        AccessLogEntry {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            client_ip: "10.0.0.7".into(),
            method: "GET".into(),
            url: "http://mirror.example/pool/a.deb".into(),
            status: 200,
            latency_ms: 12,
            bytes_sent: 2048,
            cache: "miss".into(),
            referer: String::new(),
            user_agent: "apt".into(),
        }
    }

    #[test]
    fn renders_each_format() {
        let e = entry();
        assert_eq!(
            e.render(LogFormat::Common).unwrap(),
            "10.0.0.7 - - [01/Mar/2024:12:00:00 +0000] \"GET http://mirror.example/pool/a.deb HTTP/1.1\" 200 2048"
        );
        assert!(e.render(LogFormat::Combined).unwrap().ends_with("\"\" \"apt\" miss"));

        let json: serde_json::Value =
            serde_json::from_str(&e.render(LogFormat::Json).unwrap()).unwrap();
        assert_eq!(json["cache"], "miss");
        assert_eq!(json["timestamp"], 1_709_294_400_000i64);
    }

    #[test]
    fn unknown_format_falls_back_to_json() {
        assert_eq!(LogFormat::parse("COMBINED"), LogFormat::Combined);
        assert_eq!(LogFormat::parse("xml"), LogFormat::Json);
    }
}
