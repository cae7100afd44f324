use arc_swap::ArcSwap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use crate::config::{load_config, AppConfig};

/// Re-reads the config file and swaps it in. A file that fails to load
/// leaves the running config untouched.
pub fn reload_config(config: &ArcSwap<AppConfig>, conf_path: &std::path::Path) -> bool {
    match load_config(conf_path) {
        Ok(new_config) => {
            info!(
                services = new_config.services.len(),
                trusted_networks = new_config.proxy_networks.len(),
                default_ttl = ?new_config.default_cache_ttl,
                "configuration reloaded"
            );
            config.store(Arc::new(new_config));
            true
        }
        Err(e) => {
            error!(
                path = %conf_path.display(),
                error = %e,
                "reload failed, keeping current configuration"
            );
            false
        }
    }
}

/// Spawns a background task that reloads the configuration on SIGHUP.
///
/// Only request-time settings take effect (TTL rules, `local_root`, trusted
/// networks, the client header `timeout`). Listeners, the cache folder and the
/// upstream client with its `upstream_timeout` and `proxy` are fixed at startup.
pub fn spawn_reload_handler(config: Arc<ArcSwap<AppConfig>>, conf_path: PathBuf) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sighup = match signal(SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "cannot register SIGHUP handler, hot reload disabled");
                    return;
                }
            };

            while sighup.recv().await.is_some() {
                info!("SIGHUP received, reloading configuration");
                reload_config(&config, &conf_path);
            }
        }

        #[cfg(not(unix))]
        {
            tracing::warn!("hot reload (SIGHUP) is only supported on Unix platforms");
            let _ = (config, conf_path);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn bad_file_keeps_previous_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkgproxy.conf");
        let config = ArcSwap::from_pointee(AppConfig::default());

        std::fs::write(&path, "default_cache_ttl 5m;\ntimeout 15s;").unwrap();
        assert!(reload_config(&config, &path));
        assert_eq!(config.load().default_cache_ttl, Duration::from_secs(300));
        assert_eq!(config.load().timeout, Duration::from_secs(15));

        std::fs::write(&path, "default_cache_ttl;").unwrap();
        assert!(!reload_config(&config, &path));
        assert_eq!(config.load().default_cache_ttl, Duration::from_secs(300));
    }
}
