use pkgproxy::*;

use arc_swap::ArcSwap;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use cache::{CacheEngine, StorageConfig};
use proxy::{HttpUpstream, ProxyState, Scheme};
use telemetry::access_log::{AccessLogger, LogFormat};

#[derive(Debug, Parser)]
#[command(name = "pkgproxy", version, about = "Caching reverse proxy for package mirrors")]
struct Cli {
    /// Configuration file.
    #[arg(short, long, default_value = "pkgproxy.conf")]
    config: PathBuf,
    /// Log pkgproxy's own debug output.
    #[arg(long)]
    debug: bool,
    /// Let dependencies log at info level as well.
    #[arg(short, long)]
    verbose: bool,
}

/// The config is read before the runtime is built, because it decides the
/// number of worker threads.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let app_config = config::load_config(&cli.config)?;
    telemetry::init_telemetry(cli.debug || app_config.debug, cli.verbose);

    tracing::info!(
        config = %cli.config.display(),
        workers = app_config.worker_threads,
        cache_folder = %app_config.cache_folder.display(),
        "starting pkgproxy {}",
        env!("CARGO_PKG_VERSION")
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(app_config.worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(run(cli.config, app_config))
}

async fn run(
    config_path: PathBuf,
    app_config: config::AppConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = CancellationToken::new();
    let shutdown_signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received, stopping listeners");
        shutdown_signal_token.cancel();
    });

    let engine = Arc::new(CacheEngine::open(StorageConfig {
        root: app_config.cache_folder.clone(),
        memory_threshold: app_config.memory_threshold,
    })?);
    let metrics = Arc::new(admin::ProxyMetrics::new(&app_config.prometheus_metric_prefix)?);
    let upstream = Arc::new(HttpUpstream::new(&app_config, Some(Arc::clone(&metrics)))?);

    let access_logger = app_config.access_log_path.as_deref().map(|path| {
        let format = LogFormat::parse(app_config.access_log_format.as_deref().unwrap_or("json"));
        Arc::new(AccessLogger::new(path, format))
    });

    let http_bind = app_config.http_bind();
    let https_bind = app_config.https_bind();
    let tls_acceptor = https_bind
        .as_ref()
        .and_then(|_| proxy::tls::load_tls_acceptor(&app_config));
    let prometheus_listen = app_config.prometheus_listen.clone();

    let config = Arc::new(ArcSwap::from_pointee(app_config));
    reload::spawn_reload_handler(Arc::clone(&config), config_path);

    let state = Arc::new(ProxyState {
        config,
        engine: Arc::clone(&engine),
        upstream,
        metrics: Arc::clone(&metrics),
        access_logger,
    });

    let admin_state = admin::AdminState {
        metrics,
        engine,
    };
    tokio::spawn(admin::start_admin_server(prometheus_listen, admin_state));

    let mut listeners = tokio::task::JoinSet::new();
    if let Some(addr) = http_bind {
        let listener = TcpListener::bind(&addr).await?;
        listeners.spawn(proxy::start_proxy(
            listener,
            Scheme::Http,
            None,
            Arc::clone(&state),
            shutdown.clone(),
        ));
    }
    match (https_bind, tls_acceptor) {
        (Some(addr), Some(acceptor)) => {
            let listener = TcpListener::bind(&addr).await?;
            listeners.spawn(proxy::start_proxy(
                listener,
                Scheme::Https,
                Some(acceptor),
                Arc::clone(&state),
                shutdown.clone(),
            ));
        }
        (Some(addr), None) => {
            tracing::error!(%addr, "TLS material unavailable, HTTPS listener disabled");
        }
        _ => {}
    }

    if listeners.is_empty() {
        return Err("no listener could be started".into());
    }
    while listeners.join_next().await.is_some() {}
    Ok(())
}

/// Waits for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!("received Ctrl+C"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot register SIGTERM handler");
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}
