pub mod access_log;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when `RUST_LOG` is unset. `debug` turns on pkgproxy's own
/// debug output; `verbose` also lets dependencies log at info.
pub fn default_filter(debug: bool, verbose: bool) -> &'static str {
    match (debug, verbose) {
        (true, true) => "pkgproxy=debug,info",
        (true, false) => "pkgproxy=debug,warn",
        (false, true) => "info",
        (false, false) => "pkgproxy=info,warn",
    }
}

/// Installs the global `tracing` subscriber. `RUST_LOG` wins over the flags.
pub fn init_telemetry(debug: bool, verbose: bool) {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter(debug, verbose).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::debug!("debug logging enabled");
}
