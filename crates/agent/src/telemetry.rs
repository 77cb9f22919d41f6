//! Tracing and metrics bootstrap.

use std::io;
use std::net::SocketAddr;
use std::thread;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;

use crate::config::MetricsConfig;

/// Installs the global fmt subscriber. Safe to call more than once; later
/// calls are no-ops.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

/// Installs the Prometheus exporter when enabled in the configuration.
pub fn init_metrics(config: &MetricsConfig) {
    if !config.enabled {
        return;
    }
    let addr: SocketAddr = match config.bind.parse() {
        Ok(addr) => addr,
        Err(err) => {
            tracing::warn!(bind = %config.bind, %err, "invalid metrics bind address, exporter disabled");
            return;
        }
    };
    if let Err(err) = PrometheusBuilder::new().with_http_listener(addr).install() {
        tracing::warn!(%err, "failed to install metrics exporter");
    }
}

/// Spawn a thread that inherits the current tracing dispatcher.
pub(crate) fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}
