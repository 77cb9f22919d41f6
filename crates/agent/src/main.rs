use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use media::sim::{SimCameraConfig, SimSource};
use media::MediaSource;
use tracing::{info, warn};

use agent::collab;
use agent::config::AgentConfig;
use agent::telemetry;
use agent::{Hub, Supervisor};

#[derive(Debug, Parser)]
#[command(name = "agent", version, about = "Single-camera surveillance agent")]
struct Cli {
    /// Path to the configuration file, re-read on every restart.
    #[arg(long, value_name = "PATH", default_value = "./data/config/agent.json")]
    config: PathBuf,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    telemetry::init_tracing();
    let cli = Cli::parse();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "surveillance agent starting"
    );

    let config = AgentConfig::load_blocking(&cli.config, Duration::from_secs(5));
    telemetry::init_metrics(&config.metrics);

    let hub = Hub::new();
    let ctrlc_hub = Arc::clone(&hub);
    if let Err(err) = ctrlc::set_handler(move || ctrlc_hub.dispatch_command("stop")) {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }

    let source = media_backend(&config.capture.ipcamera.rtsp)?;
    let mut supervisor = Supervisor::new(cli.config, hub, source, collab::demo_collaborators());
    supervisor.run()?;

    info!("agent stopped");
    Ok(())
}

/// Picks the media backend by URL scheme. Production RTSP backends plug in
/// here through [`media::MediaSource`].
fn media_backend(url: &str) -> Result<Arc<dyn MediaSource>> {
    if url.starts_with("sim://") {
        return Ok(Arc::new(SimSource::new(SimCameraConfig::default())));
    }
    bail!("no media backend for {url}; this build only ships the sim:// camera")
}
