//! Persisted agent configuration.
//!
//! The configuration lives in a JSON document at a fixed path and is re-read
//! at the start of every run so restarts pick up operator changes. A missing
//! or unparseable file is not fatal: the agent retries forever and starts
//! once the file becomes valid.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::warn;

#[derive(Clone, Debug, Deserialize)]
/// Root configuration document.
pub struct AgentConfig {
    /// Friendly camera name, used in recordings and heartbeats.
    #[serde(default = "default_name")]
    pub name: String,
    /// `"true"` disables the heartbeat and upload workers entirely.
    #[serde(default)]
    pub offline: String,
    pub capture: CaptureConfig,
    /// Seconds between heartbeat snapshots.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CaptureConfig {
    pub ipcamera: IpCameraConfig,
    /// GOPs retained ahead of an event so recordings start early.
    /// Values below 1 are coerced to 1 with a warning.
    #[serde(default = "default_pre_recording")]
    pub pre_recording: i64,
    /// Seconds a motion-triggered recording keeps running after the last
    /// event.
    #[serde(default = "default_post_recording")]
    pub post_recording: u64,
    /// Maximum length of one recording segment in seconds.
    #[serde(default = "default_max_length")]
    pub max_length: u64,
    /// `"false"` switches the recorder from continuous to motion-triggered
    /// segments.
    #[serde(default = "default_continuous")]
    pub continuous: String,
    #[serde(default = "default_recordings_dir")]
    pub recordings_dir: PathBuf,
    /// Motion detection decodes every n-th video packet.
    #[serde(default = "default_analysis_interval")]
    pub analysis_interval: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct IpCameraConfig {
    /// Primary stream URL. Required.
    pub rtsp: String,
    /// Optional low-resolution substream. Empty or equal to the primary
    /// disables the substream path.
    #[serde(default)]
    pub sub_rtsp: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_bind")]
    pub bind: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_metrics_bind(),
        }
    }
}

fn default_name() -> String {
    "camera".into()
}

fn default_heartbeat_interval() -> u64 {
    15
}

fn default_pre_recording() -> i64 {
    1
}

fn default_post_recording() -> u64 {
    10
}

fn default_max_length() -> u64 {
    120
}

fn default_continuous() -> String {
    "true".into()
}

fn default_recordings_dir() -> PathBuf {
    PathBuf::from("./data/recordings")
}

fn default_analysis_interval() -> u64 {
    2
}

fn default_metrics_bind() -> String {
    "127.0.0.1:9090".into()
}

impl AgentConfig {
    /// Reads and validates the configuration in a single attempt.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration file {}", path.display()))?;
        let mut config: AgentConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parsing configuration file {}", path.display()))?;

        if config.capture.ipcamera.rtsp.is_empty() {
            bail!("capture.ipcamera.rtsp is required");
        }
        if config.capture.pre_recording < 1 {
            warn!(
                found = config.capture.pre_recording,
                "pre-recording value missing or invalid, using 1"
            );
            config.capture.pre_recording = 1;
        }
        Ok(config)
    }

    /// Reads the configuration, retrying forever until the file is valid.
    /// The agent is expected to outlive a broken deployment and come up once
    /// the configuration is fixed externally.
    pub fn load_blocking(path: &Path, retry: Duration) -> Self {
        loop {
            match Self::load(path) {
                Ok(config) => return config,
                Err(err) => {
                    warn!(
                        error = %err,
                        retry_secs = retry.as_secs_f64(),
                        "configuration not usable yet, retrying"
                    );
                    thread::sleep(retry);
                }
            }
        }
    }

    pub fn is_offline(&self) -> bool {
        self.offline == "true"
    }

    /// Main-queue retention in GOPs: the pre-recording window plus the open
    /// GOP.
    pub fn retention_gops(&self) -> usize {
        self.capture.pre_recording as usize + 1
    }

    /// The substream URL when the substream path is enabled.
    pub fn sub_stream_url(&self) -> Option<&str> {
        let sub = self.capture.ipcamera.sub_rtsp.as_str();
        if sub.is_empty() || sub == self.capture.ipcamera.rtsp {
            None
        } else {
            Some(sub)
        }
    }

    pub fn continuous_recording(&self) -> bool {
        self.capture.continuous != "false"
    }
}
