//! Heartbeat consumer.
//!
//! Sends a status snapshot to the cloud on a fixed interval so the fleet can
//! tell a healthy agent from one that silently died. Skipped entirely when
//! the configuration marks the agent offline.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::Serialize;
use tracing::{debug, warn};

use crate::consumers::CloudClient;
use crate::hub::{Counters, WorkerSignal};
use crate::telemetry;

/// Snapshot shipped with every heartbeat.
#[derive(Clone, Debug, Serialize)]
pub struct StatusPayload {
    pub agent: String,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub packets: i64,
    pub last_packet_ts: i64,
}

pub(crate) fn spawn_heartbeat(
    agent_name: String,
    uptime_start: Instant,
    counters: Arc<Counters>,
    cloud: Arc<dyn CloudClient>,
    control: Receiver<WorkerSignal>,
    interval: Duration,
) -> thread::JoinHandle<()> {
    telemetry::spawn_thread("heartbeat", move || {
        loop {
            match control.recv_timeout(interval) {
                Ok(WorkerSignal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            let status = StatusPayload {
                agent: agent_name.clone(),
                version: env!("CARGO_PKG_VERSION"),
                uptime_secs: uptime_start.elapsed().as_secs(),
                packets: counters.packets(),
                last_packet_ts: counters.last_packet_ts(),
            };
            match cloud.send_heartbeat(&status) {
                Ok(()) => {
                    counters.touch_cloud();
                    metrics::counter!("agent_heartbeats_total").increment(1);
                }
                Err(err) => warn!(error = %err, "heartbeat failed"),
            }
        }
        debug!("heartbeat finished");
    })
    .expect("failed to spawn heartbeat thread")
}
