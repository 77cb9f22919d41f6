//! Packet-count sampler that turns a silent camera into a restart.
//!
//! The controller distinguishes "slow" from "stuck" by sampling the packet
//! counter on a fixed tick: three identical samples in a row mean no packet
//! has arrived for the whole window and the camera is considered stalled.
//! While an external reconfiguration is in flight the count is held, not
//! grown, so a deliberate pause never escalates.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::hub::{BootstrapSignal, Hub};
use crate::telemetry;

/// Consecutive no-progress samples before a restart is raised.
const STALL_TICKS: u32 = 3;

/// Spawns the controller thread. It runs for the whole life of the agent,
/// across restarts, and never terminates on its own.
pub(crate) fn spawn(hub: Arc<Hub>, tick: Duration, hold: Duration) -> thread::JoinHandle<()> {
    let bootstrap = hub.bootstrap_sender();
    telemetry::spawn_thread("liveness", move || {
        let mut previous: i64 = 0;
        let mut occurrences: u32 = 0;
        loop {
            thread::sleep(tick);

            let current = hub.counters.packets();
            if current == previous {
                // A reconfiguration legitimately pauses the stream; hold the
                // count instead of escalating.
                if !hub.is_configuring() {
                    occurrences += 1;
                }
            } else {
                occurrences = 0;
            }
            debug!(packets = current, stalled_ticks = occurrences, "liveness sample");

            if occurrences == STALL_TICKS {
                warn!(
                    window_secs = (tick * STALL_TICKS).as_secs_f64(),
                    "no packet progress, requesting restart"
                );
                metrics::counter!("agent_restarts_total").increment(1);
                let _ = bootstrap.try_send(BootstrapSignal::Restart);
                thread::sleep(hold);
                occurrences = 0;
            }
            previous = current;
        }
    })
    .expect("failed to spawn liveness controller thread")
}
