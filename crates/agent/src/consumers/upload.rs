//! Cloud upload consumer.
//!
//! Polls the recordings directory, oldest segment first, and hands finished
//! files to the cloud client. A failed upload leaves the file in place for
//! the next round; a successful one bumps the cloud timestamp and removes
//! the local copy. Delivery is at-least-once by design.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, warn};

use crate::consumers::CloudClient;
use crate::hub::{Counters, WorkerSignal};
use crate::telemetry;

pub(crate) fn spawn_uploader(
    dir: PathBuf,
    cloud: Arc<dyn CloudClient>,
    counters: Arc<Counters>,
    control: Receiver<WorkerSignal>,
    poll: Duration,
) -> thread::JoinHandle<()> {
    telemetry::spawn_thread("uploader", move || {
        loop {
            match control.recv_timeout(poll) {
                Ok(WorkerSignal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            for path in finished_recordings(&dir) {
                match cloud.upload_recording(&path) {
                    Ok(()) => {
                        counters.touch_cloud();
                        metrics::counter!("agent_uploads_total").increment(1);
                        if let Err(err) = std::fs::remove_file(&path) {
                            warn!(path = %path.display(), error = %err, "uploaded but could not remove");
                        }
                    }
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "upload failed, will retry");
                        // The cloud is likely unreachable; try again next round.
                        break;
                    }
                }
            }
        }
        debug!("uploader finished");
    })
    .expect("failed to spawn uploader thread")
}

/// Finished segments in the recordings directory, oldest name first.
/// In-progress files keep a `.part` suffix until their writer finalizes.
fn finished_recordings(dir: &PathBuf) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .map(|ext| ext != "part")
                    .unwrap_or(true)
        })
        .collect();
    files.sort();
    files
}
