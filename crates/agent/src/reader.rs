//! Demuxer-to-queue pump.
//!
//! One reader thread per stream: it pulls packets in demuxer order, appends
//! them to the queue and publishes liveness. It owns no state worth flushing;
//! the queue owns the data.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, TryRecvError};
use media::{DemuxError, Demuxer};
use packet_queue::Queue;
use tracing::{debug, error, info};

use crate::hub::{Counters, WorkerSignal};
use crate::telemetry;

pub(crate) fn spawn_stream_reader(
    label: &'static str,
    demuxer: Arc<dyn Demuxer>,
    queue: Arc<Queue>,
    counters: Arc<Counters>,
    control: Receiver<WorkerSignal>,
) -> thread::JoinHandle<()> {
    telemetry::spawn_thread(format!("reader-{label}"), move || {
        loop {
            match control.try_recv() {
                Ok(WorkerSignal::Stop) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            match demuxer.read_packet() {
                Ok(packet) => {
                    if let Err(err) = queue.append(packet) {
                        debug!(stream = label, error = %err, "queue rejected packet");
                        break;
                    }
                    counters.record_packet();
                    metrics::counter!("agent_packets_total", "stream" => label).increment(1);
                    metrics::gauge!("agent_queue_gops", "stream" => label)
                        .set(queue.gop_count() as f64);
                }
                Err(DemuxError::Eof) => {
                    info!(stream = label, "demuxer reached end of stream");
                    break;
                }
                Err(DemuxError::Closed) => break,
                Err(err) => {
                    error!(stream = label, error = %err, "demuxer read failed");
                    break;
                }
            }
        }
        debug!(stream = label, "stream reader finished");
    })
    .expect("failed to spawn stream reader thread")
}
