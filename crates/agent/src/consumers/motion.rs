//! Motion detection consumer.
//!
//! Prefers the substream cursor when one exists (cheaper frames, same
//! scene), decodes every n-th video packet under the decoder mutex and runs
//! the external detector on the result. Positive detections go out on the
//! motion channel best-effort; a full channel means an event is already
//! pending and nothing is lost by dropping the duplicate.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::Sender;
use media::Frame;
use packet_queue::{Cursor, RecvError};
use tracing::{debug, trace};

use crate::consumers::decode_packet;
use crate::hub::{DecoderSlot, MotionEvent};
use crate::telemetry;

/// External motion algorithm. Implementations keep their own frame history
/// behind interior mutability.
pub trait MotionDetector: Send + Sync {
    /// Inspects one decoded frame; returns an event when motion is present.
    fn detect(&self, frame: &Frame) -> Option<MotionEvent>;
}

pub(crate) fn spawn_motion(
    mut cursor: Cursor,
    video_index: usize,
    slot: DecoderSlot,
    detector: Arc<dyn MotionDetector>,
    events: Sender<MotionEvent>,
    analysis_interval: u64,
) -> thread::JoinHandle<()> {
    let interval = analysis_interval.max(1);
    telemetry::spawn_thread("motion", move || {
        let mut seen: u64 = 0;
        loop {
            match cursor.next() {
                Ok(packet) => {
                    if packet.stream_index != video_index {
                        continue;
                    }
                    seen += 1;
                    if seen % interval != 0 {
                        continue;
                    }
                    let Some(frame) = decode_packet(&slot, &packet) else {
                        continue;
                    };
                    // Detector runs outside the decoder lock.
                    if let Some(event) = detector.detect(&frame) {
                        metrics::counter!("agent_motion_events_total").increment(1);
                        if events.try_send(event).is_err() {
                            trace!("motion event dropped, one already pending");
                        }
                    }
                }
                Err(RecvError::Lagged) => {
                    metrics::counter!("agent_cursor_lagged_total", "consumer" => "motion")
                        .increment(1);
                    cursor.seek_oldest();
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("motion consumer finished");
    })
    .expect("failed to spawn motion thread")
}
