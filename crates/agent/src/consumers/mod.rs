//! The worker set spawned for every run.
//!
//! Every consumer follows the same contract: it receives its cursor (or just
//! the hub state it needs) at spawn, reacts to its control channel or to the
//! queue closing, and returns on its own once signalled so the supervisor
//! can join the handles during teardown. The algorithms behind each consumer
//! (motion analysis, MQTT, WebRTC, mp4 muxing, cloud APIs) are external
//! collaborators reached through the traits defined next to each worker.

pub mod heartbeat;
pub mod livestream_hd;
pub mod livestream_sd;
pub mod motion;
pub mod onvif;
pub mod record;
pub mod upload;

use std::path::Path;
use std::time::Duration;

use media::Frame;
use tracing::warn;

use crate::hub::{lock_decoder, DecoderSlot};

pub use heartbeat::StatusPayload;
pub use livestream_hd::{PeerBridge, PeerSink};
pub use livestream_sd::FramePublisher;
pub use motion::MotionDetector;
pub use onvif::CameraControl;
pub use record::{ContainerSink, ContainerWriter};

/// How often cursor-driven consumers surface from a blocking read to poll
/// their control inputs.
pub(crate) const CURSOR_POLL: Duration = Duration::from_millis(250);

/// Cloud endpoint consumed by the heartbeat and upload workers.
pub trait CloudClient: Send + Sync {
    fn send_heartbeat(&self, status: &StatusPayload) -> anyhow::Result<()>;
    fn upload_recording(&self, path: &Path) -> anyhow::Result<()>;
}

/// Runs one decode while holding the decoder slot's mutex, returning the
/// frame if the decoder produced one. The lock covers exactly the decode
/// call; callers run any further work after it is released.
pub(crate) fn decode_packet(slot: &DecoderSlot, packet: &packet_queue::Packet) -> Option<Frame> {
    let mut guard = lock_decoder(slot);
    let decoder = guard.as_mut()?;
    match decoder.decode(packet) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = %err, "decode failed");
            None
        }
    }
}
