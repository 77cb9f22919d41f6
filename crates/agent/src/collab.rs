//! Demo-grade collaborator implementations.
//!
//! `sim://` runs need something on the far side of every consumer trait.
//! The pixel-difference detector is a real, if blunt, motion algorithm; the
//! rest log what a production integration (MQTT, WebRTC, mp4 muxer, cloud
//! API) would do. All of them are replaced wholesale at integration time.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{bail, Context};
use chrono::Utc;
use media::Frame;
use packet_queue::{CodecParameters, Packet};
use tracing::{debug, info};

use crate::consumers::{
    CameraControl, CloudClient, ContainerSink, ContainerWriter, FramePublisher, MotionDetector,
    PeerBridge, PeerSink, StatusPayload,
};
use crate::hub::{MotionEvent, OnvifAction, SdpOffer};
use crate::supervisor::Collaborators;

/// Wires the demo implementations below into a collaborator set.
pub fn demo_collaborators() -> Collaborators {
    Collaborators {
        motion: Arc::new(PixelDiffDetector::new(2_000)),
        publisher: Arc::new(LogPublisher),
        webrtc: Arc::new(NoSignallingBridge),
        recordings: Arc::new(RawSegmentSink),
        cloud: Arc::new(LogCloud),
        camera: Arc::new(LogCameraControl),
    }
}

/// Frame differencing against the previous frame: counts pixels whose value
/// moved more than a small threshold and fires when enough of them did.
pub struct PixelDiffDetector {
    min_changed: u64,
    previous: Mutex<Option<Vec<u8>>>,
}

impl PixelDiffDetector {
    pub fn new(min_changed: u64) -> Self {
        Self {
            min_changed,
            previous: Mutex::new(None),
        }
    }
}

impl MotionDetector for PixelDiffDetector {
    fn detect(&self, frame: &Frame) -> Option<MotionEvent> {
        let mut previous = self
            .previous
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let changed = match previous.as_ref() {
            Some(last) if last.len() == frame.data.len() => frame
                .data
                .iter()
                .zip(last.iter())
                .filter(|(a, b)| a.abs_diff(**b) > 12)
                .count() as u64,
            _ => 0,
        };
        *previous = Some(frame.data.clone());

        (changed >= self.min_changed).then(|| MotionEvent {
            timestamp: Utc::now().timestamp(),
            pixels_changed: changed,
        })
    }
}

/// Stands in for the MQTT publisher.
struct LogPublisher;

impl FramePublisher for LogPublisher {
    fn publish_frame(&self, frame: &Frame) -> anyhow::Result<()> {
        debug!(
            width = frame.width,
            height = frame.height,
            "would publish preview frame"
        );
        Ok(())
    }

    fn disconnect(&self) {
        debug!("publisher disconnect");
    }
}

/// Demo builds carry no signalling stack, so every offer is refused.
struct NoSignallingBridge;

impl PeerBridge for NoSignallingBridge {
    fn accept_offer(
        &self,
        offer: &SdpOffer,
        _streams: &[CodecParameters],
    ) -> anyhow::Result<Box<dyn PeerSink>> {
        bail!("no webrtc stack in this build (offer from {})", offer.peer_id)
    }
}

/// Stand-in for the mp4 muxer: dumps length-prefixed packet payloads.
/// Segments materialize under their final name only when finished.
struct RawSegmentSink;

struct RawSegmentWriter {
    file: File,
    part_path: PathBuf,
    final_path: PathBuf,
}

impl ContainerSink for RawSegmentSink {
    fn create(
        &self,
        dir: &Path,
        _streams: &[CodecParameters],
    ) -> anyhow::Result<Box<dyn ContainerWriter>> {
        let stem = format!("{}", Utc::now().timestamp_micros());
        let final_path = dir.join(format!("{stem}.mp4"));
        let part_path = dir.join(format!("{stem}.mp4.part"));
        let file = File::create(&part_path)
            .with_context(|| format!("creating segment {}", part_path.display()))?;
        Ok(Box::new(RawSegmentWriter {
            file,
            part_path,
            final_path,
        }))
    }
}

impl ContainerWriter for RawSegmentWriter {
    fn write_packet(&mut self, packet: &Packet) -> anyhow::Result<()> {
        let len = packet.data.len() as u32;
        self.file.write_all(&len.to_le_bytes())?;
        self.file.write_all(&packet.data)?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> anyhow::Result<PathBuf> {
        self.file.sync_all()?;
        std::fs::rename(&self.part_path, &self.final_path)
            .with_context(|| format!("finalizing segment {}", self.final_path.display()))?;
        Ok(self.final_path)
    }
}

/// Logs instead of POSTing to a hub.
struct LogCloud;

impl CloudClient for LogCloud {
    fn send_heartbeat(&self, status: &StatusPayload) -> anyhow::Result<()> {
        info!(
            agent = %status.agent,
            uptime_secs = status.uptime_secs,
            packets = status.packets,
            "would send heartbeat"
        );
        Ok(())
    }

    fn upload_recording(&self, path: &Path) -> anyhow::Result<()> {
        info!(path = %path.display(), "would upload recording");
        Ok(())
    }
}

/// Logs PTZ traffic instead of speaking ONVIF.
struct LogCameraControl;

impl CameraControl for LogCameraControl {
    fn apply(&self, action: &OnvifAction) -> anyhow::Result<()> {
        info!(action = %action.action, "would apply onvif action");
        Ok(())
    }
}
