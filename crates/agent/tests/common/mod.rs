//! Fake collaborators and helpers shared by the lifecycle scenarios.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use agent::consumers::{
    CameraControl, CloudClient, ContainerSink, ContainerWriter, FramePublisher, MotionDetector,
    PeerBridge, PeerSink, StatusPayload,
};
use agent::{Collaborators, MotionEvent, OnvifAction, SdpOffer, Timing};
use chrono::Utc;
use media::Frame;
use packet_queue::{CodecParameters, Packet};

/// Production timings compressed to keep every scenario under a second or
/// two of wall clock.
pub fn fast_timing() -> Timing {
    Timing {
        signal_grace: Duration::from_millis(40),
        open_backoff: Duration::from_millis(60),
        liveness_tick: Duration::from_millis(40),
        liveness_hold: Duration::from_millis(20),
        config_retry: Duration::from_millis(50),
        upload_poll: Duration::from_millis(20),
        keepalive_timeout: Duration::from_secs(30),
    }
}

/// Writes an agent configuration into `dir` and returns its path.
pub fn write_config(dir: &Path, value: serde_json::Value) -> PathBuf {
    let path = dir.join("agent.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&value).unwrap()).unwrap();
    path
}

/// Polls `probe` until it returns true or the deadline passes.
pub fn wait_for(timeout: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if probe() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

#[derive(Default)]
pub struct StubMotion {
    pub fire: bool,
}

impl MotionDetector for StubMotion {
    fn detect(&self, _frame: &Frame) -> Option<MotionEvent> {
        self.fire.then(|| MotionEvent {
            timestamp: Utc::now().timestamp(),
            pixels_changed: 42,
        })
    }
}

#[derive(Default)]
pub struct NullPublisher {
    pub frames: AtomicUsize,
    pub disconnects: AtomicUsize,
}

impl FramePublisher for NullPublisher {
    fn publish_frame(&self, _frame: &Frame) -> anyhow::Result<()> {
        self.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct NullBridge;

impl PeerBridge for NullBridge {
    fn accept_offer(
        &self,
        _offer: &SdpOffer,
        _streams: &[CodecParameters],
    ) -> anyhow::Result<Box<dyn PeerSink>> {
        anyhow::bail!("no webrtc in tests")
    }
}

/// Collects finished segments in memory and, when given a directory,
/// also materializes a small file per segment for the uploader to find.
#[derive(Default)]
pub struct MemorySink {
    pub segments: Arc<Mutex<Vec<Vec<Packet>>>>,
    write_files_to: Option<PathBuf>,
    counter: AtomicUsize,
}

impl MemorySink {
    /// A sink that also materializes one small file per finished segment,
    /// so the uploader has something to find.
    pub fn writing_to(dir: PathBuf) -> Self {
        Self {
            write_files_to: Some(dir),
            ..Self::default()
        }
    }
}

struct MemoryWriter {
    packets: Vec<Packet>,
    segments: Arc<Mutex<Vec<Vec<Packet>>>>,
    file_path: Option<PathBuf>,
}

impl ContainerSink for MemorySink {
    fn create(
        &self,
        _dir: &Path,
        _streams: &[CodecParameters],
    ) -> anyhow::Result<Box<dyn ContainerWriter>> {
        let file_path = self.write_files_to.as_ref().map(|dir| {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            dir.join(format!("{n:04}.mp4"))
        });
        Ok(Box::new(MemoryWriter {
            packets: Vec::new(),
            segments: Arc::clone(&self.segments),
            file_path,
        }))
    }
}

impl ContainerWriter for MemoryWriter {
    fn write_packet(&mut self, packet: &Packet) -> anyhow::Result<()> {
        self.packets.push(packet.clone());
        Ok(())
    }

    fn finish(self: Box<Self>) -> anyhow::Result<PathBuf> {
        let path = match &self.file_path {
            Some(path) => {
                std::fs::write(path, b"segment")?;
                path.clone()
            }
            None => PathBuf::from("segment.mp4"),
        };
        self.segments.lock().unwrap().push(self.packets);
        Ok(path)
    }
}

#[derive(Default)]
pub struct MemoryCloud {
    pub heartbeats: AtomicUsize,
    pub uploads: Mutex<Vec<PathBuf>>,
}

impl CloudClient for MemoryCloud {
    fn send_heartbeat(&self, _status: &StatusPayload) -> anyhow::Result<()> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn upload_recording(&self, path: &Path) -> anyhow::Result<()> {
        self.uploads.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }
}

pub struct NullCamera;

impl CameraControl for NullCamera {
    fn apply(&self, _action: &OnvifAction) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct TestCollaborators {
    pub publisher: Arc<NullPublisher>,
    pub sink: Arc<MemorySink>,
    pub cloud: Arc<MemoryCloud>,
}

/// A collaborator set built from the fakes above, returning the handles the
/// scenarios assert against.
pub fn collaborators(fire_motion: bool, sink: MemorySink) -> (Collaborators, TestCollaborators) {
    let publisher = Arc::new(NullPublisher::default());
    let sink = Arc::new(sink);
    let cloud = Arc::new(MemoryCloud::default());
    let set = Collaborators {
        motion: Arc::new(StubMotion { fire: fire_motion }),
        publisher: Arc::clone(&publisher) as Arc<dyn FramePublisher>,
        webrtc: Arc::new(NullBridge),
        recordings: Arc::clone(&sink) as Arc<dyn ContainerSink>,
        cloud: Arc::clone(&cloud) as Arc<dyn CloudClient>,
        camera: Arc::new(NullCamera),
    };
    (
        set,
        TestCollaborators {
            publisher,
            sink,
            cloud,
        },
    )
}
