//! Shared state for one agent process.
//!
//! The hub is deliberately partitioned instead of a single mutable object:
//! an atomic counter bundle with process lifetime, process-lifetime decoder
//! slots and the bootstrap channel, and a run-scoped channel registry that
//! the supervisor allocates fresh for every run and hands to workers at
//! spawn. Consumers never allocate channels.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, Sender};
use media::VideoDecoder;
use packet_queue::Queue;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// Control vocabulary understood by the supervisor's bootstrap channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapSignal {
    /// Tear the run down and bring it back up with a fresh configuration.
    Restart,
    /// Tear the run down and exit the process.
    Stop,
    /// A configuration surface changed settings; behaves like a restart.
    Reconfigure,
}

impl BootstrapSignal {
    /// Parses the wire vocabulary. Unknown strings are ignored by returning
    /// `None` rather than guessing.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "restart" => Some(Self::Restart),
            "stop" => Some(Self::Stop),
            _ => None,
        }
    }
}

/// The only message worker control channels carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerSignal {
    Stop,
}

/// Liveness and cloud bookkeeping shared by every worker. Lives for the
/// whole process so restarts never reset the packet counter.
#[derive(Debug, Default)]
pub struct Counters {
    packets: AtomicI64,
    last_packet_ts: AtomicI64,
    cloud_ts: AtomicI64,
}

impl Counters {
    /// Called by stream readers for every packet appended to a queue.
    pub fn record_packet(&self) {
        self.packets.fetch_add(1, Ordering::SeqCst);
        self.last_packet_ts
            .store(Utc::now().timestamp(), Ordering::SeqCst);
    }

    /// Monotone count of packets read since process start.
    pub fn packets(&self) -> i64 {
        self.packets.load(Ordering::SeqCst)
    }

    /// Unix seconds of the most recent packet, zero before the first.
    pub fn last_packet_ts(&self) -> i64 {
        self.last_packet_ts.load(Ordering::SeqCst)
    }

    /// Called after any successful cloud round-trip.
    pub fn touch_cloud(&self) {
        self.cloud_ts.store(Utc::now().timestamp(), Ordering::SeqCst);
    }

    /// Unix seconds of the last successful cloud round-trip, zero before the
    /// first.
    pub fn cloud_ts(&self) -> i64 {
        self.cloud_ts.load(Ordering::SeqCst)
    }
}

/// A decoder and its serialization mutex are one object: locking the slot is
/// the only way to reach the decoder, so a decode can never run against the
/// wrong mutex.
pub type DecoderSlot = Arc<Mutex<Option<Box<dyn VideoDecoder>>>>;

pub(crate) fn lock_decoder(slot: &DecoderSlot) -> MutexGuard<'_, Option<Box<dyn VideoDecoder>>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Senders for the run-scoped request and fan-in channels, published on the
/// hub so external control surfaces (broker router, signalling endpoint)
/// can reach the consumers of the current run.
#[derive(Clone)]
pub struct RunControls {
    /// Livestream-SD request tickets (requested-at unix seconds).
    pub live_sd: Sender<i64>,
    /// Livestream-HD keepalives (unix seconds).
    pub live_hd_keepalive: Sender<i64>,
    /// Livestream-HD peer disconnect requests by peer id.
    pub live_hd_peers: Sender<String>,
    /// WebRTC session offers.
    pub sdp: Sender<SdpOffer>,
    /// PTZ and preset commands.
    pub onvif: Sender<OnvifAction>,
}

/// Process-lifetime shared state.
pub struct Hub {
    pub counters: Arc<Counters>,
    is_configuring: AtomicBool,
    bootstrap_tx: Sender<BootstrapSignal>,
    bootstrap_rx: Receiver<BootstrapSignal>,
    /// Main-stream decoder. Survives restarts when camera parameters are
    /// unchanged; rebuilding a codec on embedded hardware costs seconds.
    pub decoder: DecoderSlot,
    /// Substream decoder, empty while the substream path is disabled.
    pub sub_decoder: DecoderSlot,
    queue: Mutex<Option<Arc<Queue>>>,
    sub_queue: Mutex<Option<Arc<Queue>>>,
    controls: Mutex<Option<RunControls>>,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        let (bootstrap_tx, bootstrap_rx) = bounded(1);
        Arc::new(Self {
            counters: Arc::new(Counters::default()),
            is_configuring: AtomicBool::new(false),
            bootstrap_tx,
            bootstrap_rx,
            decoder: Arc::new(Mutex::new(None)),
            sub_decoder: Arc::new(Mutex::new(None)),
            queue: Mutex::new(None),
            sub_queue: Mutex::new(None),
            controls: Mutex::new(None),
        })
    }

    /// Sender half of the bootstrap channel, for control surfaces and the
    /// liveness controller. Sends should be best-effort (`try_send`): a
    /// pending signal already guarantees a restart.
    pub fn bootstrap_sender(&self) -> Sender<BootstrapSignal> {
        self.bootstrap_tx.clone()
    }

    pub(crate) fn bootstrap_receiver(&self) -> Receiver<BootstrapSignal> {
        self.bootstrap_rx.clone()
    }

    /// Entry point for raw control commands from an external plane (broker
    /// router, local API, signal handler). Accepts the wire vocabulary
    /// (`"restart"`, `"stop"`); anything else is ignored. Best-effort: a
    /// signal already pending makes a second one redundant.
    pub fn dispatch_command(&self, raw: &str) {
        match BootstrapSignal::parse(raw) {
            Some(signal) => {
                let _ = self.bootstrap_tx.try_send(signal);
            }
            None => debug!(command = raw, "ignoring unknown control command"),
        }
    }

    /// Called by a configuration surface after writing new settings to
    /// disk: pauses liveness escalation immediately (the stream is about to
    /// go quiet on purpose) and asks the supervisor to rebuild. The
    /// supervisor clears the flag once the new run is up.
    pub fn request_reconfigure(&self) {
        self.begin_configuration();
        let _ = self.bootstrap_tx.try_send(BootstrapSignal::Reconfigure);
    }

    /// Marks an external reconfiguration in progress; the liveness
    /// controller holds its stall count while set.
    pub fn begin_configuration(&self) {
        self.is_configuring.store(true, Ordering::SeqCst);
    }

    pub fn end_configuration(&self) {
        self.is_configuring.store(false, Ordering::SeqCst);
    }

    pub fn is_configuring(&self) -> bool {
        self.is_configuring.load(Ordering::SeqCst)
    }

    pub(crate) fn publish_queues(&self, queue: Arc<Queue>, sub_queue: Option<Arc<Queue>>) {
        *lock_slot(&self.queue) = Some(queue);
        *lock_slot(&self.sub_queue) = sub_queue;
    }

    pub(crate) fn clear_queues(&self) {
        lock_slot(&self.queue).take();
        lock_slot(&self.sub_queue).take();
    }

    pub(crate) fn publish_controls(&self, controls: RunControls) {
        *self
            .controls
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(controls);
    }

    pub(crate) fn clear_controls(&self) {
        self.controls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Control-channel senders of the current run, if one is up.
    pub fn controls(&self) -> Option<RunControls> {
        self.controls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The live main queue, present only while a run is up.
    pub fn queue(&self) -> Option<Arc<Queue>> {
        lock_slot(&self.queue).clone()
    }

    pub fn sub_queue(&self) -> Option<Arc<Queue>> {
        lock_slot(&self.sub_queue).clone()
    }
}

fn lock_slot(slot: &Mutex<Option<Arc<Queue>>>) -> MutexGuard<'_, Option<Arc<Queue>>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Positive motion detection emitted by the motion consumer.
#[derive(Clone, Debug, Serialize)]
pub struct MotionEvent {
    /// Unix seconds at detection time.
    pub timestamp: i64,
    /// How many pixels moved, as reported by the detector.
    pub pixels_changed: u64,
}

/// WebRTC session offer received from a signalling surface.
#[derive(Clone, Debug)]
pub struct SdpOffer {
    pub peer_id: String,
    pub sdp: String,
}

/// PTZ or preset command destined for the camera.
#[derive(Clone, Debug)]
pub struct OnvifAction {
    pub action: String,
    pub payload: Value,
}

/// Single-capacity control channel owned by the supervisor for one worker.
pub(crate) struct ControlChannel {
    tx: Sender<WorkerSignal>,
    rx: Receiver<WorkerSignal>,
}

impl ControlChannel {
    fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }

    /// Best-effort stop. A second stop while one is pending is dropped,
    /// and a worker that already exited is not an error.
    pub(crate) fn stop(&self) {
        let _ = self.tx.try_send(WorkerSignal::Stop);
    }

    pub(crate) fn receiver(&self) -> Receiver<WorkerSignal> {
        self.rx.clone()
    }
}

/// Channel registry for one run. Allocated by the supervisor at startup and
/// torn down with the run; workers only ever hold cloned endpoints.
pub(crate) struct RunChannels {
    pub(crate) stream: ControlChannel,
    pub(crate) sub_stream: ControlChannel,
    pub(crate) heartbeat: ControlChannel,
    pub(crate) upload: ControlChannel,
    /// Livestream-SD request tickets (requested-at unix seconds).
    pub(crate) live_sd_tx: Sender<i64>,
    pub(crate) live_sd_rx: Receiver<i64>,
    /// Livestream-HD keepalives (unix seconds).
    pub(crate) keepalive_tx: Sender<i64>,
    pub(crate) keepalive_rx: Receiver<i64>,
    /// Livestream-HD peer disconnect requests by peer id.
    pub(crate) peers_tx: Sender<String>,
    pub(crate) peers_rx: Receiver<String>,
    pub(crate) onvif_tx: Sender<OnvifAction>,
    pub(crate) onvif_rx: Receiver<OnvifAction>,
    pub(crate) sdp_tx: Sender<SdpOffer>,
    pub(crate) sdp_rx: Receiver<SdpOffer>,
    pub(crate) motion_tx: Sender<MotionEvent>,
    pub(crate) motion_rx: Receiver<MotionEvent>,
}

impl RunChannels {
    /// The sender surface published on the hub for this run.
    pub(crate) fn controls(&self) -> RunControls {
        RunControls {
            live_sd: self.live_sd_tx.clone(),
            live_hd_keepalive: self.keepalive_tx.clone(),
            live_hd_peers: self.peers_tx.clone(),
            sdp: self.sdp_tx.clone(),
            onvif: self.onvif_tx.clone(),
        }
    }

    pub(crate) fn new() -> Self {
        let (live_sd_tx, live_sd_rx) = bounded(1);
        let (keepalive_tx, keepalive_rx) = bounded(1);
        let (peers_tx, peers_rx) = bounded(1);
        let (onvif_tx, onvif_rx) = bounded(1);
        let (sdp_tx, sdp_rx) = bounded(1);
        let (motion_tx, motion_rx) = bounded(1);
        Self {
            stream: ControlChannel::new(),
            sub_stream: ControlChannel::new(),
            heartbeat: ControlChannel::new(),
            upload: ControlChannel::new(),
            live_sd_tx,
            live_sd_rx,
            keepalive_tx,
            keepalive_rx,
            peers_tx,
            peers_rx,
            onvif_tx,
            onvif_rx,
            sdp_tx,
            sdp_rx,
            motion_tx,
            motion_rx,
        }
    }
}
