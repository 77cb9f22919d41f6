//! Deterministic simulated camera.
//!
//! `sim://` URLs resolve to this backend: a paced packet generator with a
//! fixed GOP cadence, plus script hooks for the failure modes the supervisor
//! has to survive (connect refusals, mid-stream stalls, EOF). Counters for
//! opens and decoder builds/closes let tests assert the supervisor's
//! scarce-resource discipline without touching real hardware.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use bytes::Bytes;
use chrono::Utc;
use packet_queue::{video_stream, CodecParameters, MediaKind, Packet};
use tracing::debug;

use crate::types::{DecodeError, DemuxError, Frame, FrameFormat};
use crate::{Demuxer, MediaSource, OpenedStream, VideoDecoder};

const TIMEBASE_HZ: i64 = 90_000;

/// Camera parameters captured by each connection at open time.
#[derive(Clone, Debug)]
pub struct SimCameraConfig {
    pub width: i32,
    pub height: i32,
    pub fps_num: i32,
    pub fps_den: i32,
    pub codec: String,
    /// Packets per GOP; the first packet of every connection is a keyframe.
    pub gop_size: u64,
    /// Pacing between packets. Tests compress this to keep scenarios fast.
    pub frame_interval: Duration,
    /// How long every connection attempt takes to answer, simulating a
    /// camera that is slow to negotiate.
    pub open_delay: Duration,
    /// The first connection blocks (without EOF) after this many packets,
    /// simulating a camera that went silent. Later connections flow freely.
    pub stall_first_open_after: Option<u64>,
    /// Every connection returns EOF after this many packets.
    pub eof_after: Option<u64>,
}

impl Default for SimCameraConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps_num: 25,
            fps_den: 1,
            codec: "h264".into(),
            gop_size: 12,
            frame_interval: Duration::from_millis(40),
            open_delay: Duration::ZERO,
            stall_first_open_after: None,
            eof_after: None,
        }
    }
}

#[derive(Default)]
struct SimCounters {
    opens: AtomicUsize,
    decoder_builds: AtomicUsize,
    decoder_closes: AtomicUsize,
}

/// Scripted [`MediaSource`] backing demo runs and the lifecycle tests.
pub struct SimSource {
    config: Mutex<SimCameraConfig>,
    counters: Arc<SimCounters>,
    /// Connect attempts left to refuse before opens succeed again.
    fail_opens: AtomicU32,
    /// Global frame sequence, shared by every connection so timestamps keep
    /// increasing across restarts like a live camera's.
    sequence: Arc<AtomicU64>,
}

impl SimSource {
    pub fn new(config: SimCameraConfig) -> Self {
        Self {
            config: Mutex::new(config),
            counters: Arc::new(SimCounters::default()),
            fail_opens: AtomicU32::new(0),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Applies on the next connection, like changing the camera's profile
    /// from its admin page.
    pub fn set_resolution(&self, width: i32, height: i32) {
        let mut cfg = self.lock_config();
        cfg.width = width;
        cfg.height = height;
    }

    /// Refuses the next `count` connection attempts.
    pub fn fail_next_opens(&self, count: u32) {
        self.fail_opens.store(count, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    pub fn decoder_builds(&self) -> usize {
        self.counters.decoder_builds.load(Ordering::SeqCst)
    }

    pub fn decoder_closes(&self) -> usize {
        self.counters.decoder_closes.load(Ordering::SeqCst)
    }

    fn lock_config(&self) -> MutexGuard<'_, SimCameraConfig> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MediaSource for SimSource {
    fn open(&self, url: &str) -> Result<OpenedStream, DemuxError> {
        if self
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DemuxError::Other(anyhow!(
                "simulated connect failure for {url}"
            )));
        }

        let cfg = self.lock_config().clone();
        if !cfg.open_delay.is_zero() {
            thread::sleep(cfg.open_delay);
        }
        let open_index = self.counters.opens.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(url, open_index, width = cfg.width, height = cfg.height, "sim camera connected");

        let streams = vec![CodecParameters {
            kind: MediaKind::Video,
            codec: cfg.codec.clone(),
            width: cfg.width,
            height: cfg.height,
            fps_num: cfg.fps_num,
            fps_den: cfg.fps_den,
        }];

        let stall_after = if open_index == 1 {
            cfg.stall_first_open_after
        } else {
            None
        };

        Ok(OpenedStream {
            demuxer: Arc::new(SimDemuxer {
                interval: cfg.frame_interval,
                gop_size: cfg.gop_size.max(1),
                ticks_per_frame: TIMEBASE_HZ * cfg.fps_den as i64 / cfg.fps_num.max(1) as i64,
                stall_after,
                eof_after: cfg.eof_after,
                sequence: Arc::clone(&self.sequence),
                state: Mutex::new(DemuxState {
                    closed: false,
                    emitted: 0,
                }),
                wakeup: Condvar::new(),
            }),
            streams,
        })
    }

    fn new_decoder(&self, streams: &[CodecParameters]) -> Result<Box<dyn VideoDecoder>, DecodeError> {
        let video = video_stream(streams)
            .ok_or_else(|| DecodeError::Other(anyhow!("no video substream to decode")))?
            .1;
        self.counters.decoder_builds.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimDecoder {
            width: video.width,
            height: video.height,
            closed: false,
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct DemuxState {
    closed: bool,
    emitted: u64,
}

/// One simulated camera connection.
pub struct SimDemuxer {
    interval: Duration,
    gop_size: u64,
    ticks_per_frame: i64,
    stall_after: Option<u64>,
    eof_after: Option<u64>,
    sequence: Arc<AtomicU64>,
    state: Mutex<DemuxState>,
    wakeup: Condvar,
}

impl SimDemuxer {
    fn lock_state(&self) -> MutexGuard<'_, DemuxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Demuxer for SimDemuxer {
    fn read_packet(&self) -> Result<Packet, DemuxError> {
        let mut st = self.lock_state();

        loop {
            if st.closed {
                return Err(DemuxError::Closed);
            }
            if self.eof_after.is_some_and(|n| st.emitted >= n) {
                return Err(DemuxError::Eof);
            }
            if self.stall_after.is_some_and(|n| st.emitted >= n) {
                // Camera went silent: block until the supervisor closes us.
                st = self
                    .wakeup
                    .wait(st)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            }
            break;
        }

        // Pace one frame interval, abortable by close().
        let deadline = Instant::now() + self.interval;
        loop {
            if st.closed {
                return Err(DemuxError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .wakeup
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            st = guard;
        }

        let is_keyframe = st.emitted % self.gop_size == 0;
        st.emitted += 1;
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) as i64;
        let ts = seq * self.ticks_per_frame;
        let payload_len = if is_keyframe { 256 } else { 64 };

        Ok(Packet {
            stream_index: 0,
            data: Bytes::from(vec![seq as u8; payload_len]),
            pts: ts,
            dts: ts,
            is_keyframe,
        })
    }

    fn close(&self) {
        let mut st = self.lock_state();
        st.closed = true;
        drop(st);
        self.wakeup.notify_all();
    }
}

struct SimDecoder {
    width: i32,
    height: i32,
    closed: bool,
    counters: Arc<SimCounters>,
}

impl VideoDecoder for SimDecoder {
    fn decode(&mut self, packet: &Packet) -> Result<Option<Frame>, DecodeError> {
        if self.closed {
            return Err(DecodeError::Closed);
        }
        if !packet.is_keyframe {
            return Ok(None);
        }
        let luma = (packet.dts % 251) as u8;
        Ok(Some(Frame {
            data: vec![luma; (self.width * self.height).max(0) as usize],
            width: self.width,
            height: self.height,
            format: FrameFormat::Gray8,
            timestamp_ms: Utc::now().timestamp_millis(),
        }))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.counters.decoder_closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}
