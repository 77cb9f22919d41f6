//! Disk recording consumer.
//!
//! Reads the main cursor from the oldest retained keyframe and writes whole
//! GOPs through the container collaborator, so every segment opens on a
//! keyframe and survives being cut at any rotation point. Two modes:
//! continuous recording rotates segments by duration (or on a motion event),
//! motion-triggered recording keeps a pre-recording buffer of GOPs and only
//! touches disk while events keep the window open.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use packet_queue::{CodecParameters, Cursor, Packet, RecvTimeoutError};
use tracing::{debug, info, warn};

use crate::consumers::CURSOR_POLL;
use crate::hub::MotionEvent;
use crate::telemetry;

/// Container writer factory (the mp4 muxer in production).
pub trait ContainerSink: Send + Sync {
    /// Opens a new segment in `dir`. The finished file must only appear at
    /// its final path once [`ContainerWriter::finish`] returns, so the
    /// uploader never sees partial segments.
    fn create(
        &self,
        dir: &Path,
        streams: &[CodecParameters],
    ) -> anyhow::Result<Box<dyn ContainerWriter>>;
}

pub trait ContainerWriter: Send {
    fn write_packet(&mut self, packet: &Packet) -> anyhow::Result<()>;
    /// Finalizes the segment and returns its path.
    fn finish(self: Box<Self>) -> anyhow::Result<PathBuf>;
}

pub(crate) struct RecorderConfig {
    pub dir: PathBuf,
    pub continuous: bool,
    pub max_length: Duration,
    pub post_recording: Duration,
    /// GOPs buffered ahead of a motion event.
    pub pre_recording_gops: usize,
}

pub(crate) fn spawn_recorder(
    cursor: Cursor,
    streams: Arc<Vec<CodecParameters>>,
    sink: Arc<dyn ContainerSink>,
    motion: Receiver<MotionEvent>,
    config: RecorderConfig,
) -> thread::JoinHandle<()> {
    telemetry::spawn_thread("recorder", move || {
        if let Err(err) = std::fs::create_dir_all(&config.dir) {
            warn!(dir = %config.dir.display(), error = %err, "cannot create recordings directory");
        }
        let mut recorder = Recorder {
            streams,
            sink,
            config,
            writer: None,
            segment_started: Instant::now(),
            rotate_requested: false,
            record_until: None,
            backlog: VecDeque::new(),
        };
        recorder.run(cursor, motion);
        debug!("recorder finished");
    })
    .expect("failed to spawn recorder thread")
}

struct Recorder {
    streams: Arc<Vec<CodecParameters>>,
    sink: Arc<dyn ContainerSink>,
    config: RecorderConfig,
    writer: Option<Box<dyn ContainerWriter>>,
    segment_started: Instant,
    rotate_requested: bool,
    /// Motion mode: deadline until which GOPs are committed to disk.
    record_until: Option<Instant>,
    /// Motion mode: complete GOPs held back for the pre-recording window.
    backlog: VecDeque<Vec<Packet>>,
}

impl Recorder {
    fn run(&mut self, mut cursor: Cursor, motion: Receiver<MotionEvent>) {
        // GOP currently being assembled from the cursor.
        let mut pending: Vec<Packet> = Vec::new();
        loop {
            while let Ok(event) = motion.try_recv() {
                self.on_motion(&event);
            }

            match cursor.next_timeout(CURSOR_POLL) {
                Ok(packet) => {
                    if packet.is_keyframe && !pending.is_empty() {
                        let gop = std::mem::take(&mut pending);
                        self.on_complete_gop(gop);
                    }
                    if packet.is_keyframe || !pending.is_empty() {
                        pending.push(packet);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Lagged) => {
                    metrics::counter!("agent_cursor_lagged_total", "consumer" => "recorder")
                        .increment(1);
                    pending.clear();
                    cursor.seek_oldest();
                }
                Err(RecvTimeoutError::Closed) => break,
            }
        }
        // Whatever is still pending is an incomplete GOP and never hits
        // disk; the segment ends on the last complete one.
        self.finish_segment();
    }

    fn on_motion(&mut self, event: &MotionEvent) {
        if self.config.continuous {
            // Event rotation: cut the running segment at the next GOP
            // boundary so the event sits at the head of a fresh file.
            self.rotate_requested = true;
        } else {
            debug!(pixels = event.pixels_changed, "motion event opens recording window");
            self.record_until = Some(Instant::now() + self.config.post_recording);
        }
    }

    fn on_complete_gop(&mut self, gop: Vec<Packet>) {
        if self.config.continuous {
            self.write_gop(gop);
            if self.rotate_requested || self.segment_started.elapsed() >= self.config.max_length {
                self.rotate_requested = false;
                self.finish_segment();
            }
            return;
        }

        self.backlog.push_back(gop);
        let recording = self
            .record_until
            .map(|deadline| Instant::now() < deadline)
            .unwrap_or(false);
        if recording {
            while let Some(buffered) = self.backlog.pop_front() {
                self.write_gop(buffered);
            }
        } else {
            if self.writer.is_some() {
                self.finish_segment();
                self.record_until = None;
            }
            while self.backlog.len() > self.config.pre_recording_gops {
                self.backlog.pop_front();
            }
        }
    }

    fn write_gop(&mut self, gop: Vec<Packet>) {
        if self.writer.is_none() {
            match self.sink.create(&self.config.dir, &self.streams) {
                Ok(writer) => {
                    self.writer = Some(writer);
                    self.segment_started = Instant::now();
                }
                Err(err) => {
                    warn!(error = %err, "cannot open recording segment, dropping GOP");
                    return;
                }
            }
        }
        if let Some(writer) = self.writer.as_mut() {
            for packet in gop {
                if let Err(err) = writer.write_packet(&packet) {
                    warn!(error = %err, "write failed, abandoning segment");
                    self.writer = None;
                    return;
                }
            }
        }
    }

    fn finish_segment(&mut self) {
        if let Some(writer) = self.writer.take() {
            match writer.finish() {
                Ok(path) => {
                    info!(path = %path.display(), "recording segment finished");
                    metrics::counter!("agent_recordings_total").increment(1);
                }
                Err(err) => warn!(error = %err, "failed to finalize recording segment"),
            }
        }
    }
}
