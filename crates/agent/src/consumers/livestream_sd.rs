//! Low-resolution livestream consumer.
//!
//! The cloud requests a still by dropping a ticket on the SD channel; the
//! consumer answers with the most recent keyframe it has seen, decoded,
//! downsampled to half resolution and handed to the publisher. Between
//! tickets it just keeps its view of the stream fresh.

use std::thread;

use crossbeam_channel::{Receiver, TryRecvError};
use media::Frame;
use packet_queue::{Cursor, Packet, RecvTimeoutError};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::consumers::{decode_packet, CURSOR_POLL};
use crate::hub::DecoderSlot;
use crate::telemetry;

/// Publisher side of the bi-directional broker connection (MQTT in
/// production). `disconnect` is called once at drain.
pub trait FramePublisher: Send + Sync {
    fn publish_frame(&self, frame: &Frame) -> anyhow::Result<()>;
    fn disconnect(&self);
}

pub(crate) fn spawn_livestream_sd(
    mut cursor: Cursor,
    video_index: usize,
    slot: DecoderSlot,
    publisher: Arc<dyn FramePublisher>,
    tickets: Receiver<i64>,
) -> thread::JoinHandle<()> {
    telemetry::spawn_thread("livestream-sd", move || {
        let mut last_key: Option<Packet> = None;
        loop {
            match cursor.next_timeout(CURSOR_POLL) {
                Ok(packet) => {
                    if packet.stream_index == video_index && packet.is_keyframe {
                        last_key = Some(packet);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Lagged) => {
                    cursor.seek_oldest();
                    continue;
                }
                Err(RecvTimeoutError::Closed) => break,
            }

            loop {
                match tickets.try_recv() {
                    Ok(_requested_at) => {
                        let Some(key) = &last_key else {
                            debug!("livestream ticket before any keyframe, ignoring");
                            continue;
                        };
                        let Some(frame) = decode_packet(&slot, key) else {
                            continue;
                        };
                        let preview = downsample_half(&frame);
                        match publisher.publish_frame(&preview) {
                            Ok(()) => {
                                metrics::counter!("agent_livestream_sd_frames_total").increment(1)
                            }
                            Err(err) => warn!(error = %err, "failed to publish livestream frame"),
                        }
                    }
                    // Disconnected just means no further tickets this run;
                    // keep draining the cursor until the queue closes.
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }
        }
        debug!("livestream-sd consumer finished");
    })
    .expect("failed to spawn livestream-sd thread")
}

/// Nearest-neighbour half-resolution downsample, enough for a preview still.
pub(crate) fn downsample_half(frame: &Frame) -> Frame {
    let bpp = frame.format.bytes_per_pixel();
    let (w, h) = (frame.width.max(0) as usize, frame.height.max(0) as usize);
    if frame.data.len() != w * h * bpp {
        warn!(
            len = frame.data.len(),
            width = frame.width,
            height = frame.height,
            "frame buffer does not match its dimensions, publishing as-is"
        );
        return frame.clone();
    }

    let out_w = (w / 2).max(1);
    let out_h = (h / 2).max(1);
    let mut data = Vec::with_capacity(out_w * out_h * bpp);
    for y in 0..out_h {
        let src_y = (y * 2).min(h - 1);
        for x in 0..out_w {
            let src_x = (x * 2).min(w - 1);
            let offset = (src_y * w + src_x) * bpp;
            data.extend_from_slice(&frame.data[offset..offset + bpp]);
        }
    }

    Frame {
        data,
        width: out_w as i32,
        height: out_h as i32,
        format: frame.format,
        timestamp_ms: frame.timestamp_ms,
    }
}
