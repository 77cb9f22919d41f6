//! GOP-bounded packet log shared between one stream reader and many
//! consumers.
//!
//! A [`Queue`] retains the most recent group-of-pictures blocks and hands out
//! independent [`Cursor`]s so that motion detection, livestreaming and
//! recording can each walk the backlog at their own pace. Retention always
//! trims whole GOPs, so every readable prefix starts at a keyframe and a
//! consumer can begin decoding from any position a cursor will ever report.

mod queue;
mod types;

pub use queue::{Cursor, Queue, QueueError, RecvError, RecvTimeoutError};
pub use types::{video_stream, CodecParameters, MediaKind, Packet};
