//! Shared data types exposed by the packet log.

use bytes::Bytes;

/// Framed unit received from a demuxer. Immutable once appended.
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    /// Index of the substream this packet belongs to.
    pub stream_index: usize,
    /// Compressed payload bytes, shared across cursors without copying.
    pub data: Bytes,
    /// Presentation timestamp in stream time base units.
    pub pts: i64,
    /// Decode timestamp in stream time base units.
    pub dts: i64,
    /// Keyframes mark GOP boundaries.
    pub is_keyframe: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Substream category reported by the demuxer.
pub enum MediaKind {
    Video,
    Audio,
}

/// Codec descriptor for one substream, captured at demuxer open time.
///
/// `width`, `height` and the framerate ratio are zero for audio streams.
#[derive(Clone, Debug, PartialEq)]
pub struct CodecParameters {
    pub kind: MediaKind,
    /// Codec identifier, e.g. `"h264"`.
    pub codec: String,
    pub width: i32,
    pub height: i32,
    pub fps_num: i32,
    pub fps_den: i32,
}

/// Returns the first video substream and its index, if any.
pub fn video_stream(streams: &[CodecParameters]) -> Option<(usize, &CodecParameters)> {
    streams
        .iter()
        .enumerate()
        .find(|(_, s)| s.kind == MediaKind::Video)
}
