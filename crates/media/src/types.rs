//! Frame and error types shared by media backends.

use anyhow::Error;
use thiserror::Error;

/// Raw decoded frame produced by a [`crate::VideoDecoder`].
#[derive(Clone, Debug)]
pub struct Frame {
    /// Pixel buffer in the layout declared by [`Frame::format`].
    pub data: Vec<u8>,
    /// Frame width in pixels.
    pub width: i32,
    /// Frame height in pixels.
    pub height: i32,
    /// Format descriptor explaining how to interpret [`Frame::data`].
    pub format: FrameFormat,
    /// Capture timestamp in milliseconds.
    pub timestamp_ms: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Supported pixel formats emitted by decoders.
pub enum FrameFormat {
    /// Single-channel luminance, 1 byte per pixel.
    Gray8,
    /// Packed BGR, 3 bytes per pixel.
    Bgr8,
}

impl FrameFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::Gray8 => 1,
            FrameFormat::Bgr8 => 3,
        }
    }
}

#[derive(Debug, Error)]
/// Errors surfaced while opening or reading a stream.
pub enum DemuxError {
    /// The stream ended normally.
    #[error("end of stream")]
    Eof,
    /// The demuxer was closed from another thread.
    #[error("demuxer closed")]
    Closed,
    #[error(transparent)]
    Other(#[from] Error),
}

#[derive(Debug, Error)]
/// Errors surfaced while constructing or driving a decoder.
pub enum DecodeError {
    #[error("decoder is closed")]
    Closed,
    #[error(transparent)]
    Other(#[from] Error),
}
