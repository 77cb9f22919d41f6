//! Media ingest seams consumed by the agent core.
//!
//! The RTSP demuxer and the video decoder are external collaborators: this
//! crate defines the traits the pipeline talks to ([`MediaSource`],
//! [`Demuxer`], [`VideoDecoder`]) and ships one in-tree backend, the
//! deterministic simulated camera in [`sim`], which backs `sim://` demo runs
//! and every end-to-end test. Real camera backends implement the same traits
//! at integration time.

pub mod sim;
mod types;

use std::sync::Arc;

use packet_queue::{CodecParameters, Packet};

pub use types::{DecodeError, DemuxError, Frame, FrameFormat};

/// A connected stream: the pull handle plus the codec descriptors reported
/// at open time.
pub struct OpenedStream {
    pub demuxer: Arc<dyn Demuxer>,
    pub streams: Vec<CodecParameters>,
}

/// Factory for demuxers and decoders, selected once at startup.
pub trait MediaSource: Send + Sync {
    /// Connects to `url` and negotiates the stream layout.
    fn open(&self, url: &str) -> Result<OpenedStream, DemuxError>;

    /// Builds a decoder for the video substream described by `streams`.
    fn new_decoder(&self, streams: &[CodecParameters]) -> Result<Box<dyn VideoDecoder>, DecodeError>;
}

/// Pull-based packet source.
///
/// `read_packet` may block on I/O; `close` must unblock any in-flight read,
/// which then returns [`DemuxError::Closed`]. This is the supervisor's
/// cancellation lever for readers stuck in a blocking call.
pub trait Demuxer: Send + Sync {
    fn read_packet(&self) -> Result<Packet, DemuxError>;
    fn close(&self);
}

/// Scarce, non-reentrant decoder. Callers serialize access externally; the
/// agent guards each decoder with its own mutex.
pub trait VideoDecoder: Send {
    /// Decodes one packet. `Ok(None)` means the decoder consumed the packet
    /// without producing a frame (reference data, drops).
    fn decode(&mut self, packet: &Packet) -> Result<Option<Frame>, DecodeError>;

    /// Releases native resources. Further decodes are an error.
    fn close(&mut self);
}
