//! Cached camera parameters and the decoder-rebuild decision.

use packet_queue::CodecParameters;

/// Stream parameters observed while opening a run.
pub struct ObservedStream<'a> {
    pub rtsp: &'a str,
    pub sub_rtsp: &'a str,
    pub video: &'a CodecParameters,
}

/// Camera parameters cached across runs. Mutated only by [`refresh`] so the
/// supervisor can keep decoders alive when nothing changed.
///
/// [`refresh`]: CameraSettings::refresh
#[derive(Clone, Debug, Default)]
pub struct CameraSettings {
    pub rtsp: String,
    pub sub_rtsp: String,
    pub width: i32,
    pub height: i32,
    pub fps_num: i32,
    pub fps_den: i32,
    pub codec: String,
    pub initialized: bool,
}

impl CameraSettings {
    /// Compares the observed parameters against the cache. On any change the
    /// cache is updated in place (marking it initialized) and `true` is
    /// returned: the caller must rebuild the decoders.
    pub fn refresh(&mut self, observed: &ObservedStream<'_>) -> bool {
        let video = observed.video;
        let changed = self.rtsp != observed.rtsp
            || self.sub_rtsp != observed.sub_rtsp
            || self.width != video.width
            || self.height != video.height
            || self.fps_num != video.fps_num
            || self.fps_den != video.fps_den
            || self.codec != video.codec;

        if changed {
            self.rtsp = observed.rtsp.to_string();
            self.sub_rtsp = observed.sub_rtsp.to_string();
            self.width = video.width;
            self.height = video.height;
            self.fps_num = video.fps_num;
            self.fps_den = video.fps_den;
            self.codec = video.codec.clone();
            self.initialized = true;
        }
        changed
    }
}
