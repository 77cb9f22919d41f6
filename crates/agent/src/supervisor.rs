//! The bootstrap / run / drain lifecycle.
//!
//! The supervisor is the only component that creates or destroys others. A
//! run brings up demuxers, queues, decoders and the full worker set, then
//! blocks on the bootstrap channel; any signal tears everything down on the
//! same path, and everything except a `stop` loops back into startup with a
//! freshly read configuration. Decoders deliberately survive restarts when
//! the camera parameters are unchanged.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use media::{MediaSource, OpenedStream};
use packet_queue::{video_stream, Queue};
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::consumers::livestream_hd::{self, PeerBridge, KEEPALIVE_TIMEOUT};
use crate::consumers::livestream_sd::{self, FramePublisher};
use crate::consumers::motion::{self, MotionDetector};
use crate::consumers::onvif::{self, CameraControl};
use crate::consumers::record::{self, ContainerSink, RecorderConfig};
use crate::consumers::{heartbeat, upload, CloudClient};
use crate::hub::{lock_decoder, BootstrapSignal, DecoderSlot, Hub, RunChannels};
use crate::liveness;
use crate::reader;
use crate::settings::{CameraSettings, ObservedStream};

/// Every duration the lifecycle sleeps or waits on, with the production
/// values as defaults. Tests compress these without changing semantics.
#[derive(Clone, Debug)]
pub struct Timing {
    /// Pause after stop signals so in-flight worker iterations observe them.
    pub signal_grace: Duration,
    /// Backoff before retrying startup after a failed stream open.
    pub open_backoff: Duration,
    /// Liveness sampling interval.
    pub liveness_tick: Duration,
    /// Pause after the liveness controller raises a restart.
    pub liveness_hold: Duration,
    /// Retry interval while the configuration file is unreadable.
    pub config_retry: Duration,
    /// Recordings directory scan interval.
    pub upload_poll: Duration,
    /// Livestream-HD keepalive expiry.
    pub keepalive_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            signal_grace: Duration::from_secs(1),
            open_backoff: Duration::from_secs(3),
            liveness_tick: Duration::from_secs(5),
            liveness_hold: Duration::from_secs(2),
            config_retry: Duration::from_secs(5),
            upload_poll: Duration::from_secs(5),
            keepalive_timeout: KEEPALIVE_TIMEOUT,
        }
    }
}

/// External collaborators the consumers talk to. The supervisor never looks
/// inside them; it only hands them to workers at spawn.
pub struct Collaborators {
    pub motion: Arc<dyn MotionDetector>,
    pub publisher: Arc<dyn FramePublisher>,
    pub webrtc: Arc<dyn PeerBridge>,
    pub recordings: Arc<dyn ContainerSink>,
    pub cloud: Arc<dyn CloudClient>,
    pub camera: Arc<dyn CameraControl>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Exit the bootstrap loop and the process.
    Stop,
    /// Re-read the configuration and bring a fresh run up.
    Restart,
}

/// Everything a single run owns. Dismantled piece by piece at drain.
struct RunState {
    main: OpenedStream,
    sub: Option<OpenedStream>,
    queue: Arc<Queue>,
    sub_queue: Option<Arc<Queue>>,
    channels: RunChannels,
    workers: Vec<JoinHandle<()>>,
}

pub struct Supervisor {
    config_path: PathBuf,
    hub: Arc<Hub>,
    source: Arc<dyn MediaSource>,
    collaborators: Collaborators,
    timing: Timing,
    settings: CameraSettings,
    uptime_start: Instant,
}

impl Supervisor {
    pub fn new(
        config_path: impl Into<PathBuf>,
        hub: Arc<Hub>,
        source: Arc<dyn MediaSource>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            config_path: config_path.into(),
            hub,
            source,
            collaborators,
            timing: Timing::default(),
            settings: CameraSettings::default(),
            uptime_start: Instant::now(),
        }
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Runs the agent until a stop signal arrives on the bootstrap channel.
    pub fn run(&mut self) -> Result<()> {
        debug!("bootstrap: started");
        // Detached on purpose: the controller outlives every run.
        let _liveness = liveness::spawn(
            Arc::clone(&self.hub),
            self.timing.liveness_tick,
            self.timing.liveness_hold,
        );

        loop {
            // Every startup begins by (re)reading the configuration from disk; an
            // operator may have changed it while we were draining.
            let config = AgentConfig::load_blocking(&self.config_path, self.timing.config_retry);
            match self.run_once(&config) {
                RunOutcome::Stop => break,
                RunOutcome::Restart => continue,
            }
        }
        debug!("bootstrap: finished");
        Ok(())
    }

    fn run_once(&mut self, config: &AgentConfig) -> RunOutcome {
        debug!("run: started");
        // Reopening the stream yields no packets until the camera answers,
        // which on embedded hardware can outlast the stall window. Hold the
        // liveness count for the whole startup so the restart in progress is
        // never doubled up.
        self.hub.begin_configuration();
        let run = self.init(config);
        self.hub.end_configuration();
        let run = match run {
            Ok(run) => run,
            Err(err) => {
                error!(error = %err, "failed to bring the run up");
                thread::sleep(self.timing.open_backoff);
                return RunOutcome::Restart;
            }
        };

        // The run phase never does work itself; it waits for someone to pull
        // the cord.
        let signal = self
            .hub
            .bootstrap_receiver()
            .recv()
            .unwrap_or(BootstrapSignal::Stop);
        info!(signal = ?signal, "control signal received, draining");
        let outcome = match signal {
            BootstrapSignal::Stop => RunOutcome::Stop,
            BootstrapSignal::Restart | BootstrapSignal::Reconfigure => RunOutcome::Restart,
        };

        self.drain(config, run);
        debug!("run: finished");
        outcome
    }

    /// Opens resources, reconciles decoders and spawns the worker set.
    /// Any failure closes whatever was already opened before returning.
    fn init(&mut self, config: &AgentConfig) -> Result<RunState> {
        let rtsp = config.capture.ipcamera.rtsp.as_str();
        info!(url = rtsp, "opening RTSP stream");
        let main = self.source.open(rtsp).context("opening RTSP stream")?;
        info!(url = rtsp, "opened RTSP stream");

        let sub = match config.sub_stream_url() {
            Some(url) => match self.source.open(url) {
                Ok(opened) if video_stream(&opened.streams).is_some() => {
                    info!(url, "opened RTSP sub stream");
                    Some(opened)
                }
                Ok(opened) => {
                    warn!(url, "sub stream reports no video, continuing without");
                    opened.demuxer.close();
                    None
                }
                Err(err) => {
                    warn!(url, error = %err, "failed to open RTSP sub stream, continuing without");
                    None
                }
            },
            None => None,
        };

        let Some((video_index, video)) = video_stream(&main.streams) else {
            close_streams(&main, &sub);
            bail!("stream reports no video substream");
        };

        // Decoders are scarce; rebuild them only when the camera changed.
        let observed = ObservedStream {
            rtsp,
            sub_rtsp: config.capture.ipcamera.sub_rtsp.as_str(),
            video,
        };
        let was_initialized = self.settings.initialized;
        if self.settings.refresh(&observed) {
            info!("camera settings changed, reloading decoders");
            if was_initialized {
                close_decoder(&self.hub.decoder);
                close_decoder(&self.hub.sub_decoder);
            }
            let decoder = match self.source.new_decoder(&main.streams) {
                Ok(decoder) => decoder,
                Err(err) => {
                    close_streams(&main, &sub);
                    return Err(err).context("constructing video decoder");
                }
            };
            *lock_decoder(&self.hub.decoder) = Some(decoder);
            if let Some(sub_opened) = &sub {
                match self.source.new_decoder(&sub_opened.streams) {
                    Ok(decoder) => *lock_decoder(&self.hub.sub_decoder) = Some(decoder),
                    Err(err) => {
                        close_streams(&main, &sub);
                        return Err(err).context("constructing sub stream decoder");
                    }
                }
            }
        } else {
            info!("camera settings did not change, keeping decoders");
        }

        let retention = config.retention_gops();
        let queue = Arc::new(Queue::new());
        queue.set_max_gop_count(retention);
        info!(gop_count = retention, "created packet queue");
        if let Err(err) = queue.write_header(main.streams.clone()) {
            close_streams(&main, &sub);
            return Err(err).context("writing stream header");
        }

        let sub_queue = match &sub {
            Some(sub_opened) => {
                let sub_queue = Arc::new(Queue::new());
                sub_queue.set_max_gop_count(1);
                if let Err(err) = sub_queue.write_header(sub_opened.streams.clone()) {
                    close_streams(&main, &sub);
                    return Err(err).context("writing sub stream header");
                }
                Some(sub_queue)
            }
            None => None,
        };

        self.hub
            .publish_queues(Arc::clone(&queue), sub_queue.clone());

        let channels = RunChannels::new();
        self.hub.publish_controls(channels.controls());
        let counters = Arc::clone(&self.hub.counters);
        let mut workers: Vec<JoinHandle<()>> = Vec::new();

        workers.push(reader::spawn_stream_reader(
            "stream",
            Arc::clone(&main.demuxer),
            Arc::clone(&queue),
            Arc::clone(&counters),
            channels.stream.receiver(),
        ));
        if let (Some(sub_opened), Some(sub_q)) = (&sub, &sub_queue) {
            workers.push(reader::spawn_stream_reader(
                "sub-stream",
                Arc::clone(&sub_opened.demuxer),
                Arc::clone(sub_q),
                Arc::clone(&counters),
                channels.sub_stream.receiver(),
            ));
        }

        // Motion and the SD livestream analyse the substream when there is
        // one; it shows the same scene at a fraction of the decode cost.
        let (analysis_queue, analysis_slot, analysis_index): (Arc<Queue>, DecoderSlot, usize) =
            match (&sub_queue, &sub) {
                (Some(sub_q), Some(sub_opened)) => (
                    Arc::clone(sub_q),
                    Arc::clone(&self.hub.sub_decoder),
                    video_stream(&sub_opened.streams).map(|(i, _)| i).unwrap_or(0),
                ),
                _ => (
                    Arc::clone(&queue),
                    Arc::clone(&self.hub.decoder),
                    video_index,
                ),
            };

        workers.push(motion::spawn_motion(
            analysis_queue.latest(),
            analysis_index,
            Arc::clone(&analysis_slot),
            Arc::clone(&self.collaborators.motion),
            channels.motion_tx.clone(),
            config.capture.analysis_interval,
        ));
        workers.push(livestream_sd::spawn_livestream_sd(
            analysis_queue.latest(),
            analysis_index,
            analysis_slot,
            Arc::clone(&self.collaborators.publisher),
            channels.live_sd_rx.clone(),
        ));

        let (hd_queue, hd_streams) = match (&sub_queue, &sub) {
            (Some(sub_q), Some(sub_opened)) => {
                (Arc::clone(sub_q), Arc::new(sub_opened.streams.clone()))
            }
            _ => (Arc::clone(&queue), Arc::new(main.streams.clone())),
        };
        workers.push(livestream_hd::spawn_livestream_hd(
            hd_queue.latest(),
            hd_streams,
            Arc::clone(&self.collaborators.webrtc),
            channels.sdp_rx.clone(),
            channels.keepalive_rx.clone(),
            channels.peers_rx.clone(),
            self.timing.keepalive_timeout,
        ));

        workers.push(record::spawn_recorder(
            queue.oldest(),
            Arc::new(main.streams.clone()),
            Arc::clone(&self.collaborators.recordings),
            channels.motion_rx.clone(),
            RecorderConfig {
                dir: config.capture.recordings_dir.clone(),
                continuous: config.continuous_recording(),
                max_length: Duration::from_secs(config.capture.max_length),
                post_recording: Duration::from_secs(config.capture.post_recording),
                pre_recording_gops: config.capture.pre_recording as usize,
            },
        ));

        workers.push(onvif::spawn_onvif(
            Arc::clone(&self.collaborators.camera),
            channels.onvif_rx.clone(),
        ));

        if config.is_offline() {
            info!("offline mode: heartbeat and upload workers disabled");
        } else {
            workers.push(heartbeat::spawn_heartbeat(
                config.name.clone(),
                self.uptime_start,
                Arc::clone(&counters),
                Arc::clone(&self.collaborators.cloud),
                channels.heartbeat.receiver(),
                Duration::from_secs(config.heartbeat_interval),
            ));
            workers.push(upload::spawn_uploader(
                config.capture.recordings_dir.clone(),
                Arc::clone(&self.collaborators.cloud),
                Arc::clone(&counters),
                channels.upload.receiver(),
                self.timing.upload_poll,
            ));
        }

        Ok(RunState {
            main,
            sub,
            queue,
            sub_queue,
            channels,
            workers,
        })
    }

    /// Tears a run down. Signal first, then close the resources that
    /// unblock stuck workers, then join everything.
    fn drain(&self, config: &AgentConfig, run: RunState) {
        let RunState {
            main,
            sub,
            queue,
            sub_queue,
            channels,
            workers,
        } = run;
        let RunChannels {
            stream,
            sub_stream,
            heartbeat,
            upload,
            onvif_tx,
            sdp_tx,
            motion_tx,
            ..
        } = channels;

        // Fan-in channels have no stop vocabulary; closing them is the
        // signal. The hub's sender surface goes away first so no control
        // surface can race a send into a draining run.
        self.hub.clear_controls();
        drop(onvif_tx);
        drop(sdp_tx);
        drop(motion_tx);

        if !config.is_offline() {
            heartbeat.stop();
            upload.stop();
        }
        stream.stop();
        if sub.is_some() {
            sub_stream.stop();
        }

        // Grace window so workers observe their signal mid-iteration.
        thread::sleep(self.timing.signal_grace);

        main.demuxer.close();
        if let Some(sub_opened) = &sub {
            sub_opened.demuxer.close();
        }
        queue.close();
        if let Some(sub_q) = &sub_queue {
            sub_q.close();
        }
        self.hub.clear_queues();

        self.collaborators.publisher.disconnect();
        debug!("publisher disconnected");

        drop(stream);
        drop(sub_stream);
        drop(heartbeat);
        drop(upload);

        // Join barrier instead of a fixed unwind sleep: the closed demuxers
        // and queues are what unblock a stuck worker.
        for worker in workers {
            if worker.join().is_err() {
                warn!("worker panicked during drain");
            }
        }
    }
}

fn close_streams(main: &OpenedStream, sub: &Option<OpenedStream>) {
    main.demuxer.close();
    if let Some(sub_opened) = sub {
        sub_opened.demuxer.close();
    }
}

fn close_decoder(slot: &DecoderSlot) {
    if let Some(mut decoder) = lock_decoder(slot).take() {
        decoder.close();
    }
}
