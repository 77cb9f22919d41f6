//! Self-supervising surveillance agent for a single IP camera.
//!
//! One process ingests up to two live RTSP streams, fans packets out through
//! GOP-aware queues to independent consumers (motion detection, two
//! livestream channels, disk recording, cloud upload), and watches its own
//! packet flow so a silent camera or changed camera profile triggers a clean
//! teardown and restart without operator help.
//!
//! The crate is split into focused modules:
//! - `config`: persisted JSON configuration, re-read on every restart.
//! - `hub`: shared counters, control channels and decoder slots.
//! - `supervisor`: the bootstrap / run / drain lifecycle.
//! - `reader`: demuxer-to-queue pump with liveness bookkeeping.
//! - `liveness`: packet-count sampler that escalates stalls to restarts.
//! - `settings`: cached camera parameters and the decoder-rebuild decision.
//! - `consumers`: the worker set spawned for every run.
//! - `collab`: demo-grade collaborator implementations for `sim://` runs.
//! - `telemetry`: tracing and metrics bootstrap.

pub mod collab;
pub mod config;
pub mod consumers;
pub mod hub;
pub mod settings;
pub mod supervisor;
pub mod telemetry;

mod liveness;
mod reader;

pub use hub::{BootstrapSignal, Counters, Hub, MotionEvent, OnvifAction, RunControls, SdpOffer};
pub use supervisor::{Collaborators, RunOutcome, Supervisor, Timing};
