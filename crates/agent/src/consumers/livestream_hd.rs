//! High-resolution livestream consumer.
//!
//! Keeps a set of WebRTC peers fed straight from the packet queue; nothing
//! is decoded, the peers negotiate the codec from the descriptors captured
//! at construction. Offers arrive on the SDP fan-in channel, viewers prove they
//! are still watching via keepalives, and a quiet keepalive channel drops
//! every peer so the camera stops pushing into dead sessions.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use packet_queue::{CodecParameters, Cursor, Packet, RecvTimeoutError};
use tracing::{debug, info, warn};

use crate::consumers::CURSOR_POLL;
use crate::hub::SdpOffer;
use crate::telemetry;

/// Default keepalive window before all peers are dropped.
pub(crate) const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(15);

/// External WebRTC stack: completes the SDP handshake and returns a sink for
/// the session.
pub trait PeerBridge: Send + Sync {
    fn accept_offer(
        &self,
        offer: &SdpOffer,
        streams: &[CodecParameters],
    ) -> anyhow::Result<Box<dyn PeerSink>>;
}

/// One connected viewer.
pub trait PeerSink: Send {
    fn peer_id(&self) -> &str;
    fn send_packet(&mut self, packet: &Packet) -> anyhow::Result<()>;
}

struct Peer {
    sink: Box<dyn PeerSink>,
    /// Forwarding starts at the first keyframe after the peer joined so the
    /// session never opens with a dangling P-frame prefix.
    started: bool,
}

pub(crate) fn spawn_livestream_hd(
    mut cursor: Cursor,
    streams: Arc<Vec<CodecParameters>>,
    bridge: Arc<dyn PeerBridge>,
    offers: Receiver<SdpOffer>,
    keepalives: Receiver<i64>,
    disconnects: Receiver<String>,
    keepalive_timeout: Duration,
) -> thread::JoinHandle<()> {
    telemetry::spawn_thread("livestream-hd", move || {
        let mut peers: Vec<Peer> = Vec::new();
        let mut last_keepalive = Instant::now();
        loop {
            while let Ok(offer) = offers.try_recv() {
                match bridge.accept_offer(&offer, &streams) {
                    Ok(sink) => {
                        info!(peer = %offer.peer_id, "webrtc peer connected");
                        metrics::gauge!("agent_livestream_hd_peers").increment(1.0);
                        last_keepalive = Instant::now();
                        peers.push(Peer {
                            sink,
                            started: false,
                        });
                    }
                    Err(err) => warn!(peer = %offer.peer_id, error = %err, "sdp handshake failed"),
                }
            }
            while keepalives.try_recv().is_ok() {
                last_keepalive = Instant::now();
            }
            while let Ok(peer_id) = disconnects.try_recv() {
                peers.retain(|peer| peer.sink.peer_id() != peer_id);
            }
            if !peers.is_empty() && last_keepalive.elapsed() > keepalive_timeout {
                info!(peers = peers.len(), "keepalive window expired, dropping peers");
                peers.clear();
            }
            metrics::gauge!("agent_livestream_hd_peers").set(peers.len() as f64);

            match cursor.next_timeout(CURSOR_POLL) {
                Ok(packet) => {
                    if peers.is_empty() {
                        continue;
                    }
                    peers.retain_mut(|peer| {
                        if !peer.started {
                            if !packet.is_keyframe {
                                return true;
                            }
                            peer.started = true;
                        }
                        match peer.sink.send_packet(&packet) {
                            Ok(()) => true,
                            Err(err) => {
                                warn!(peer = %peer.sink.peer_id(), error = %err, "dropping peer");
                                false
                            }
                        }
                    });
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Lagged) => cursor.seek_oldest(),
                Err(RecvTimeoutError::Closed) => break,
            }
        }
        debug!("livestream-hd consumer finished");
    })
    .expect("failed to spawn livestream-hd thread")
}
