//! The GOP-aware queue and its cursors.
//!
//! Packets are stored in a list of GOP blocks: the first packet of a block is
//! always a keyframe, appending a keyframe closes the current block and opens
//! a new one, and retention drops whole blocks from the head. A cursor holds a
//! `(block id, index in block)` pair; block ids grow monotonically so an
//! evicted position is detectable by comparing against the head id.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::trace;

use crate::types::{CodecParameters, Packet};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("packet queue is closed")]
    Closed,
    #[error("stream header has not been written")]
    HeaderMissing,
    #[error("stream header was already written")]
    HeaderAlreadyWritten,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecvError {
    /// The queue was closed; no further packets will arrive.
    #[error("packet queue is closed")]
    Closed,
    /// Retention evicted the cursor position. Reseek with
    /// [`Cursor::seek_oldest`] to resume from the oldest retained keyframe.
    #[error("cursor was overtaken by GOP eviction")]
    Lagged,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecvTimeoutError {
    #[error("packet queue is closed")]
    Closed,
    #[error("cursor was overtaken by GOP eviction")]
    Lagged,
    #[error("no packet arrived within the timeout")]
    Timeout,
}

struct Gop {
    packets: Vec<Packet>,
}

struct State {
    header: Option<Arc<Vec<CodecParameters>>>,
    /// Retained blocks; `gops[0]` has block id `head`.
    gops: VecDeque<Gop>,
    /// Block id of the oldest retained GOP.
    head: u64,
    max_gops: usize,
    closed: bool,
    packets_retained: usize,
}

struct Shared {
    state: Mutex<State>,
    available: Condvar,
}

impl Shared {
    // A panic while holding the lock would poison it; recover the guard so
    // readers keep draining during teardown instead of panicking in turn.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Single-producer, multi-consumer packet log retaining the last G GOPs.
pub struct Queue {
    shared: Arc<Shared>,
}

impl Queue {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    header: None,
                    gops: VecDeque::new(),
                    head: 0,
                    max_gops: 1,
                    closed: false,
                    packets_retained: 0,
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// Sets the retention target to `count` GOPs (clamped to at least one).
    ///
    /// Idempotent; excess blocks are trimmed immediately.
    pub fn set_max_gop_count(&self, count: usize) {
        let mut st = self.shared.lock();
        st.max_gops = count.max(1);
        trim_excess(&mut st);
    }

    /// Captures the codec descriptors. Must precede any append and may only
    /// be called once per queue.
    pub fn write_header(&self, streams: Vec<CodecParameters>) -> Result<(), QueueError> {
        let mut st = self.shared.lock();
        if st.closed {
            return Err(QueueError::Closed);
        }
        if st.header.is_some() {
            return Err(QueueError::HeaderAlreadyWritten);
        }
        st.header = Some(Arc::new(streams));
        Ok(())
    }

    /// The codec descriptors written at open time, if any.
    pub fn header(&self) -> Option<Arc<Vec<CodecParameters>>> {
        self.shared.lock().header.clone()
    }

    /// Appends a packet, trimming the oldest GOP when a new keyframe pushes
    /// retention past the configured bound. Whole blocks only, never partial.
    pub fn append(&self, packet: Packet) -> Result<(), QueueError> {
        let mut st = self.shared.lock();
        if st.closed {
            return Err(QueueError::Closed);
        }
        if st.header.is_none() {
            return Err(QueueError::HeaderMissing);
        }

        if packet.is_keyframe {
            st.gops.push_back(Gop {
                packets: vec![packet],
            });
            st.packets_retained += 1;
            trim_excess(&mut st);
        } else if let Some(open) = st.gops.back_mut() {
            open.packets.push(packet);
            st.packets_retained += 1;
        } else {
            // No keyframe seen yet: a dangling P-frame prefix is useless to
            // every consumer, so drop it rather than break the
            // keyframe-first invariant.
            trace!("dropping packet that precedes the first keyframe");
            return Ok(());
        }

        drop(st);
        self.shared.available.notify_all();
        Ok(())
    }

    /// Cursor positioned at the live tail: only packets appended after the
    /// call are observed.
    pub fn latest(&self) -> Cursor {
        let st = self.shared.lock();
        let (block, index) = match st.gops.back() {
            Some(open) => (st.head + st.gops.len() as u64 - 1, open.packets.len()),
            None => (st.head, 0),
        };
        Cursor {
            shared: Arc::clone(&self.shared),
            block,
            index,
        }
    }

    /// Cursor positioned at the oldest retained keyframe.
    pub fn oldest(&self) -> Cursor {
        let st = self.shared.lock();
        Cursor {
            shared: Arc::clone(&self.shared),
            block: st.head,
            index: 0,
        }
    }

    /// Wakes every blocked cursor with a terminal `Closed`; subsequent
    /// appends fail.
    pub fn close(&self) {
        let mut st = self.shared.lock();
        st.closed = true;
        drop(st);
        self.shared.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Number of retained GOPs (equals the number of retained keyframes).
    pub fn gop_count(&self) -> usize {
        self.shared.lock().gops.len()
    }

    /// Number of retained packets across all GOPs.
    pub fn packet_count(&self) -> usize {
        self.shared.lock().packets_retained
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_excess(st: &mut State) {
    while st.gops.len() > st.max_gops {
        if let Some(evicted) = st.gops.pop_front() {
            st.packets_retained -= evicted.packets.len();
            st.head += 1;
            trace!(
                packets = evicted.packets.len(),
                head = st.head,
                "evicted oldest GOP"
            );
        }
    }
}

/// Independent read position into a [`Queue`].
///
/// Positions advance monotonically. When retention overtakes the cursor the
/// next read reports [`RecvError::Lagged`] once; the owner is expected to
/// call [`Cursor::seek_oldest`] and resume, accepting the gap.
pub struct Cursor {
    shared: Arc<Shared>,
    block: u64,
    index: usize,
}

impl Cursor {
    /// Blocks until a packet is available at or after the cursor position.
    pub fn next(&mut self) -> Result<Packet, RecvError> {
        let mut st = self.shared.lock();
        loop {
            match poll_cursor(&mut self.block, &mut self.index, &mut st) {
                Poll::Ready(out) => return out,
                Poll::Pending => {
                    st = self
                        .shared
                        .available
                        .wait(st)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Like [`Cursor::next`] but gives up after `timeout` so callers can
    /// interleave control-channel polling with queue reads.
    pub fn next_timeout(&mut self, timeout: Duration) -> Result<Packet, RecvTimeoutError> {
        let deadline = Instant::now() + timeout;
        let mut st = self.shared.lock();
        loop {
            match poll_cursor(&mut self.block, &mut self.index, &mut st) {
                Poll::Ready(Ok(packet)) => return Ok(packet),
                Poll::Ready(Err(RecvError::Closed)) => return Err(RecvTimeoutError::Closed),
                Poll::Ready(Err(RecvError::Lagged)) => return Err(RecvTimeoutError::Lagged),
                Poll::Pending => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(RecvTimeoutError::Timeout);
                    }
                    let (guard, _) = self
                        .shared
                        .available
                        .wait_timeout(st, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    st = guard;
                }
            }
        }
    }

    /// Repositions at the oldest retained keyframe. The usual response to
    /// [`RecvError::Lagged`].
    pub fn seek_oldest(&mut self) {
        let st = self.shared.lock();
        self.block = st.head;
        self.index = 0;
    }

}

enum Poll {
    Ready(Result<Packet, RecvError>),
    Pending,
}

fn poll_cursor(block: &mut u64, index: &mut usize, st: &mut MutexGuard<'_, State>) -> Poll {
    loop {
        if *block < st.head {
            // Retention moved past us while we were away.
            return Poll::Ready(Err(RecvError::Lagged));
        }
        let rel = (*block - st.head) as usize;
        if rel < st.gops.len() {
            let gop = &st.gops[rel];
            if *index < gop.packets.len() {
                let packet = gop.packets[*index].clone();
                *index += 1;
                return Poll::Ready(Ok(packet));
            }
            if rel + 1 < st.gops.len() {
                *block += 1;
                *index = 0;
                continue;
            }
        }
        // At the live tail (or ahead of an empty queue).
        if st.closed {
            return Poll::Ready(Err(RecvError::Closed));
        }
        return Poll::Pending;
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use bytes::Bytes;

    use super::*;
    use crate::types::{CodecParameters, MediaKind};

    fn h264_header() -> Vec<CodecParameters> {
        vec![CodecParameters {
            kind: MediaKind::Video,
            codec: "h264".into(),
            width: 640,
            height: 480,
            fps_num: 25,
            fps_den: 1,
        }]
    }

    fn packet(dts: i64, key: bool) -> Packet {
        Packet {
            stream_index: 0,
            data: Bytes::from_static(b"payload"),
            pts: dts,
            dts,
            is_keyframe: key,
        }
    }

    fn ready_queue(max_gops: usize) -> Queue {
        let queue = Queue::new();
        queue.set_max_gop_count(max_gops);
        queue.write_header(h264_header()).unwrap();
        queue
    }

    /// Appends `gops` GOPs of `len` packets each, dts increasing.
    fn fill(queue: &Queue, gops: u64, len: u64, start_dts: i64) -> i64 {
        let mut dts = start_dts;
        for _ in 0..gops {
            for i in 0..len {
                queue.append(packet(dts, i == 0)).unwrap();
                dts += 1;
            }
        }
        dts
    }

    #[test]
    fn header_must_precede_append() {
        let queue = Queue::new();
        assert_eq!(
            queue.append(packet(0, true)),
            Err(QueueError::HeaderMissing)
        );
    }

    #[test]
    fn header_write_is_once_only() {
        let queue = Queue::new();
        queue.write_header(h264_header()).unwrap();
        assert_eq!(
            queue.write_header(h264_header()),
            Err(QueueError::HeaderAlreadyWritten)
        );
    }

    #[test]
    fn append_after_close_fails() {
        let queue = ready_queue(2);
        queue.close();
        assert_eq!(queue.append(packet(0, true)), Err(QueueError::Closed));
    }

    #[test]
    fn retention_keeps_at_most_max_gops() {
        let queue = ready_queue(2);
        fill(&queue, 5, 3, 0);
        assert_eq!(queue.gop_count(), 2);
        assert_eq!(queue.packet_count(), 6);
    }

    #[test]
    fn oldest_prefix_starts_at_keyframe() {
        let queue = ready_queue(2);
        fill(&queue, 3, 4, 0);
        queue.close();

        let mut cursor = queue.oldest();
        let first = cursor.next().unwrap();
        assert!(first.is_keyframe);
    }

    #[test]
    fn packets_before_first_keyframe_are_dropped() {
        let queue = ready_queue(2);
        queue.append(packet(0, false)).unwrap();
        queue.append(packet(1, false)).unwrap();
        assert_eq!(queue.packet_count(), 0);

        queue.append(packet(2, true)).unwrap();
        queue.close();
        let mut cursor = queue.oldest();
        assert_eq!(cursor.next().unwrap().dts, 2);
    }

    #[test]
    fn cursor_reads_are_dts_ordered() {
        let queue = ready_queue(3);
        fill(&queue, 3, 5, 0);
        queue.close();

        let mut cursor = queue.oldest();
        let mut last_dts = i64::MIN;
        while let Ok(p) = cursor.next() {
            assert!(p.dts >= last_dts);
            last_dts = p.dts;
        }
        assert_eq!(last_dts, 14);
    }

    #[test]
    fn latest_yields_nothing_until_next_append() {
        let queue = ready_queue(2);
        fill(&queue, 2, 3, 0);

        let mut cursor = queue.latest();
        assert_eq!(
            cursor.next_timeout(Duration::from_millis(20)),
            Err(RecvTimeoutError::Timeout)
        );

        queue.append(packet(100, true)).unwrap();
        assert_eq!(cursor.next().unwrap().dts, 100);
    }

    #[test]
    fn set_max_gop_count_is_idempotent() {
        let queue = ready_queue(2);
        fill(&queue, 4, 2, 0);
        let before = queue.gop_count();
        queue.set_max_gop_count(2);
        assert_eq!(queue.gop_count(), before);
    }

    #[test]
    fn shrinking_retention_trims_immediately() {
        let queue = ready_queue(4);
        fill(&queue, 4, 2, 0);
        queue.set_max_gop_count(1);
        assert_eq!(queue.gop_count(), 1);

        queue.close();
        let mut cursor = queue.oldest();
        // Only the newest GOP survives.
        assert_eq!(cursor.next().unwrap().dts, 6);
    }

    #[test]
    fn close_wakes_blocked_reader() {
        let queue = Arc::new(ready_queue(2));
        let mut cursor = queue.latest();

        let closer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                queue.close();
            })
        };

        assert_eq!(cursor.next(), Err(RecvError::Closed));
        closer.join().unwrap();
    }

    #[test]
    fn lagged_cursor_reseeks_to_keyframe() {
        let queue = ready_queue(2);
        fill(&queue, 2, 3, 0);

        let mut slow = queue.oldest();
        assert_eq!(slow.next().unwrap().dts, 0);

        // Producer races ahead; the slow cursor's GOP is evicted.
        fill(&queue, 4, 3, 100);

        assert_eq!(slow.next(), Err(RecvError::Lagged));
        slow.seek_oldest();
        let resumed = slow.next().unwrap();
        assert!(resumed.is_keyframe);
        assert_eq!(resumed.dts, 106);
    }

    #[test]
    fn concurrent_producer_and_consumers() {
        let queue = Arc::new(ready_queue(3));
        let total: i64 = 60;

        let mut readers = Vec::new();
        for _ in 0..3 {
            let mut cursor = queue.oldest();
            readers.push(thread::spawn(move || {
                let mut last_dts = i64::MIN;
                let mut seen = 0usize;
                loop {
                    match cursor.next() {
                        Ok(p) => {
                            assert!(p.dts >= last_dts);
                            last_dts = p.dts;
                            seen += 1;
                        }
                        Err(RecvError::Lagged) => cursor.seek_oldest(),
                        Err(RecvError::Closed) => break,
                    }
                }
                seen
            }));
        }

        for dts in 0..total {
            queue.append(packet(dts, dts % 5 == 0)).unwrap();
            thread::sleep(Duration::from_millis(1));
        }
        queue.close();

        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }
    }
}
