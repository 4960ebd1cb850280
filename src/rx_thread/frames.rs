//! Frames being assembled by the receive thread.

use crate::decoder::FrameId;
use frame_pool::{AssignedBuffer, BufferHandle, PoolResult};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Completed or dropped frame IDs remembered for classifying stragglers.
const HISTORY_DEPTH: usize = 256;

struct InFlightFrame {
    buffer: AssignedBuffer,
    started: Instant,
    /// Offsets written so far. A duplicate packet overwrites its earlier copy
    /// and is not counted twice.
    offsets: HashSet<usize>,
}

impl InFlightFrame {
    fn packets(&self) -> u32 {
        u32::try_from(self.offsets.len()).unwrap_or(u32::MAX)
    }
}

/// A frame whose buffer has been published.
#[derive(Debug)]
pub(crate) struct CompletedFrame {
    pub frame_id: FrameId,
    pub handle: BufferHandle,
    pub packets: u32,
    pub complete: bool,
}

/// What is known about a frame ID that is not in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameHistory {
    /// Never seen (or forgotten): a packet for it starts a new frame.
    New,
    /// Already published.
    Completed,
    /// Discarded for lack of a buffer.
    Dropped,
}

/// Outcome of writing one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    /// Frame still needs more packets.
    Partial,
    /// The expected packet count has been reached.
    Full,
}

#[derive(Default)]
struct BoundedHistory {
    order: VecDeque<FrameId>,
    fates: HashMap<FrameId, FrameHistory>,
}

impl BoundedHistory {
    fn record(&mut self, id: FrameId, fate: FrameHistory) {
        if self.fates.insert(id, fate).is_none() {
            self.order.push_back(id);
            if self.order.len() > HISTORY_DEPTH {
                if let Some(oldest) = self.order.pop_front() {
                    self.fates.remove(&oldest);
                }
            }
        }
    }

    fn lookup(&self, id: FrameId) -> FrameHistory {
        self.fates.get(&id).copied().unwrap_or(FrameHistory::New)
    }
}

/// In-flight frames keyed by frame ID, plus recent history.
///
/// Frames must be begun in non-decreasing time order; expiry then only looks
/// at the front of `order`.
pub(crate) struct FrameTracker {
    in_flight: HashMap<FrameId, InFlightFrame>,
    /// Start order. Entries of frames already published are dropped lazily.
    order: VecDeque<(Instant, FrameId)>,
    history: BoundedHistory,
    expected_packets: Option<u32>,
    timeout: Duration,
}

impl FrameTracker {
    pub(crate) fn new(expected_packets: Option<u32>, timeout: Duration) -> Self {
        Self {
            in_flight: HashMap::new(),
            order: VecDeque::new(),
            history: BoundedHistory::default(),
            expected_packets,
            timeout,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub(crate) fn contains(&self, id: FrameId) -> bool {
        self.in_flight.contains_key(&id)
    }

    pub(crate) fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub(crate) fn set_expected_packets(&mut self, expected_packets: Option<u32>) {
        self.expected_packets = expected_packets;
    }

    pub(crate) fn history(&self, id: FrameId) -> FrameHistory {
        self.history.lookup(id)
    }

    pub(crate) fn record_dropped(&mut self, id: FrameId) {
        self.history.record(id, FrameHistory::Dropped);
    }

    /// Start assembling `id` into `buffer`.
    pub(crate) fn begin(&mut self, id: FrameId, buffer: AssignedBuffer, now: Instant) {
        self.in_flight.insert(
            id,
            InFlightFrame {
                buffer,
                started: now,
                offsets: HashSet::new(),
            },
        );
        self.order.push_back((now, id));
    }

    fn is_live(&self, started: Instant, id: FrameId) -> bool {
        self.in_flight
            .get(&id)
            .is_some_and(|frame| frame.started == started)
    }

    /// Drop entries at the front of `order` whose frames are gone.
    fn trim_order(&mut self) {
        while let Some(&(started, id)) = self.order.front() {
            if self.is_live(started, id) {
                break;
            }
            self.order.pop_front();
        }
    }

    /// Copy `payload` into frame `id` at `offset`. The later of two writes to
    /// the same offset wins.
    ///
    /// Returns `None` if the frame is not in flight.
    pub(crate) fn write(
        &mut self,
        id: FrameId,
        offset: usize,
        payload: &[u8],
    ) -> Option<PoolResult<WriteOutcome>> {
        let frame = self.in_flight.get_mut(&id)?;
        if let Err(e) = frame.buffer.write_at(offset, payload) {
            return Some(Err(e));
        }
        frame.offsets.insert(offset);
        let packets = frame.packets();
        let full = self
            .expected_packets
            .is_some_and(|expected| packets >= expected);
        Some(Ok(if full {
            WriteOutcome::Full
        } else {
            WriteOutcome::Partial
        }))
    }

    /// Publish frame `id`, moving its buffer to `Ready`.
    ///
    /// A frame is reported complete unless it was `forced` out by timeout or
    /// drain, or it ended with fewer packets than the decoder expects.
    pub(crate) fn complete(
        &mut self,
        id: FrameId,
        forced: bool,
    ) -> Option<PoolResult<CompletedFrame>> {
        let frame = self.in_flight.remove(&id)?;
        self.history.record(id, FrameHistory::Completed);
        self.trim_order();
        let packets = frame.packets();
        let complete = !forced && self.expected_packets.map_or(true, |n| packets >= n);
        Some(frame.buffer.mark_ready().map(|handle| CompletedFrame {
            frame_id: id,
            handle,
            packets,
            complete,
        }))
    }

    /// Frames in flight longer than the frame timeout, oldest first.
    ///
    /// Returns without allocating while the oldest frame is still in time.
    pub(crate) fn expired(&mut self, now: Instant) -> Vec<FrameId> {
        let mut expired = Vec::new();
        self.trim_order();
        while let Some(&(started, id)) = self.order.front() {
            if now.saturating_duration_since(started) < self.timeout {
                break;
            }
            self.order.pop_front();
            if self.is_live(started, id) {
                expired.push(id);
            }
        }
        expired
    }

    /// All in-flight frame IDs, oldest first.
    pub(crate) fn ids(&self) -> Vec<FrameId> {
        self.order
            .iter()
            .filter(|&&(started, id)| self.is_live(started, id))
            .map(|&(_, id)| id)
            .collect()
    }
}
