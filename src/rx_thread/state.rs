//! Receive thread lifecycle state.
//!
//! ```text
//! Created ──► Listening ──► Receiving ⇄ Idle
//!                 │             │        │
//!                 └─────────────┴────────┴──► Stopping ──► Stopped
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{debug, warn};

/// Lifecycle state of a receive thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RxState {
    /// Socket and channel open, thread not yet running.
    Created = 0,
    /// Identity announced; no packet seen yet.
    Listening = 1,
    /// The last poll returned a packet.
    Receiving = 2,
    /// The last poll timed out.
    Idle = 3,
    /// Draining in-flight frames.
    Stopping = 4,
    /// Resources released; the thread is exiting.
    Stopped = 5,
}

impl RxState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => RxState::Created,
            1 => RxState::Listening,
            2 => RxState::Receiving,
            3 => RxState::Idle,
            4 => RxState::Stopping,
            _ => RxState::Stopped,
        }
    }

    /// Whether `self → next` is a legal transition. Staying put is legal.
    pub fn can_transition_to(self, next: RxState) -> bool {
        use RxState::*;
        self == next
            || matches!(
                (self, next),
                (Created, Listening)
                    | (Listening, Receiving | Idle | Stopping)
                    | (Receiving, Idle | Stopping)
                    | (Idle, Receiving | Stopping)
                    | (Stopping, Stopped)
            )
    }

    /// Position in the lifecycle; `Receiving` and `Idle` share a stage.
    fn rank(self) -> u8 {
        match self {
            RxState::Created => 0,
            RxState::Listening => 1,
            RxState::Receiving | RxState::Idle => 2,
            RxState::Stopping => 3,
            RxState::Stopped => 4,
        }
    }

    /// `true` if a thread in this state is at `target` or past its stage.
    ///
    /// `Idle` has not reached `Receiving` (nor the reverse), but `Stopping`
    /// has reached both.
    pub fn has_reached(self, target: RxState) -> bool {
        self == target || self.rank() > target.rank()
    }

    /// `true` once the thread will process no further packets.
    pub fn is_terminal(self) -> bool {
        matches!(self, RxState::Stopping | RxState::Stopped)
    }

    /// Lowercase name used in status replies.
    pub fn as_str(self) -> &'static str {
        match self {
            RxState::Created => "created",
            RxState::Listening => "listening",
            RxState::Receiving => "receiving",
            RxState::Idle => "idle",
            RxState::Stopping => "stopping",
            RxState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for RxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State cell shared between the receive thread and its handle.
#[derive(Debug)]
pub(crate) struct SharedState(AtomicU8);

impl SharedState {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(RxState::Created as u8))
    }

    pub(crate) fn get(&self) -> RxState {
        RxState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next`. Illegal transitions are logged and ignored; only the
    /// receive thread writes, so there is no race between check and store.
    pub(crate) fn advance(&self, next: RxState) -> bool {
        let current = self.get();
        if !current.can_transition_to(next) {
            warn!(from = %current, to = %next, "Ignoring illegal receive thread transition");
            return false;
        }
        if current != next {
            self.0.store(next as u8, Ordering::Release);
            if !matches!(
                (current, next),
                (RxState::Receiving, RxState::Idle) | (RxState::Idle, RxState::Receiving)
            ) {
                debug!(from = %current, to = %next, "Receive thread state change");
            }
        }
        true
    }
}
