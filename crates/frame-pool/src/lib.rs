//! Fixed-geometry shared buffer pool for frame assembly.
//!
//! The pool owns one contiguous memory region split into `buffer_count`
//! equally sized buffers, each addressed by an integer [`BufferId`]. Every
//! buffer is in exactly one [`BufferState`]:
//!
//! ```text
//!            allocate()              mark_ready()
//!   Free ──────────────► Assigned ──────────────► Ready
//!    ▲                      │                       │
//!    └──────── release() ───┴────── release() ──────┘
//! ```
//!
//! - [`SharedBufferPool::allocate`] hands out an [`AssignedBuffer`], the only
//!   writer for that slot. It never blocks: an empty free list is
//!   [`PoolError::Exhausted`].
//! - [`SharedBufferPool::mark_ready`] freezes the contents and returns a
//!   [`BufferHandle`] that consumers read without copying.
//! - [`SharedBufferPool::release`] returns a buffer to the free list.
//!
//! # Safety Model
//!
//! 1. Per-buffer state, fill length and generation live behind a single
//!    `parking_lot::Mutex` per pool, so transitions are atomic with respect to
//!    concurrent `allocate`/`release`/`mark_ready` calls.
//! 2. Buffer bytes are reached through a raw pointer into the mapped region,
//!    guarded by one `RwLock<()>` per slot. Writers take the slot write lock,
//!    readers of `Ready` buffers take the read lock.
//! 3. Lock order is always slot lock, then state mutex.
//! 4. Each allocation bumps the slot generation; stale handles are rejected.
//!
//! # Example
//!
//! ```
//! use frame_pool::{BufferState, SharedBufferPool};
//!
//! let pool = SharedBufferPool::new(4, 1024)?;
//!
//! let mut buffer = pool.allocate()?;
//! buffer.write_at(0, b"frame payload")?;
//! let id = buffer.id();
//!
//! let ready = buffer.mark_ready()?;
//! assert_eq!(pool.state(id)?, BufferState::Ready);
//! assert_eq!(&ready.read()?[..], b"frame payload");
//!
//! pool.release(id)?;
//! assert_eq!(pool.free_count(), 4);
//! # Ok::<(), frame_pool::PoolError>(())
//! ```

pub mod error;
pub mod pool;
pub mod region;

pub use error::{PoolError, PoolResult};
pub use pool::{AssignedBuffer, BufferHandle, BufferReadGuard, SharedBufferPool};
pub use region::{shared_memory_dir, RegionHeader, RegionView};

/// Index of a buffer inside a pool (`0..buffer_count`).
pub type BufferId = usize;

/// Ownership state of a single buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    /// Owned by the pool, available for allocation.
    Free,
    /// Owned exclusively by the holder of the [`AssignedBuffer`], being filled.
    Assigned,
    /// Handed to downstream consumers, read-only until released.
    Ready,
}

impl std::fmt::Display for BufferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            BufferState::Free => "free",
            BufferState::Assigned => "assigned",
            BufferState::Ready => "ready",
        };
        write!(f, "{}", label)
    }
}
