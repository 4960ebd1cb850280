//! Error type for buffer pool operations.

use crate::{BufferId, BufferState};
use thiserror::Error;

/// Convenience alias for pool results.
pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// Errors raised by [`SharedBufferPool`](crate::SharedBufferPool) and its handles.
///
/// Only [`PoolError::Io`] and [`PoolError::InvalidGeometry`] can occur at
/// construction; everything else is a per-call failure that leaves the pool
/// consistent.
#[derive(Error, Debug)]
pub enum PoolError {
    /// No `Free` buffer remains.
    ///
    /// **Recovery Strategy**: back off, drop data, or ask the owner for more
    /// buffers. The pool never grows, since growing would invalidate addresses
    /// already held by other processes.
    #[error("Buffer pool exhausted ({buffer_count} buffers in use)")]
    Exhausted {
        /// Total number of buffers in the pool.
        buffer_count: usize,
    },

    /// Buffer ID is outside `0..buffer_count`.
    #[error("Unknown buffer id {0}")]
    UnknownBuffer(BufferId),

    /// The requested transition is not legal from the buffer's current state
    /// (for example a double release).
    #[error("Buffer {id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Buffer ID.
        id: BufferId,
        /// Current state.
        from: BufferState,
        /// Requested state.
        to: BufferState,
    },

    /// The handle refers to an earlier allocation of this slot.
    #[error("Stale handle for buffer {id}: buffer was released and reallocated")]
    StaleHandle {
        /// Buffer ID.
        id: BufferId,
    },

    /// A write would run past the end of the buffer.
    #[error("Write of {len} bytes at offset {offset} exceeds buffer {id} capacity ({capacity})")]
    OutOfBounds {
        /// Buffer ID.
        id: BufferId,
        /// Requested write offset.
        offset: usize,
        /// Requested write length.
        len: usize,
        /// Buffer capacity in bytes.
        capacity: usize,
    },

    /// Pool geometry is zero or overflows the address space.
    #[error("Invalid pool geometry: {0}")]
    InvalidGeometry(String),

    /// Shared region name is empty or contains a path separator.
    #[error("Invalid shared buffer name '{0}'")]
    InvalidName(String),

    /// A named region's header does not describe a valid pool.
    #[error("Shared region header mismatch: {0}")]
    HeaderMismatch(String),

    /// Mapping or sizing the backing region failed.
    #[error("Shared region I/O error: {0}")]
    Io(#[from] std::io::Error),
}
