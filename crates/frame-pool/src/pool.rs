//! The shared buffer pool and its handles.

use crate::region::{RegionHeader, SharedRegion};
use crate::{BufferId, BufferState, PoolError, PoolResult};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::collections::VecDeque;
use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Per-buffer bookkeeping, guarded by the pool mutex.
#[derive(Debug, Clone, Copy)]
struct SlotMeta {
    state: BufferState,
    /// High-water mark of bytes written since allocation.
    len: usize,
    /// Incremented on every allocation of this slot.
    generation: u64,
}

struct PoolState {
    slots: Vec<SlotMeta>,
    free: VecDeque<BufferId>,
}

impl PoolState {
    fn meta(&self, id: BufferId) -> PoolResult<&SlotMeta> {
        self.slots.get(id).ok_or(PoolError::UnknownBuffer(id))
    }

    fn meta_mut(&mut self, id: BufferId) -> PoolResult<&mut SlotMeta> {
        self.slots.get_mut(id).ok_or(PoolError::UnknownBuffer(id))
    }

    fn count(&self, state: BufferState) -> usize {
        self.slots.iter().filter(|s| s.state == state).count()
    }
}

struct PoolInner {
    /// Single synchronization point for all state transitions.
    state: Mutex<PoolState>,
    /// One lock per slot guarding the bytes behind `data`.
    slot_locks: Vec<RwLock<()>>,
    /// First byte of buffer 0 inside `region`.
    data: *mut u8,
    /// Keeps the mapping (and `data`) alive.
    region: SharedRegion,
    buffer_count: usize,
    buffer_size: usize,
    name: Option<String>,
    total_allocations: AtomicU64,
    total_releases: AtomicU64,
    exhausted_count: AtomicU64,
}

// SAFETY: PoolInner is Send+Sync because:
// 1. `data` points into `region`, which lives exactly as long as PoolInner
// 2. Bytes of slot N are only written while holding slot_locks[N] for writing
//    and only read while holding it for reading
// 3. All other fields are Sync on their own
#[allow(unsafe_code)]
unsafe impl Send for PoolInner {}
#[allow(unsafe_code)]
unsafe impl Sync for PoolInner {}

impl PoolInner {
    fn slot_lock(&self, id: BufferId) -> PoolResult<&RwLock<()>> {
        self.slot_locks.get(id).ok_or(PoolError::UnknownBuffer(id))
    }

    #[allow(unsafe_code)]
    fn slot_ptr(&self, id: BufferId) -> *mut u8 {
        // SAFETY: callers validated id < buffer_count, so the offset stays
        // inside the mapping.
        unsafe { self.data.add(id * self.buffer_size) }
    }

    /// Move `id` to `to`, checking the current state is in `from`.
    ///
    /// Takes the slot write lock first so no reader or writer is mid-copy.
    fn transition(
        &self,
        id: BufferId,
        from: &[BufferState],
        to: BufferState,
        generation: Option<u64>,
    ) -> PoolResult<SlotMeta> {
        let _slot = self.slot_lock(id)?.write();
        let mut state = self.state.lock();
        let meta = state.meta_mut(id)?;

        if let Some(expected) = generation {
            if meta.generation != expected {
                return Err(PoolError::StaleHandle { id });
            }
        }
        if !from.contains(&meta.state) {
            return Err(PoolError::InvalidTransition {
                id,
                from: meta.state,
                to,
            });
        }

        meta.state = to;
        let snapshot = *meta;
        if to == BufferState::Free {
            meta.len = 0;
            state.free.push_back(id);
            self.total_releases.fetch_add(1, Ordering::Relaxed);
        }
        Ok(snapshot)
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        debug!(
            name = self.name.as_deref().unwrap_or("<anonymous>"),
            path = ?self.region.path(),
            "SharedBufferPool dropped"
        );
    }
}

/// Pool of fixed-size buffers carved from one memory region.
///
/// Cloning is cheap and shares the same pool. The buffer count and size never
/// change after construction.
#[derive(Clone)]
pub struct SharedBufferPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for SharedBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBufferPool")
            .field("name", &self.inner.name)
            .field("buffer_count", &self.inner.buffer_count)
            .field("buffer_size", &self.inner.buffer_size)
            .field("free", &self.free_count())
            .finish()
    }
}

impl SharedBufferPool {
    /// Create a pool backed by an anonymous, process-private mapping.
    pub fn new(buffer_count: usize, buffer_size: usize) -> PoolResult<Self> {
        let header = RegionHeader {
            buffer_count,
            buffer_size,
        };
        let region = SharedRegion::anonymous(header)?;
        Ok(Self::from_region(region, header, None))
    }

    /// Create a pool backed by a named file in
    /// [`shared_memory_dir`](crate::shared_memory_dir), mappable by other
    /// processes through [`RegionView`](crate::RegionView).
    ///
    /// An existing region with the same name is truncated. The file is removed
    /// when the last clone of the pool is dropped.
    pub fn with_name(name: &str, buffer_count: usize, buffer_size: usize) -> PoolResult<Self> {
        Self::with_name_in(&crate::shared_memory_dir(), name, buffer_count, buffer_size)
    }

    /// Like [`with_name`](Self::with_name) but places the region in `dir`.
    pub fn with_name_in(
        dir: &Path,
        name: &str,
        buffer_count: usize,
        buffer_size: usize,
    ) -> PoolResult<Self> {
        let header = RegionHeader {
            buffer_count,
            buffer_size,
        };
        let region = SharedRegion::create_named(dir, name, header)?;
        Ok(Self::from_region(region, header, Some(name.to_string())))
    }

    fn from_region(mut region: SharedRegion, header: RegionHeader, name: Option<String>) -> Self {
        let RegionHeader {
            buffer_count,
            buffer_size,
        } = header;

        let slots = vec![
            SlotMeta {
                state: BufferState::Free,
                len: 0,
                generation: 0,
            };
            buffer_count
        ];
        let free = (0..buffer_count).collect();
        let slot_locks = (0..buffer_count).map(|_| RwLock::new(())).collect();
        let data = region.data_ptr();

        info!(
            name = name.as_deref().unwrap_or("<anonymous>"),
            buffer_count,
            buffer_size,
            total_mb = (buffer_count * buffer_size) as f64 / (1024.0 * 1024.0),
            "SharedBufferPool created"
        );

        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState { slots, free }),
                slot_locks,
                data,
                region,
                buffer_count,
                buffer_size,
                name,
                total_allocations: AtomicU64::new(0),
                total_releases: AtomicU64::new(0),
                exhausted_count: AtomicU64::new(0),
            }),
        }
    }

    /// Take a `Free` buffer and mark it `Assigned` to the caller.
    ///
    /// Never blocks. Returns [`PoolError::Exhausted`] when every buffer is
    /// `Assigned` or `Ready`.
    pub fn allocate(&self) -> PoolResult<AssignedBuffer> {
        let mut state = self.inner.state.lock();
        let Some(id) = state.free.pop_front() else {
            drop(state);
            self.inner.exhausted_count.fetch_add(1, Ordering::Relaxed);
            return Err(PoolError::Exhausted {
                buffer_count: self.inner.buffer_count,
            });
        };

        let meta = state.meta_mut(id)?;
        meta.state = BufferState::Assigned;
        meta.len = 0;
        meta.generation = meta.generation.wrapping_add(1);
        let generation = meta.generation;
        drop(state);

        self.inner.total_allocations.fetch_add(1, Ordering::Relaxed);
        Ok(AssignedBuffer {
            pool: self.clone(),
            id,
            generation,
        })
    }

    /// Return buffer `id` to the free list.
    ///
    /// Valid from `Assigned` or `Ready`. Releasing a `Free` buffer (double
    /// release) is [`PoolError::InvalidTransition`]; an out-of-range ID is
    /// [`PoolError::UnknownBuffer`].
    pub fn release(&self, id: BufferId) -> PoolResult<()> {
        self.inner.transition(
            id,
            &[BufferState::Assigned, BufferState::Ready],
            BufferState::Free,
            None,
        )?;
        Ok(())
    }

    /// Move buffer `id` from `Assigned` to `Ready` and return a read handle.
    pub fn mark_ready(&self, id: BufferId) -> PoolResult<BufferHandle> {
        let meta = self
            .inner
            .transition(id, &[BufferState::Assigned], BufferState::Ready, None)?;
        Ok(self.handle(id, meta))
    }

    /// Read handle for a buffer that is already `Ready`.
    pub fn get(&self, id: BufferId) -> PoolResult<BufferHandle> {
        let state = self.inner.state.lock();
        let meta = *state.meta(id)?;
        drop(state);
        if meta.state != BufferState::Ready {
            return Err(PoolError::InvalidTransition {
                id,
                from: meta.state,
                to: BufferState::Ready,
            });
        }
        Ok(self.handle(id, meta))
    }

    fn handle(&self, id: BufferId, meta: SlotMeta) -> BufferHandle {
        BufferHandle {
            pool: self.clone(),
            id,
            len: meta.len,
            generation: meta.generation,
        }
    }

    /// Current state of buffer `id`.
    pub fn state(&self, id: BufferId) -> PoolResult<BufferState> {
        Ok(self.inner.state.lock().meta(id)?.state)
    }

    /// Number of buffers in the pool.
    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.inner.buffer_count
    }

    /// Size of each buffer in bytes.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Name of the backing region, if named.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Number of `Free` buffers.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.inner.state.lock().free.len()
    }

    /// Number of `Assigned` buffers.
    #[must_use]
    pub fn assigned_count(&self) -> usize {
        self.inner.state.lock().count(BufferState::Assigned)
    }

    /// Number of `Ready` buffers.
    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.inner.state.lock().count(BufferState::Ready)
    }

    /// Successful allocations since creation.
    #[must_use]
    pub fn total_allocations(&self) -> u64 {
        self.inner.total_allocations.load(Ordering::Relaxed)
    }

    /// Releases since creation.
    #[must_use]
    pub fn total_releases(&self) -> u64 {
        self.inner.total_releases.load(Ordering::Relaxed)
    }

    /// Allocation attempts that found the pool exhausted.
    #[must_use]
    pub fn exhausted_count(&self) -> u64 {
        self.inner.exhausted_count.load(Ordering::Relaxed)
    }
}

/// Exclusive writer for one `Assigned` buffer.
///
/// Not `Clone`. Dropping it does not release the buffer: ownership only moves
/// through [`mark_ready`](Self::mark_ready) or [`release`](Self::release).
#[derive(Debug)]
pub struct AssignedBuffer {
    pool: SharedBufferPool,
    id: BufferId,
    generation: u64,
}

impl AssignedBuffer {
    /// Buffer ID.
    #[must_use]
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Buffer capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.pool.inner.buffer_size
    }

    /// Copy `data` into the buffer at `offset`.
    ///
    /// Overlapping writes overwrite earlier bytes (last write wins).
    #[allow(unsafe_code)]
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> PoolResult<()> {
        let inner = &self.pool.inner;
        let capacity = inner.buffer_size;
        let end = offset.checked_add(data.len()).filter(|&end| end <= capacity);
        let Some(end) = end else {
            return Err(PoolError::OutOfBounds {
                id: self.id,
                offset,
                len: data.len(),
                capacity,
            });
        };

        let _slot = inner.slot_lock(self.id)?.write();
        {
            let mut state = inner.state.lock();
            let meta = state.meta_mut(self.id)?;
            if meta.generation != self.generation {
                return Err(PoolError::StaleHandle { id: self.id });
            }
            if meta.state != BufferState::Assigned {
                return Err(PoolError::InvalidTransition {
                    id: self.id,
                    from: meta.state,
                    to: BufferState::Assigned,
                });
            }
            meta.len = meta.len.max(end);
        }

        // SAFETY: the slot write lock is held, the generation proves this
        // handle still owns the slot, and offset + len <= buffer_size.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                inner.slot_ptr(self.id).add(offset),
                data.len(),
            );
        }
        Ok(())
    }

    /// Bytes written so far (high-water mark of `offset + len`).
    pub fn len(&self) -> PoolResult<usize> {
        Ok(self.pool.inner.state.lock().meta(self.id)?.len)
    }

    /// True if nothing has been written yet.
    pub fn is_empty(&self) -> PoolResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Transition to `Ready`, consuming the writer.
    pub fn mark_ready(self) -> PoolResult<BufferHandle> {
        let meta = self.pool.inner.transition(
            self.id,
            &[BufferState::Assigned],
            BufferState::Ready,
            Some(self.generation),
        )?;
        Ok(self.pool.handle(self.id, meta))
    }

    /// Return the buffer to `Free` without publishing it.
    pub fn release(self) -> PoolResult<()> {
        self.pool.inner.transition(
            self.id,
            &[BufferState::Assigned],
            BufferState::Free,
            Some(self.generation),
        )?;
        Ok(())
    }
}

/// Read-only handle to a `Ready` buffer.
///
/// Carries the ID and byte length a consumer needs; [`read`](Self::read)
/// borrows the bytes in place.
#[derive(Debug, Clone)]
pub struct BufferHandle {
    pool: SharedBufferPool,
    id: BufferId,
    len: usize,
    generation: u64,
}

impl BufferHandle {
    /// Buffer ID.
    #[must_use]
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Number of valid bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the buffer holds no data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrow the buffer contents.
    ///
    /// Fails with [`PoolError::StaleHandle`] if the buffer was released (and
    /// possibly reallocated) since this handle was created.
    #[allow(unsafe_code)]
    pub fn read(&self) -> PoolResult<BufferReadGuard<'_>> {
        let inner = &self.pool.inner;
        let guard = inner.slot_lock(self.id)?.read();
        {
            let state = inner.state.lock();
            let meta = state.meta(self.id)?;
            if meta.generation != self.generation || meta.state != BufferState::Ready {
                return Err(PoolError::StaleHandle { id: self.id });
            }
        }

        // SAFETY: the slot read lock is held for the guard's lifetime, the
        // buffer is Ready (no writer exists), and len <= buffer_size.
        let bytes = unsafe { std::slice::from_raw_parts(inner.slot_ptr(self.id), self.len) };

        Ok(BufferReadGuard {
            _guard: guard,
            bytes,
        })
    }

    /// Return the buffer to the pool.
    pub fn release(self) -> PoolResult<()> {
        self.pool.inner.transition(
            self.id,
            &[BufferState::Ready],
            BufferState::Free,
            Some(self.generation),
        )?;
        Ok(())
    }
}

/// Borrowed view of a `Ready` buffer's bytes.
pub struct BufferReadGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
    bytes: &'a [u8],
}

impl Deref for BufferReadGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.bytes
    }
}

impl AsRef<[u8]> for BufferReadGuard<'_> {
    fn as_ref(&self) -> &[u8] {
        self.bytes
    }
}
