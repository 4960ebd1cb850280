//! Backing memory region for the pool.
//!
//! A region is a single mapping laid out as a fixed 64-byte header followed by
//! `buffer_count * buffer_size` bytes of buffer storage:
//!
//! ```text
//! offset 0   magic "FRAMEPOL" (u64 LE)
//! offset 8   layout version (u32 LE)
//! offset 16  buffer_count (u64 LE)
//! offset 24  buffer_size (u64 LE)
//! offset 64  buffer 0, buffer 1, ...
//! ```
//!
//! Anonymous regions are private to the process. Named regions are backed by a
//! file in [`shared_memory_dir`] so a consumer in another process can map the
//! same bytes with [`RegionView`] and locate a buffer from its ID alone.

use crate::{BufferId, PoolError, PoolResult};
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic number at the start of every region.
pub const REGION_MAGIC: u64 = u64::from_le_bytes(*b"FRAMEPOL");

/// Version of the header layout written by this crate.
pub const LAYOUT_VERSION: u32 = 1;

/// Bytes reserved for the header before buffer 0.
pub const HEADER_SIZE: usize = 64;

/// Geometry recorded at the start of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionHeader {
    /// Number of buffers in the region.
    pub buffer_count: usize,
    /// Size of each buffer in bytes.
    pub buffer_size: usize,
}

impl RegionHeader {
    /// Total mapping length (header plus all buffers).
    pub fn region_len(&self) -> PoolResult<usize> {
        if self.buffer_count == 0 || self.buffer_size == 0 {
            return Err(PoolError::InvalidGeometry(format!(
                "buffer_count ({}) and buffer_size ({}) must be > 0",
                self.buffer_count, self.buffer_size
            )));
        }
        self.buffer_count
            .checked_mul(self.buffer_size)
            .and_then(|data| data.checked_add(HEADER_SIZE))
            .ok_or_else(|| {
                PoolError::InvalidGeometry(format!(
                    "{} buffers of {} bytes overflow the address space",
                    self.buffer_count, self.buffer_size
                ))
            })
    }

    fn encode(&self, out: &mut [u8]) {
        out[..HEADER_SIZE].fill(0);
        out[0..8].copy_from_slice(&REGION_MAGIC.to_le_bytes());
        out[8..12].copy_from_slice(&LAYOUT_VERSION.to_le_bytes());
        out[16..24].copy_from_slice(&(self.buffer_count as u64).to_le_bytes());
        out[24..32].copy_from_slice(&(self.buffer_size as u64).to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> PoolResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(PoolError::HeaderMismatch(format!(
                "region is {} bytes, shorter than the {} byte header",
                bytes.len(),
                HEADER_SIZE
            )));
        }
        let magic = read_u64(&bytes[0..8]);
        if magic != REGION_MAGIC {
            return Err(PoolError::HeaderMismatch(format!("bad magic {:#018x}", magic)));
        }
        let version = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        if version != LAYOUT_VERSION {
            return Err(PoolError::HeaderMismatch(format!(
                "layout version {} (expected {})",
                version, LAYOUT_VERSION
            )));
        }
        let to_usize = |value: u64| {
            usize::try_from(value)
                .map_err(|_| PoolError::HeaderMismatch(format!("value {} overflows usize", value)))
        };
        Ok(Self {
            buffer_count: to_usize(read_u64(&bytes[16..24]))?,
            buffer_size: to_usize(read_u64(&bytes[24..32]))?,
        })
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(raw)
}

/// Directory holding named regions: `/dev/shm` on Linux, the temp dir elsewhere.
pub fn shared_memory_dir() -> PathBuf {
    let dev_shm = Path::new("/dev/shm");
    if cfg!(target_os = "linux") && dev_shm.is_dir() {
        dev_shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

fn validate_name(name: &str) -> PoolResult<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(PoolError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Writable mapping owned by a pool.
pub(crate) struct SharedRegion {
    map: MmapMut,
    path: Option<PathBuf>,
}

impl SharedRegion {
    pub(crate) fn anonymous(header: RegionHeader) -> PoolResult<Self> {
        let len = header.region_len()?;
        let mut map = MmapOptions::new().len(len).map_anon()?;
        header.encode(&mut map[..HEADER_SIZE]);
        Ok(Self { map, path: None })
    }

    #[allow(unsafe_code)]
    pub(crate) fn create_named(dir: &Path, name: &str, header: RegionHeader) -> PoolResult<Self> {
        validate_name(name)?;
        let len = header.region_len()?;
        let path = dir.join(name);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(len as u64)?;

        // SAFETY: the file was truncated and sized by this process, which is the
        // only writer. Other processes map it read-only through RegionView.
        let mut map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        header.encode(&mut map[..HEADER_SIZE]);

        debug!(path = %path.display(), len, "Created named shared region");
        Ok(Self {
            map,
            path: Some(path),
        })
    }

    /// Pointer to the first byte of buffer 0.
    pub(crate) fn data_ptr(&mut self) -> *mut u8 {
        self.map[HEADER_SIZE..].as_mut_ptr()
    }

    pub(crate) fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "Removed named shared region"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove shared region"),
            }
        }
    }
}

/// Read-only view of a named region created by another pool.
///
/// Consumers use this to reach `Ready` buffers by ID without copying. The view
/// carries no ownership state; the producing pool remains the authority on
/// which buffers are `Ready`.
pub struct RegionView {
    map: Mmap,
    header: RegionHeader,
    path: PathBuf,
}

impl RegionView {
    /// Open a named region in [`shared_memory_dir`].
    pub fn open(name: &str) -> PoolResult<Self> {
        Self::open_in(&shared_memory_dir(), name)
    }

    /// Open a named region in `dir`.
    #[allow(unsafe_code)]
    pub fn open_in(dir: &Path, name: &str) -> PoolResult<Self> {
        validate_name(name)?;
        let path = dir.join(name);
        let file = OpenOptions::new().read(true).open(&path)?;

        // SAFETY: the mapping is read-only; the producing pool only writes a
        // buffer while it is Assigned, and consumers only read Ready buffers.
        let map = unsafe { Mmap::map(&file)? };

        let header = RegionHeader::decode(&map)?;
        let expected = header.region_len()?;
        if map.len() < expected {
            return Err(PoolError::HeaderMismatch(format!(
                "region is {} bytes but header describes {}",
                map.len(),
                expected
            )));
        }

        Ok(Self { map, header, path })
    }

    /// Geometry recorded by the producer.
    pub fn header(&self) -> RegionHeader {
        self.header
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Full contents of buffer `id` (capacity, not fill length).
    pub fn buffer(&self, id: BufferId) -> PoolResult<&[u8]> {
        if id >= self.header.buffer_count {
            return Err(PoolError::UnknownBuffer(id));
        }
        let start = HEADER_SIZE + id * self.header.buffer_size;
        Ok(&self.map[start..start + self.header.buffer_size])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode() {
        let header = RegionHeader {
            buffer_count: 10,
            buffer_size: 4096,
        };
        let mut bytes = [0u8; HEADER_SIZE];
        header.encode(&mut bytes);
        assert_eq!(RegionHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let bytes = [0u8; HEADER_SIZE];
        assert!(matches!(
            RegionHeader::decode(&bytes),
            Err(PoolError::HeaderMismatch(_))
        ));
    }

    #[test]
    fn test_region_len_rejects_zero_and_overflow() {
        let zero = RegionHeader {
            buffer_count: 0,
            buffer_size: 16,
        };
        assert!(matches!(zero.region_len(), Err(PoolError::InvalidGeometry(_))));

        let huge = RegionHeader {
            buffer_count: usize::MAX,
            buffer_size: 2,
        };
        assert!(matches!(huge.region_len(), Err(PoolError::InvalidGeometry(_))));
    }

    #[test]
    fn test_invalid_names() {
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("FrameReceiverBuffer").is_ok());
    }
}
