//! Fixed-layout buffer pool, optionally backed by shared memory.
//!
//! The backing region is `(buffer_size + page_size) * buffer_count + page_size`
//! bytes. Slot `i` starts at `page_size + i * (buffer_size + page_size)`, so
//! every slot is page aligned and separated from its neighbours by a guard
//! page worth of padding.

use std::ptr::NonNull;

use serde::{Deserialize, Serialize};
use tracing::debug;

#[cfg(unix)]
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use crate::{AllocError, DEFAULT_BUFFER_COUNT, DEFAULT_BUFFER_SIZE};

/// Pool dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub buffer_size: usize,
    pub buffer_count: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            buffer_count: DEFAULT_BUFFER_COUNT,
        }
    }
}

impl PoolConfig {
    /// Total bytes of backing memory for this layout with the given page size.
    pub fn region_size(&self, page_size: usize) -> Result<usize, AllocError> {
        if self.buffer_size == 0 || self.buffer_count == 0 {
            return Err(AllocError::InvalidLayout(format!(
                "{} buffers of {} bytes",
                self.buffer_count, self.buffer_size
            )));
        }
        self.buffer_size
            .checked_add(page_size)
            .and_then(|stride| stride.checked_mul(self.buffer_count))
            .and_then(|n| n.checked_add(page_size))
            .ok_or_else(|| AllocError::InvalidLayout("region size overflows".into()))
    }
}

/// A slot in the pool: where it starts and how much it can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferView {
    /// Byte offset of the slot from the start of the region.
    pub offset: usize,
    /// Number of valid bytes. Always zero for views handed out by the pool.
    pub len: usize,
    pub capacity: usize,
}

/// Platform handle of a shared region.
#[cfg(unix)]
pub type ShmHandle<'a> = BorrowedFd<'a>;
#[cfg(not(unix))]
pub type ShmHandle<'a> = std::marker::PhantomData<&'a ()>;

/// What a peer process needs to map the pool.
#[derive(Debug, Clone, Copy)]
pub struct SharedMemoryInfo<'a> {
    /// `None` when the pool is not in shared memory.
    pub handle: Option<ShmHandle<'a>>,
    pub base: *const u8,
    pub size: usize,
}

enum Backing {
    Heap {
        ptr: NonNull<u8>,
        len: usize,
    },
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Shared {
        fd: OwnedFd,
        ptr: NonNull<u8>,
        len: usize,
    },
}

impl Backing {
    fn base(&self) -> NonNull<u8> {
        match self {
            Backing::Heap { ptr, .. } => *ptr,
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backing::Shared { ptr, .. } => *ptr,
        }
    }

    fn len(&self) -> usize {
        match self {
            Backing::Heap { len, .. } => *len,
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backing::Shared { len, .. } => *len,
        }
    }
}

impl Drop for Backing {
    fn drop(&mut self) {
        match self {
            Backing::Heap { ptr, len } => {
                // SAFETY: ptr/len came from Box::into_raw of a boxed slice of that length.
                unsafe {
                    drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                        ptr.as_ptr(),
                        *len,
                    )));
                }
            }
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backing::Shared { ptr, len, .. } => {
                // SAFETY: the mapping is owned by this value and unmapped once.
                unsafe {
                    let _ = rustix::mm::munmap(ptr.as_ptr().cast(), *len);
                }
            }
        }
    }
}

/// Owns the memory behind a reader's or writer's buffer ring.
pub struct BufferPool {
    config: PoolConfig,
    page_size: usize,
    backing: Option<Backing>,
    views: Vec<BufferView>,
}

// SAFETY: the pool only hands out raw slot access through unsafe accessors
// whose callers uphold the ring's ownership rules.
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("config", &self.config)
            .field("page_size", &self.page_size)
            .field("allocated", &self.is_allocated())
            .field("shared", &self.is_shared())
            .finish()
    }
}

impl BufferPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            page_size: page_size(),
            backing: None,
            views: Vec::new(),
        }
    }

    /// Reserves the backing memory. Calling it again after success is a no-op.
    ///
    /// Shared mode never falls back to private memory: failure is reported.
    pub fn allocate(&mut self, use_shared_memory: bool) -> Result<(), AllocError> {
        if self.backing.is_some() {
            return Ok(());
        }

        let len = self.config.region_size(self.page_size)?;
        let backing = if use_shared_memory {
            allocate_shared(len)?
        } else {
            allocate_heap(len)
        };

        let stride = self.config.buffer_size + self.page_size;
        self.views = (0..self.config.buffer_count)
            .map(|i| BufferView {
                offset: self.page_size + i * stride,
                len: 0,
                capacity: self.config.buffer_size,
            })
            .collect();
        self.backing = Some(backing);

        debug!(
            buffers = self.config.buffer_count,
            buffer_size = self.config.buffer_size,
            total = len,
            shared = use_shared_memory,
            "buffer pool allocated"
        );
        Ok(())
    }

    pub fn config(&self) -> PoolConfig {
        self.config
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn buffer_size(&self) -> usize {
        self.config.buffer_size
    }

    pub fn buffer_count(&self) -> usize {
        self.config.buffer_count
    }

    pub fn is_allocated(&self) -> bool {
        self.backing.is_some()
    }

    pub fn is_shared(&self) -> bool {
        match &self.backing {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Some(Backing::Shared { .. }) => true,
            _ => false,
        }
    }

    /// Size of the backing region, zero before allocation.
    pub fn total_size(&self) -> usize {
        self.backing.as_ref().map_or(0, Backing::len)
    }

    /// Empty views of every slot, in ring order.
    pub fn views(&self) -> &[BufferView] {
        &self.views
    }

    pub fn view(&self, index: usize) -> Option<BufferView> {
        self.views.get(index).copied()
    }

    pub fn shared_memory_info(&self) -> SharedMemoryInfo<'_> {
        let (base, size) = match &self.backing {
            Some(b) => (b.base().as_ptr().cast_const(), b.len()),
            None => (std::ptr::null(), 0),
        };
        SharedMemoryInfo {
            handle: self.shm_handle(),
            base,
            size,
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn shm_handle(&self) -> Option<ShmHandle<'_>> {
        match &self.backing {
            Some(Backing::Shared { fd, .. }) => Some(fd.as_fd()),
            _ => None,
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn shm_handle(&self) -> Option<ShmHandle<'_>> {
        None
    }

    /// Read access to the first `len` bytes of a slot.
    ///
    /// # Safety
    ///
    /// The pool must be allocated, `index` in range, `len <= buffer_size`, and
    /// no one may write the slot while the returned slice lives.
    pub(crate) unsafe fn slot(&self, index: usize, len: usize) -> &[u8] {
        debug_assert!(len <= self.config.buffer_size);
        // SAFETY: upheld by the caller.
        unsafe { std::slice::from_raw_parts(self.slot_ptr(index), len) }
    }

    /// Write access to a whole slot.
    ///
    /// # Safety
    ///
    /// The pool must be allocated, `index` in range, and the caller must be
    /// the only one touching the slot while the returned slice lives.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slot_mut(&self, index: usize) -> &mut [u8] {
        // SAFETY: upheld by the caller.
        unsafe { std::slice::from_raw_parts_mut(self.slot_ptr(index), self.config.buffer_size) }
    }

    fn slot_ptr(&self, index: usize) -> *mut u8 {
        let view = self.views[index];
        let base = self
            .backing
            .as_ref()
            .map(Backing::base)
            .unwrap_or(NonNull::dangling());
        // SAFETY: view offsets lie inside the region by construction.
        unsafe { base.as_ptr().add(view.offset) }
    }
}

fn allocate_heap(len: usize) -> Backing {
    let raw = Box::into_raw(vec![0u8; len].into_boxed_slice());
    // SAFETY: Box::into_raw never returns null.
    let ptr = unsafe { NonNull::new_unchecked(raw.cast::<u8>()) };
    Backing::Heap { ptr, len }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn allocate_shared(len: usize) -> Result<Backing, AllocError> {
    use rustix::mm::{MapFlags, ProtFlags};

    let fd = rustix::fs::memfd_create("bulkferry-pool", rustix::fs::MemfdFlags::CLOEXEC)
        .map_err(std::io::Error::from)?;
    rustix::fs::ftruncate(&fd, len as u64).map_err(std::io::Error::from)?;

    // SAFETY: fresh mapping of a file we just sized; nothing else aliases it.
    let base = unsafe {
        rustix::mm::mmap(
            std::ptr::null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            &fd,
            0,
        )
        .map_err(std::io::Error::from)?
    };
    let ptr = NonNull::new(base.cast::<u8>()).ok_or(AllocError::EmptyMapping)?;
    Ok(Backing::Shared { fd, ptr, len })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn allocate_shared(_len: usize) -> Result<Backing, AllocError> {
    Err(AllocError::Unsupported)
}

fn page_size() -> usize {
    #[cfg(unix)]
    {
        rustix::param::page_size()
    }
    #[cfg(not(unix))]
    {
        4096
    }
}

// ---------------------------------------------------------------------------
// Peer-side mapping
// ---------------------------------------------------------------------------

/// A pool region mapped from a handle received from the owning process.
///
/// Owns only its own mapping; the owner's pool stays the owner of the memory.
#[cfg(unix)]
pub struct MappedRegion {
    _fd: OwnedFd,
    ptr: NonNull<u8>,
    len: usize,
}

#[cfg(unix)]
// SAFETY: access goes through bounds-checked copies; which side touches a slot
// is governed by the sideband protocol.
unsafe impl Send for MappedRegion {}
#[cfg(unix)]
unsafe impl Sync for MappedRegion {}

#[cfg(unix)]
impl MappedRegion {
    /// Maps the whole region behind `fd`.
    pub fn map(fd: OwnedFd) -> Result<Self, AllocError> {
        use rustix::mm::{MapFlags, ProtFlags};

        let stat = rustix::fs::fstat(&fd).map_err(std::io::Error::from)?;
        let len = usize::try_from(stat.st_size)
            .map_err(|_| AllocError::InvalidLayout(format!("region size {}", stat.st_size)))?;
        if len == 0 {
            return Err(AllocError::EmptyMapping);
        }

        // SAFETY: maps a region we own a handle to; bounds are checked on access.
        let base = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
            .map_err(std::io::Error::from)?
        };
        let ptr = NonNull::new(base.cast::<u8>()).ok_or(AllocError::EmptyMapping)?;
        Ok(Self { _fd: fd, ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies `out.len()` bytes starting at `offset`. Returns false when out of bounds.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> bool {
        if !self.in_bounds(offset, out.len()) {
            return false;
        }
        // SAFETY: range checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
        true
    }

    /// Copies `data` into the region at `offset`. Returns false when out of bounds.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> bool {
        if !self.in_bounds(offset, data.len()) {
            return false;
        }
        // SAFETY: range checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        true
    }

    fn in_bounds(&self, offset: usize, len: usize) -> bool {
        offset.checked_add(len).is_some_and(|end| end <= self.len)
    }
}

#[cfg(unix)]
impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: unmaps the mapping created in `map`.
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}
