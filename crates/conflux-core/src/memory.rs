//! Shared memory views.
//!
//! This is the only place the crate turns raw memory into typed references.
//! A [`MemRegion`] is a reference-counted byte range inside either a zeroed heap
//! block or a memory-mapped file descriptor. A [`SharedRef<T>`] is a typed view
//! of a region for `#[repr(C)]` structs whose fields are all atomics, so both
//! sides of a process boundary can touch them through `&T`.

use crate::error::{Error, Result};
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::alloc::{self, Layout};
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::os::fd::{AsRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::Arc;

/// Alignment of heap allocated regions.
pub const HEAP_ALIGN: usize = 64;

/// Marker for types that may be viewed inside shared memory.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, valid for the all-zero bit pattern and for
/// any bit pattern another process may write, and only mutated through atomic
/// fields.
pub unsafe trait ShmSafe: Send + Sync + 'static {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapAccess {
    Read,
    ReadWrite,
}

enum Storage {
    Heap(Layout),
    Mapped(MmapMut),
    MappedReadOnly(Mmap),
}

struct Block {
    ptr: NonNull<u8>,
    storage: Storage,
    fd: Option<Arc<OwnedFd>>,
    file_offset: u64,
}

// SAFETY: the block owns its allocation or mapping for its whole lifetime; all
// concurrent access goes through raw pointers with single-writer discipline.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Drop for Block {
    fn drop(&mut self) {
        if let Storage::Heap(layout) = self.storage {
            // SAFETY: allocated in `MemRegion::alloc` with this layout.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

/// A byte range inside heap or fd-backed memory.
#[derive(Clone)]
pub struct MemRegion {
    block: Arc<Block>,
    offset: usize,
    len: usize,
}

impl MemRegion {
    /// Allocates `len` zeroed bytes aligned to [`HEAP_ALIGN`].
    pub fn alloc(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidMemory("zero sized allocation".into()));
        }
        let layout = Layout::from_size_align(len, HEAP_ALIGN)
            .map_err(|e| Error::InvalidMemory(e.to_string()))?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| Error::InvalidMemory("allocation failed".into()))?;
        Ok(Self {
            block: Arc::new(Block {
                ptr,
                storage: Storage::Heap(layout),
                fd: None,
                file_offset: 0,
            }),
            offset: 0,
            len,
        })
    }

    /// Maps `len` bytes of `fd` starting at `file_offset`.
    pub fn map_fd(fd: Arc<OwnedFd>, file_offset: u64, len: usize, access: MapAccess) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidMemory("zero sized mapping".into()));
        }
        let mut opts = MmapOptions::new();
        opts.offset(file_offset).len(len);

        let (ptr, storage) = match access {
            MapAccess::ReadWrite => {
                // SAFETY: the fd stays open for the life of the block; the
                // mapping is shared and accessed only through raw pointers.
                let mut map = unsafe { opts.map_mut(&*fd) }?;
                (map.as_mut_ptr(), Storage::Mapped(map))
            }
            MapAccess::Read => {
                // SAFETY: as above.
                let map = unsafe { opts.map(&*fd) }?;
                (map.as_ptr() as *mut u8, Storage::MappedReadOnly(map))
            }
        };
        let ptr = NonNull::new(ptr).ok_or_else(|| Error::InvalidMemory("null mapping".into()))?;

        Ok(Self {
            block: Arc::new(Block {
                ptr,
                storage,
                fd: Some(fd),
                file_offset,
            }),
            offset: 0,
            len,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        // SAFETY: offset is within the block by construction.
        unsafe { self.block.ptr.as_ptr().add(self.offset) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_writable(&self) -> bool {
        !matches!(self.block.storage, Storage::MappedReadOnly(_))
    }

    pub fn is_aligned(&self, align: usize) -> bool {
        align == 0 || (self.as_ptr() as usize) % align == 0
    }

    /// Sub-range of this region sharing the same backing.
    pub fn slice(&self, offset: usize, len: usize) -> Result<Self> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| Error::InvalidMemory("range overflow".into()))?;
        if end > self.len {
            return Err(Error::InvalidMemory(format!(
                "range {}..{} outside region of {} bytes",
                offset, end, self.len
            )));
        }
        Ok(Self {
            block: Arc::clone(&self.block),
            offset: self.offset + offset,
            len,
        })
    }

    /// The backing file descriptor, when the region can be shared with another process.
    pub fn fd(&self) -> Option<&Arc<OwnedFd>> {
        self.block.fd.as_ref()
    }

    /// Offset of this region inside its backing file.
    pub fn file_offset(&self) -> Option<u64> {
        self.block
            .fd
            .as_ref()
            .map(|_| self.block.file_offset + self.offset as u64)
    }

    /// Typed view at `offset`.
    pub fn view<T: ShmSafe>(&self, offset: usize) -> Result<SharedRef<T>> {
        let region = self.slice(offset, std::mem::size_of::<T>())?;
        if !region.is_aligned(std::mem::align_of::<T>()) {
            return Err(Error::InvalidMemory(format!(
                "offset {} is not aligned to {}",
                offset,
                std::mem::align_of::<T>()
            )));
        }
        Ok(SharedRef {
            region,
            _marker: PhantomData,
        })
    }

    /// Copies `data` into the region at `offset`. Caller must ensure single-writer.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        let dst = self.slice(offset, data.len())?;
        if !dst.is_writable() {
            return Err(Error::InvalidMemory("region is read-only".into()));
        }
        // SAFETY: bounds checked above; `data` cannot overlap mapped memory we own.
        unsafe { std::ptr::copy(data.as_ptr(), dst.as_ptr(), data.len()) };
        Ok(())
    }

    /// Copies bytes at `offset` into `out`.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let src = self.slice(offset, out.len())?;
        // SAFETY: bounds checked above.
        unsafe { std::ptr::copy(src.as_ptr(), out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    pub fn ptr_eq(a: &MemRegion, b: &MemRegion) -> bool {
        a.as_ptr() == b.as_ptr() && a.len == b.len
    }
}

impl fmt::Debug for MemRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemRegion")
            .field("ptr", &self.as_ptr())
            .field("len", &self.len)
            .field("fd", &self.block.fd.as_ref().map(|fd| fd.as_raw_fd()))
            .finish()
    }
}

/// Typed view of a [`ShmSafe`] struct inside a [`MemRegion`].
pub struct SharedRef<T: ShmSafe> {
    region: MemRegion,
    _marker: PhantomData<T>,
}

impl<T: ShmSafe> SharedRef<T> {
    /// Zeroed heap-backed instance.
    pub fn alloc() -> Result<Self> {
        MemRegion::alloc(std::mem::size_of::<T>().max(1))?.view(0)
    }

    pub fn region(&self) -> &MemRegion {
        &self.region
    }

    pub fn ptr_eq(a: &SharedRef<T>, b: &SharedRef<T>) -> bool {
        a.region.as_ptr() == b.region.as_ptr()
    }
}

impl<T: ShmSafe> Clone for SharedRef<T> {
    fn clone(&self) -> Self {
        Self {
            region: self.region.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: ShmSafe> Deref for SharedRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: size and alignment checked in `MemRegion::view`; `T: ShmSafe`
        // is valid for any bit pattern and only mutated through atomics.
        unsafe { &*(self.region.as_ptr() as *const T) }
    }
}

impl<T: ShmSafe + fmt::Debug> fmt::Debug for SharedRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[repr(C)]
    #[derive(Debug)]
    struct Cell {
        a: AtomicU32,
        b: AtomicU32,
    }
    unsafe impl ShmSafe for Cell {}

    #[test]
    fn test_alloc_is_zeroed_and_aligned() {
        let r = MemRegion::alloc(256).unwrap();
        assert!(r.is_aligned(HEAP_ALIGN));
        let mut out = [1u8; 256];
        r.read_bytes(0, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
        assert!(r.fd().is_none());
    }

    #[test]
    fn test_slice_bounds() {
        let r = MemRegion::alloc(64).unwrap();
        assert!(r.slice(32, 32).is_ok());
        assert!(matches!(r.slice(32, 33), Err(Error::InvalidMemory(_))));
        assert!(r.slice(usize::MAX, 2).is_err());
    }

    #[test]
    fn test_views_share_memory() {
        let r = MemRegion::alloc(64).unwrap();
        let v1 = r.view::<Cell>(8).unwrap();
        let v2 = r.view::<Cell>(8).unwrap();
        v1.b.store(7, Ordering::Relaxed);
        assert_eq!(v2.b.load(Ordering::Relaxed), 7);
        assert!(SharedRef::ptr_eq(&v1, &v2));
        assert!(r.view::<Cell>(2).is_err());
        assert!(r.view::<Cell>(60).is_err());
    }

    #[test]
    fn test_map_fd_shares_with_second_mapping() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(4096).unwrap();
        let fd = Arc::new(OwnedFd::from(file));

        let a = MemRegion::map_fd(Arc::clone(&fd), 0, 4096, MapAccess::ReadWrite).unwrap();
        let b = MemRegion::map_fd(Arc::clone(&fd), 0, 4096, MapAccess::Read).unwrap();
        a.write_bytes(100, &[1, 2, 3]).unwrap();

        let mut out = [0u8; 3];
        b.read_bytes(100, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
        assert!(!b.is_writable());
        assert!(b.write_bytes(0, &[1]).is_err());
        assert_eq!(a.slice(128, 16).unwrap().file_offset(), Some(128));
    }
}
