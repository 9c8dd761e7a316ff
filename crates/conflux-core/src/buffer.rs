//! Buffer descriptors: data planes, chunks and metadata.

use crate::error::{Error, Result};
use crate::memory::{MemRegion, SharedRef, ShmSafe};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

pub const ID_INVALID: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkFlags(i32);

impl ChunkFlags {
    pub const NONE: ChunkFlags = ChunkFlags(0);
    pub const CORRUPTED: ChunkFlags = ChunkFlags(1 << 0);
    pub const EMPTY: ChunkFlags = ChunkFlags(1 << 1);

    pub const fn bits(self) -> i32 {
        self.0
    }

    pub const fn contains(self, other: ChunkFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets or clears `flag`, leaving other bits alone.
    pub const fn update(self, flag: ChunkFlags, set: bool) -> Self {
        if set {
            ChunkFlags(self.0 | flag.0)
        } else {
            ChunkFlags(self.0 & !flag.0)
        }
    }
}

/// Valid region of one data plane, written by the producer every cycle.
#[repr(C)]
#[derive(Debug, Default)]
pub struct Chunk {
    offset: AtomicU32,
    size: AtomicU32,
    stride: AtomicI32,
    flags: AtomicI32,
}

// SAFETY: repr(C), atomics only.
unsafe impl ShmSafe for Chunk {}

impl Chunk {
    pub fn offset(&self) -> u32 {
        self.offset.load(Ordering::Acquire)
    }

    pub fn size(&self) -> u32 {
        self.size.load(Ordering::Acquire)
    }

    pub fn stride(&self) -> i32 {
        self.stride.load(Ordering::Acquire)
    }

    pub fn flags(&self) -> ChunkFlags {
        ChunkFlags(self.flags.load(Ordering::Acquire))
    }

    pub fn set(&self, offset: u32, size: u32, stride: i32, flags: ChunkFlags) {
        self.offset.store(offset, Ordering::Relaxed);
        self.size.store(size, Ordering::Relaxed);
        self.stride.store(stride, Ordering::Relaxed);
        self.flags.store(flags.0, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DataFlags(u32);

impl DataFlags {
    pub const NONE: DataFlags = DataFlags(0);
    pub const READABLE: DataFlags = DataFlags(1 << 0);
    pub const WRITABLE: DataFlags = DataFlags(1 << 1);
    /// The plane's memory may be swapped for another buffer's memory.
    pub const DYNAMIC: DataFlags = DataFlags(1 << 2);
    pub const READWRITE: DataFlags = DataFlags((1 << 0) | (1 << 1));
    pub const MAPPABLE: DataFlags = DataFlags(1 << 3);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        DataFlags(bits)
    }

    pub const fn contains(self, other: DataFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: DataFlags) -> Self {
        DataFlags(self.0 | other.0)
    }
}

/// Where a data plane's memory lives.
#[derive(Debug, Clone)]
pub enum DataKind {
    /// Plain memory addressed through [`Data::memory`].
    MemPtr,
    /// Shared memory file descriptor.
    MemFd { fd: Arc<OwnedFd>, mapoffset: u32 },
    /// DMA-BUF descriptor.
    DmaBuf { fd: Arc<OwnedFd>, mapoffset: u32 },
}

impl DataKind {
    pub fn fd(&self) -> Option<&Arc<OwnedFd>> {
        match self {
            DataKind::MemPtr => None,
            DataKind::MemFd { fd, .. } | DataKind::DmaBuf { fd, .. } => Some(fd),
        }
    }

    pub fn mapoffset(&self) -> u32 {
        match self {
            DataKind::MemPtr => 0,
            DataKind::MemFd { mapoffset, .. } | DataKind::DmaBuf { mapoffset, .. } => *mapoffset,
        }
    }
}

/// One data plane of a buffer.
#[derive(Debug, Clone)]
pub struct Data {
    pub kind: DataKind,
    pub flags: DataFlags,
    pub maxsize: u32,
    /// Mapped memory of the plane. `None` until mapped for fd kinds.
    pub memory: Option<MemRegion>,
    pub chunk: SharedRef<Chunk>,
}

impl Data {
    /// Plane backed by `memory`, with a chunk of its own.
    pub fn with_memory(memory: MemRegion, flags: DataFlags) -> Result<Self> {
        let maxsize = u32::try_from(memory.len())
            .map_err(|_| Error::InvalidMemory("plane larger than 4 GiB".into()))?;
        Ok(Self {
            kind: DataKind::MemPtr,
            flags,
            maxsize,
            memory: Some(memory),
            chunk: SharedRef::alloc()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetaType {
    Header,
    VideoCrop,
    Busy,
}

impl MetaType {
    pub const fn id(self) -> u32 {
        match self {
            MetaType::Header => 1,
            MetaType::VideoCrop => 2,
            MetaType::Busy => 7,
        }
    }
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct MetaHeader {
    pub flags: AtomicU32,
    pub offset: AtomicU32,
    pub pts: AtomicI64,
    pub dts_offset: AtomicI64,
    pub seq: AtomicU64,
}

// SAFETY: repr(C), atomics only.
unsafe impl ShmSafe for MetaHeader {}

#[derive(Debug, Clone)]
pub struct Meta {
    pub kind: MetaType,
    pub memory: MemRegion,
}

impl Meta {
    pub fn header(&self) -> Option<SharedRef<MetaHeader>> {
        match self.kind {
            MetaType::Header => self.memory.view(0).ok(),
            _ => None,
        }
    }
}

/// Public buffer descriptor.
#[derive(Debug, Clone, Default)]
pub struct Buffer {
    pub metas: SmallVec<[Meta; 2]>,
    pub datas: SmallVec<[Data; 2]>,
}

impl Buffer {
    pub fn find_meta(&self, kind: MetaType) -> Option<&Meta> {
        self.metas.iter().find(|m| m.kind == kind)
    }
}

/// Caller-visible cell holding the current descriptor of one buffer.
///
/// A node may point the cell at another buffer's descriptor for a cycle
/// (zero-copy pass-through) and later restore its own.
#[derive(Debug)]
pub struct BufferSlot {
    current: ArcSwap<Buffer>,
}

impl BufferSlot {
    pub fn new(buffer: Buffer) -> Self {
        Self {
            current: ArcSwap::from_pointee(buffer),
        }
    }

    pub fn load(&self) -> Arc<Buffer> {
        self.current.load_full()
    }

    pub fn store(&self, buffer: Arc<Buffer>) {
        self.current.store(buffer);
    }

    /// Whether both cells currently show the same descriptor.
    pub fn shows_same(a: &BufferSlot, b: &BufferSlot) -> bool {
        Arc::ptr_eq(&a.current.load(), &b.current.load())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_set() {
        let chunk = SharedRef::<Chunk>::alloc().unwrap();
        chunk.set(16, 256, 8, ChunkFlags::EMPTY);
        assert_eq!(chunk.offset(), 16);
        assert_eq!(chunk.size(), 256);
        assert_eq!(chunk.stride(), 8);
        assert!(chunk.flags().contains(ChunkFlags::EMPTY));
    }

    #[test]
    fn test_slot_aliasing() {
        let a = Buffer {
            datas: [Data::with_memory(MemRegion::alloc(64).unwrap(), DataFlags::READWRITE).unwrap()]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let slot_a = BufferSlot::new(a);
        let slot_b = BufferSlot::new(Buffer::default());
        assert!(!BufferSlot::shows_same(&slot_a, &slot_b));

        slot_b.store(slot_a.load());
        assert!(BufferSlot::shows_same(&slot_a, &slot_b));
    }

    #[test]
    fn test_meta_header_view() {
        let meta = Meta {
            kind: MetaType::Header,
            memory: MemRegion::alloc(std::mem::size_of::<MetaHeader>()).unwrap(),
        };
        let header = meta.header().unwrap();
        header.seq.store(5, Ordering::Relaxed);
        assert_eq!(meta.header().unwrap().seq.load(Ordering::Relaxed), 5);
    }
}
