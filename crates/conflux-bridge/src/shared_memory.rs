//! Shared memory blocks for buffers, io areas and activation records.

use crate::error::{BridgeError, Result};
use conflux_core::{
    Buffer, BufferSlot, Chunk, Data, DataFlags, DataKind, MapAccess, MemRegion, Meta, MetaHeader,
    MetaType,
};
use std::fs::OpenOptions;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Layout alignment of everything placed in a block.
pub const BLOCK_ALIGN: usize = 64;

static BLOCK_COUNTER: AtomicU32 = AtomicU32::new(0);

/// A file-backed memory block that can be handed to another process.
///
/// The creator owns the file and removes it on drop. The mapping itself lives
/// as long as any region sliced from it.
pub struct MemBlock {
    region: MemRegion,
    path: PathBuf,
    owns_memory: bool,
}

impl MemBlock {
    /// Creates a zeroed block of `size` bytes named `<prefix><pid>-<n>-<name>`.
    pub fn create(prefix: &str, name: &str, size: usize) -> Result<Self> {
        use std::os::unix::fs::OpenOptionsExt;

        if size == 0 {
            return Err(BridgeError::SharedMemoryError(
                "cannot create an empty block".into(),
            ));
        }
        let path = shm_path(&format!(
            "{}{}-{}-{}",
            prefix,
            std::process::id(),
            BLOCK_COUNTER.fetch_add(1, Ordering::Relaxed),
            name
        ));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| {
                BridgeError::SharedMemoryError(format!(
                    "Failed to create shared memory file {}: {}",
                    path.display(),
                    e
                ))
            })?;

        file.set_len(size as u64).map_err(|e| {
            BridgeError::SharedMemoryError(format!("Failed to set file size: {}", e))
        })?;

        let fd = Arc::new(OwnedFd::from(file));
        let region = MemRegion::map_fd(fd, 0, size, MapAccess::ReadWrite).map_err(|e| {
            BridgeError::SharedMemoryError(format!("Failed to create memory map: {}", e))
        })?;

        Ok(Self {
            region,
            path,
            owns_memory: true,
        })
    }

    /// Wraps a mapping received from another process. The file is left alone on drop.
    pub fn from_region(region: MemRegion) -> Self {
        Self {
            region,
            path: PathBuf::new(),
            owns_memory: false,
        }
    }

    pub fn region(&self) -> &MemRegion {
        &self.region
    }

    pub fn slice(&self, offset: usize, len: usize) -> Result<MemRegion> {
        Ok(self.region.slice(offset, len)?)
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MemBlock {
    fn drop(&mut self) {
        if self.owns_memory {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl std::fmt::Debug for MemBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBlock")
            .field("path", &self.path)
            .field("len", &self.region.len())
            .field("owns_memory", &self.owns_memory)
            .finish()
    }
}

fn shm_path(name: &str) -> PathBuf {
    #[cfg(target_os = "linux")]
    let base = PathBuf::from("/dev/shm");
    #[cfg(not(target_os = "linux"))]
    let base = std::env::temp_dir();
    base.join(name)
}

const fn align_up(n: usize) -> usize {
    (n + BLOCK_ALIGN - 1) & !(BLOCK_ALIGN - 1)
}

/// Shape of the buffers carved out by [`alloc_buffers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    pub n_datas: usize,
    pub data_size: usize,
    pub header: bool,
    pub flags: DataFlags,
}

impl BufferLayout {
    pub fn new(n_datas: usize, data_size: usize) -> Self {
        Self {
            n_datas,
            data_size,
            header: true,
            flags: DataFlags::READWRITE,
        }
    }

    fn meta_size(&self) -> usize {
        if self.header {
            align_up(std::mem::size_of::<MetaHeader>())
        } else {
            0
        }
    }

    fn chunks_size(&self) -> usize {
        align_up(self.n_datas * std::mem::size_of::<Chunk>())
    }

    /// Bytes one buffer takes: header meta, then the chunks, then the planes.
    pub fn buffer_size(&self) -> usize {
        self.meta_size() + self.chunks_size() + self.n_datas * align_up(self.data_size)
    }
}

/// Lays `n_buffers` buffers out back to back in `block`.
pub fn alloc_buffers(
    block: &MemBlock,
    n_buffers: usize,
    layout: &BufferLayout,
) -> Result<Vec<Arc<BufferSlot>>> {
    if layout.n_datas == 0 || layout.data_size == 0 {
        return Err(BridgeError::SharedMemoryError(
            "buffers need at least one non-empty plane".into(),
        ));
    }
    let maxsize = u32::try_from(layout.data_size).map_err(|_| {
        BridgeError::SharedMemoryError(format!("plane of {} bytes is too large", layout.data_size))
    })?;
    let needed = n_buffers * layout.buffer_size();
    if needed > block.len() {
        return Err(BridgeError::SharedMemoryError(format!(
            "{} buffers need {} bytes, block has {}",
            n_buffers,
            needed,
            block.len()
        )));
    }

    let mut slots = Vec::with_capacity(n_buffers);
    for b in 0..n_buffers {
        let base = b * layout.buffer_size();
        let mut buffer = Buffer::default();

        if layout.header {
            buffer.metas.push(Meta {
                kind: MetaType::Header,
                memory: block.slice(base, std::mem::size_of::<MetaHeader>())?,
            });
        }

        let chunks = base + layout.meta_size();
        let planes = chunks + layout.chunks_size();
        for d in 0..layout.n_datas {
            let chunk = block
                .region()
                .view::<Chunk>(chunks + d * std::mem::size_of::<Chunk>())?;
            buffer.datas.push(Data {
                kind: DataKind::MemPtr,
                flags: layout.flags,
                maxsize,
                memory: Some(block.slice(planes + d * align_up(layout.data_size), layout.data_size)?),
                chunk,
            });
        }
        slots.push(Arc::new(BufferSlot::new(buffer)));
    }
    Ok(slots)
}
