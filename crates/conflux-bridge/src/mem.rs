//! Memory id bookkeeping on both ends of the bridge.
//!
//! The host numbers every fd it shares ([`MemRegistry`]); the remote keeps
//! one mapping per announced id ([`MemMap`]).

use crate::error::{BridgeError, Result};
use crate::protocol::{MemRef, MemType};
use conflux_core::{MapAccess, MemRegion};
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use tracing::{debug, trace};

/// `flags` bits of `AddMem`.
pub mod mem_flags {
    pub const READABLE: u32 = 1 << 0;
    pub const WRITABLE: u32 = 1 << 1;
    pub const READWRITE: u32 = READABLE | WRITABLE;
}

fn file_stat(fd: &OwnedFd) -> io::Result<libc::stat> {
    // SAFETY: stat is plain old data and fstat fills it on success.
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd.as_raw_fd(), &mut st) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(st)
}

/// Identity of the file behind a descriptor; dups of one fd share it.
fn file_key(fd: &OwnedFd) -> io::Result<(u64, u64)> {
    let st = file_stat(fd)?;
    Ok((st.st_dev as u64, st.st_ino as u64))
}

#[derive(Debug)]
struct MemEntry {
    key: (u64, u64),
    fd: Arc<OwnedFd>,
    mem_type: MemType,
    flags: u32,
    refs: u32,
}

/// Host-side table of shared memory ids.
///
/// Ids are slots: a slot whose count dropped to zero keeps its mapping on the
/// remote and is handed out again, to the same file or a new one.
#[derive(Debug, Default)]
pub struct MemRegistry {
    entries: Vec<MemEntry>,
}

impl MemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a reference on the id of `fd`. Returns the id and whether it must
    /// be announced to the remote.
    pub fn ensure_mem(&mut self, fd: &Arc<OwnedFd>, mem_type: MemType, flags: u32) -> Result<(u32, bool)> {
        let key = file_key(fd)?;

        if let Some(id) = self
            .entries
            .iter()
            .position(|e| e.key == key && e.mem_type == mem_type && e.flags == flags)
        {
            self.entries[id].refs += 1;
            return Ok((id as u32, false));
        }

        let entry = MemEntry {
            key,
            fd: Arc::clone(fd),
            mem_type,
            flags,
            refs: 1,
        };
        let id = match self.entries.iter().position(|e| e.refs == 0) {
            Some(free) => {
                debug!("reusing mem id {}", free);
                self.entries[free] = entry;
                free
            }
            None => {
                self.entries.push(entry);
                self.entries.len() - 1
            }
        };
        Ok((id as u32, true))
    }

    /// Drops one reference. Unknown ids and ids already at zero are ignored.
    pub fn release(&mut self, mem_id: u32) {
        if let Some(e) = self.entries.get_mut(mem_id as usize) {
            if e.refs > 0 {
                e.refs -= 1;
                trace!("mem id {} now has {} refs", mem_id, e.refs);
            }
        }
    }

    pub fn refs(&self, mem_id: u32) -> u32 {
        self.entries
            .get(mem_id as usize)
            .map(|e| e.refs)
            .unwrap_or(0)
    }

    pub fn fd(&self, mem_id: u32) -> Option<&Arc<OwnedFd>> {
        self.entries.get(mem_id as usize).map(|e| &e.fd)
    }

    /// Ids with at least one reference.
    pub fn in_use(&self) -> usize {
        self.entries.iter().filter(|e| e.refs > 0).count()
    }
}

#[derive(Debug)]
struct Mapping {
    fd: Arc<OwnedFd>,
    mem_type: MemType,
    flags: u32,
    map: Option<MemRegion>,
}

/// Remote-side view of the host's memory ids. Each file is mapped whole,
/// once, the first time a range of it is needed.
#[derive(Debug, Default)]
pub struct MemMap {
    mems: HashMap<u32, Mapping>,
}

impl MemMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `fd` under `mem_id`, replacing an earlier announcement.
    pub fn add(&mut self, mem_id: u32, mem_type: MemType, flags: u32, fd: OwnedFd) {
        if self.mems.contains_key(&mem_id) {
            debug!("mem id {} replaced", mem_id);
        }
        self.mems.insert(
            mem_id,
            Mapping {
                fd: Arc::new(fd),
                mem_type,
                flags,
                map: None,
            },
        );
    }

    pub fn remove(&mut self, mem_id: u32) -> bool {
        self.mems.remove(&mem_id).is_some()
    }

    pub fn fd(&self, mem_id: u32) -> Result<Arc<OwnedFd>> {
        self.mems
            .get(&mem_id)
            .map(|m| Arc::clone(&m.fd))
            .ok_or_else(|| BridgeError::ProtocolError(format!("unknown mem id {}", mem_id)))
    }

    pub fn mem_type(&self, mem_id: u32) -> Option<MemType> {
        self.mems.get(&mem_id).map(|m| m.mem_type)
    }

    /// The bytes `r` points at.
    pub fn region(&mut self, r: &MemRef) -> Result<MemRegion> {
        let mapping = self
            .mems
            .get_mut(&r.mem_id)
            .ok_or_else(|| BridgeError::ProtocolError(format!("unknown mem id {}", r.mem_id)))?;

        if mapping.map.is_none() {
            let size = file_stat(&mapping.fd)?.st_size as usize;
            let access = if mapping.flags & mem_flags::WRITABLE != 0 {
                MapAccess::ReadWrite
            } else {
                MapAccess::Read
            };
            let map = MemRegion::map_fd(Arc::clone(&mapping.fd), 0, size, access).map_err(|e| {
                BridgeError::SharedMemoryError(format!("failed to map mem id {}: {}", r.mem_id, e))
            })?;
            debug!("mapped mem id {} ({} bytes)", r.mem_id, size);
            mapping.map = Some(map);
        }
        let map = mapping
            .map
            .as_ref()
            .ok_or_else(|| BridgeError::SharedMemoryError(format!("mem id {} is not mapped", r.mem_id)))?;
        Ok(map.slice(r.offset as usize, r.size as usize)?)
    }

    pub fn len(&self) -> usize {
        self.mems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mems.is_empty()
    }
}
