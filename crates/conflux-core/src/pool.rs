//! Fixed-capacity buffer pool with explicit queued/outstanding ownership.
//!
//! Buffer ids are indexes into the pool. A queued buffer is free for the
//! producer; dequeuing hands it out, queuing takes it back. The free queue is a
//! FIFO ring sized to the pool capacity, so neither operation allocates.

use crate::buffer::{Buffer, BufferSlot, MetaHeader, MetaType};
use crate::error::{Error, Result};
use crate::memory::SharedRef;
use std::sync::Arc;

pub const MAX_BUFFERS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const NONE: BufferFlags = BufferFlags(0);
    pub const QUEUED: BufferFlags = BufferFlags(1 << 0);
    /// Some data plane was mapped by the pool and is unmapped when it is dropped.
    pub const MAPPED: BufferFlags = BufferFlags(1 << 1);

    pub const fn contains(self, other: BufferFlags) -> bool {
        self.0 & other.0 == other.0
    }

    fn insert(&mut self, other: BufferFlags) {
        self.0 |= other.0;
    }

    fn remove(&mut self, other: BufferFlags) {
        self.0 &= !other.0;
    }
}

/// Pool entry: bookkeeping plus the pool's own copy of the descriptor.
#[derive(Debug)]
pub struct PoolBuffer {
    pub id: u32,
    flags: BufferFlags,
    /// The caller's cell. Its contents may be swapped per cycle.
    pub slot: Arc<BufferSlot>,
    /// The descriptor as attached, with any mapped memory filled in.
    pub own: Arc<Buffer>,
    pub header: Option<SharedRef<MetaHeader>>,
}

impl PoolBuffer {
    pub fn new(id: u32, slot: Arc<BufferSlot>, own: Buffer, mapped: bool) -> Self {
        let header = own.find_meta(MetaType::Header).and_then(|m| m.header());
        let mut flags = BufferFlags::NONE;
        if mapped {
            flags.insert(BufferFlags::MAPPED);
        }
        Self {
            id,
            flags,
            slot,
            own: Arc::new(own),
            header,
        }
    }

    pub fn is_queued(&self) -> bool {
        self.flags.contains(BufferFlags::QUEUED)
    }

    pub fn is_mapped(&self) -> bool {
        self.flags.contains(BufferFlags::MAPPED)
    }
}

#[derive(Debug)]
pub struct BufferPool {
    buffers: Vec<PoolBuffer>,
    ring: [u32; MAX_BUFFERS],
    head: usize,
    queued: usize,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            buffers: Vec::with_capacity(MAX_BUFFERS),
            ring: [0; MAX_BUFFERS],
            head: 0,
            queued: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn n_queued(&self) -> usize {
        self.queued
    }

    pub fn get(&self, id: u32) -> Option<&PoolBuffer> {
        self.buffers.get(id as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PoolBuffer> {
        self.buffers.iter()
    }

    pub fn is_queued(&self, id: u32) -> bool {
        self.get(id).is_some_and(PoolBuffer::is_queued)
    }

    /// Replaces the pool contents. Entry ids must equal their index.
    pub fn attach(&mut self, entries: Vec<PoolBuffer>) -> Result<()> {
        if entries.len() > MAX_BUFFERS {
            return Err(Error::NoSpace {
                count: entries.len(),
                capacity: MAX_BUFFERS,
            });
        }
        debug_assert!(entries.iter().enumerate().all(|(i, b)| b.id as usize == i));
        self.clear();
        self.buffers.extend(entries);
        Ok(())
    }

    /// Drops every buffer, unmapping planes the pool mapped.
    pub fn clear(&mut self) {
        self.buffers.clear();
        self.head = 0;
        self.queued = 0;
    }

    /// Returns buffer `id` to the free queue.
    pub fn queue(&mut self, id: u32) -> Result<()> {
        let Some(buffer) = self.buffers.get_mut(id as usize) else {
            return Err(Error::InvalidArgument(format!(
                "buffer id {} out of range ({} buffers)",
                id,
                self.buffers.len()
            )));
        };
        if buffer.flags.contains(BufferFlags::QUEUED) {
            return Err(Error::AlreadyQueued(id));
        }
        debug_assert!(self.queued < MAX_BUFFERS);
        buffer.flags.insert(BufferFlags::QUEUED);
        let tail = (self.head + self.queued) % MAX_BUFFERS;
        self.ring[tail] = id;
        self.queued += 1;
        Ok(())
    }

    /// Oldest free buffer, now outstanding.
    pub fn dequeue(&mut self) -> Option<u32> {
        if self.queued == 0 {
            return None;
        }
        let id = self.ring[self.head];
        self.head = (self.head + 1) % MAX_BUFFERS;
        self.queued -= 1;
        if let Some(buffer) = self.buffers.get_mut(id as usize) {
            buffer.flags.remove(BufferFlags::QUEUED);
        }
        Some(id)
    }

    /// Queues every buffer, in id order.
    pub fn queue_all(&mut self) {
        for id in 0..self.buffers.len() as u32 {
            if !self.is_queued(id) {
                let _ = self.queue(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pool_with(n: usize) -> BufferPool {
        let mut pool = BufferPool::new();
        let entries = (0..n as u32)
            .map(|id| {
                PoolBuffer::new(
                    id,
                    Arc::new(BufferSlot::new(Buffer::default())),
                    Buffer::default(),
                    false,
                )
            })
            .collect();
        pool.attach(entries).unwrap();
        pool
    }

    #[test]
    fn test_fifo_order() {
        let mut pool = pool_with(4);
        pool.queue(2).unwrap();
        pool.queue(0).unwrap();
        pool.queue(3).unwrap();
        assert_eq!(pool.dequeue(), Some(2));
        assert_eq!(pool.dequeue(), Some(0));
        assert_eq!(pool.dequeue(), Some(3));
        assert_eq!(pool.dequeue(), None);
    }

    #[test]
    fn test_double_queue_rejected() {
        let mut pool = pool_with(2);
        pool.queue(1).unwrap();
        assert!(matches!(pool.queue(1), Err(Error::AlreadyQueued(1))));
        assert_eq!(pool.n_queued(), 1);
        assert_eq!(pool.dequeue(), Some(1));
        assert_eq!(pool.dequeue(), None);
    }

    #[test]
    fn test_out_of_range() {
        let mut pool = pool_with(2);
        assert!(matches!(pool.queue(2), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_capacity() {
        let mut pool = pool_with(MAX_BUFFERS);
        pool.queue_all();
        assert_eq!(pool.n_queued(), MAX_BUFFERS);

        let too_many = (0..=MAX_BUFFERS as u32)
            .map(|id| {
                PoolBuffer::new(
                    id,
                    Arc::new(BufferSlot::new(Buffer::default())),
                    Buffer::default(),
                    false,
                )
            })
            .collect();
        assert!(matches!(pool.attach(too_many), Err(Error::NoSpace { .. })));
        assert_eq!(pool.len(), MAX_BUFFERS);
        assert_eq!(pool.n_queued(), MAX_BUFFERS);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Queue(u32),
        Dequeue,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![(0u32..8).prop_map(Op::Queue), Just(Op::Dequeue)]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// A buffer id is never both queued and outstanding, and the queue never
        /// holds duplicates.
        #[test]
        fn ownership_is_exclusive(ops in prop::collection::vec(op(), 1..200)) {
            let mut pool = pool_with(8);
            let mut model: std::collections::VecDeque<u32> = Default::default();

            for op in ops {
                match op {
                    Op::Queue(id) => {
                        let before = pool.n_queued();
                        match pool.queue(id) {
                            Ok(()) => {
                                prop_assert!(!model.contains(&id));
                                model.push_back(id);
                            }
                            Err(Error::AlreadyQueued(_)) => {
                                prop_assert!(model.contains(&id));
                                prop_assert_eq!(pool.n_queued(), before);
                            }
                            Err(e) => prop_assert!(false, "unexpected {e}"),
                        }
                    }
                    Op::Dequeue => {
                        prop_assert_eq!(pool.dequeue(), model.pop_front());
                    }
                }
                for id in 0..8 {
                    prop_assert_eq!(pool.is_queued(id), model.contains(&id));
                }
            }
        }
    }
}
