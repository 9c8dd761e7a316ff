//! IO areas: the shared cells exchanged between nodes every cycle.

use crate::buffer::ID_INVALID;
use crate::memory::ShmSafe;
use crate::status::Status;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum IoKind {
    Buffers = 1,
    Range = 2,
    Clock = 3,
    Latency = 4,
    Control = 5,
    Notify = 6,
    Position = 7,
    RateMatch = 8,
    Memory = 9,
    AsyncBuffers = 10,
}

impl IoKind {
    pub fn as_raw(self) -> u32 {
        self as u32
    }
}

/// One in-flight buffer id plus status. The producer writes, the consumer reads.
#[repr(C)]
#[derive(Debug)]
pub struct IoBuffers {
    status: AtomicI32,
    buffer_id: AtomicU32,
}

// SAFETY: repr(C), atomics only.
unsafe impl ShmSafe for IoBuffers {}

impl IoBuffers {
    pub const fn new() -> Self {
        Self {
            status: AtomicI32::new(0),
            buffer_id: AtomicU32::new(ID_INVALID),
        }
    }

    /// Puts the cell back to `{OK, INVALID}`.
    pub fn reset(&self) {
        self.set(Status::OK.as_raw(), ID_INVALID);
    }

    pub fn status(&self) -> i32 {
        self.status.load(Ordering::Acquire)
    }

    pub fn set_status(&self, status: i32) {
        self.status.store(status, Ordering::Release);
    }

    pub fn buffer_id(&self) -> u32 {
        self.buffer_id.load(Ordering::Acquire)
    }

    pub fn set_buffer_id(&self, id: u32) {
        self.buffer_id.store(id, Ordering::Release);
    }

    /// Publishes `buffer_id` before `status`.
    pub fn set(&self, status: i32, buffer_id: u32) {
        self.buffer_id.store(buffer_id, Ordering::Relaxed);
        self.status.store(status, Ordering::Release);
    }

    pub fn has_data(&self) -> bool {
        self.status() == Status::HAVE_DATA.as_raw()
    }
}

impl Default for IoBuffers {
    fn default() -> Self {
        Self::new()
    }
}

/// Two cells indexed by cycle parity.
#[repr(C)]
#[derive(Debug, Default)]
pub struct AsyncBuffers {
    pub buffers: [IoBuffers; 2],
}

// SAFETY: repr(C), atomics only.
unsafe impl ShmSafe for AsyncBuffers {}

#[repr(C)]
#[derive(Debug, Default)]
pub struct Clock {
    pub flags: AtomicU32,
    /// Node id of the driver.
    pub id: AtomicU32,
    pub nsec: AtomicU64,
    pub rate_num: AtomicU32,
    pub rate_denom: AtomicU32,
    pub position: AtomicU64,
    /// Quantum in samples.
    pub duration: AtomicU64,
    pub delay: AtomicI64,
    /// f64 bits
    pub rate_diff: AtomicU64,
    pub next_nsec: AtomicU64,
    pub cycle: AtomicU32,
    pub xrun: AtomicU32,
}

impl Clock {
    pub fn cycle(&self) -> u32 {
        self.cycle.load(Ordering::Acquire)
    }

    pub fn rate(&self) -> u32 {
        self.rate_denom.load(Ordering::Relaxed)
    }

    pub fn duration(&self) -> u64 {
        self.duration.load(Ordering::Relaxed)
    }

    pub fn rate_diff(&self) -> f64 {
        f64::from_bits(self.rate_diff.load(Ordering::Relaxed))
    }

    /// Copies every field of `other` into `self`.
    pub fn copy_from(&self, other: &Clock) {
        let r = Ordering::Relaxed;
        self.flags.store(other.flags.load(r), r);
        self.id.store(other.id.load(r), r);
        self.nsec.store(other.nsec.load(r), r);
        self.rate_num.store(other.rate_num.load(r), r);
        self.rate_denom.store(other.rate_denom.load(r), r);
        self.position.store(other.position.load(r), r);
        self.duration.store(other.duration.load(r), r);
        self.delay.store(other.delay.load(r), r);
        self.rate_diff.store(other.rate_diff.load(r), r);
        self.next_nsec.store(other.next_nsec.load(r), r);
        self.xrun.store(other.xrun.load(r), r);
        self.cycle.store(other.cycle.load(r), Ordering::Release);
    }
}

/// Shared scheduling context of a graph cycle.
#[repr(C)]
#[derive(Debug, Default)]
pub struct Position {
    pub clock: Clock,
    pub state: AtomicU32,
    pub offset: AtomicI64,
}

// SAFETY: repr(C), atomics only.
unsafe impl ShmSafe for Clock {}
unsafe impl ShmSafe for Position {}

impl Position {
    pub fn copy_from(&self, other: &Position) {
        self.state
            .store(other.state.load(Ordering::Relaxed), Ordering::Relaxed);
        self.offset
            .store(other.offset.load(Ordering::Relaxed), Ordering::Relaxed);
        self.clock.copy_from(&other.clock);
    }
}
