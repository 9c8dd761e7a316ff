//! Activation records: the shared per-node scheduling state, and the table of
//! peers a node triggers when it finishes.

use crate::error::Result;
use arc_swap::{ArcSwap, ArcSwapOption};
use conflux_core::{Doorbell, Position, SharedRef, ShmSafe};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ActivationStatus {
    NotTriggered = 0,
    Triggered = 1,
    Awake = 2,
    Finished = 3,
}

impl ActivationStatus {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => ActivationStatus::NotTriggered,
            1 => ActivationStatus::Triggered,
            2 => ActivationStatus::Awake,
            3 => ActivationStatus::Finished,
            _ => return None,
        })
    }
}

/// `command` values of an [`Activation`].
pub mod activation_command {
    pub const NONE: u32 = 0;
    pub const START: u32 = 1;
    pub const STOP: u32 = 2;
}

/// Dependency counter: a node runs once `pending` reaches zero.
#[repr(C)]
#[derive(Debug, Default)]
pub struct ActivationRecord {
    /// Last process status or negative errno.
    pub status: AtomicI32,
    pub required: AtomicI32,
    pub pending: AtomicI32,
}

impl ActivationRecord {
    /// Re-arms the counter for the next cycle.
    pub fn reset(&self) {
        self.pending
            .store(self.required.load(Ordering::Acquire), Ordering::Release);
    }

    /// Counts one dependency as done. True when it was the last one.
    pub fn decrement(&self) -> bool {
        self.pending.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct Activation {
    status: AtomicU32,
    /// Indexed by cycle parity.
    pub state: [ActivationRecord; 2],
    pub signal_time: AtomicU64,
    pub awake_time: AtomicU64,
    pub finish_time: AtomicU64,
    pub prev_signal_time: AtomicU64,
    pub xrun_count: AtomicU32,
    pub command: AtomicU32,
    /// Node id of the current driver.
    pub driver_id: AtomicU32,
    pub position: Position,
}

// SAFETY: repr(C), atomics only.
unsafe impl ShmSafe for Activation {}

impl Activation {
    pub const POSITION_OFFSET: usize = std::mem::offset_of!(Activation, position);

    pub fn status(&self) -> Option<ActivationStatus> {
        ActivationStatus::from_raw(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: ActivationStatus) {
        self.status.store(status as u32, Ordering::Release);
    }

    pub fn trigger(&self, now: u64) {
        let prev = self.signal_time.swap(now, Ordering::Relaxed);
        self.prev_signal_time.store(prev, Ordering::Relaxed);
        self.set_status(ActivationStatus::Triggered);
    }

    pub fn awake(&self, now: u64) {
        self.awake_time.store(now, Ordering::Relaxed);
        self.set_status(ActivationStatus::Awake);
    }

    pub fn finish(&self, now: u64, status: i32) {
        let cycle = self.position.clock.cycle() as usize;
        self.state[cycle & 1].status.store(status, Ordering::Relaxed);
        self.finish_time.store(now, Ordering::Relaxed);
        self.set_status(ActivationStatus::Finished);
    }
}

/// CLOCK_MONOTONIC in nanoseconds.
pub fn monotonic_nsec() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid timespec; CLOCK_MONOTONIC is always available.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// A node this node wakes when it finishes.
#[derive(Debug)]
pub struct Peer {
    pub node_id: u32,
    pub activation: SharedRef<Activation>,
    pub doorbell: Doorbell,
}

impl Peer {
    /// Counts this node as done for the peer and wakes it when nothing else is pending.
    pub fn trigger(&self, now: u64) -> Result<bool> {
        let cycle = self.activation.position.clock.cycle() as usize;
        if !self.activation.state[cycle & 1].decrement() {
            return Ok(false);
        }
        self.activation.trigger(now);
        self.doorbell.signal(1)?;
        Ok(true)
    }
}

#[derive(Debug)]
struct PeerEntry {
    peer: Arc<Peer>,
    refs: u32,
}

/// Reference-counted peers, readable from the data thread without locks.
#[derive(Debug, Default)]
pub struct PeerTable {
    table: Mutex<BTreeMap<u32, PeerEntry>>,
    targets: ArcSwap<Vec<Arc<Peer>>>,
    driver: ArcSwapOption<Peer>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a reference to the peer. A peer already present keeps its
    /// activation and doorbell. Returns the new count.
    pub fn add(&self, peer: Peer) -> u32 {
        let mut table = self.table.lock();
        let refs = match table.get_mut(&peer.node_id) {
            Some(entry) => {
                entry.refs += 1;
                entry.refs
            }
            None => {
                debug!("peer {} added", peer.node_id);
                table.insert(
                    peer.node_id,
                    PeerEntry {
                        peer: Arc::new(peer),
                        refs: 1,
                    },
                );
                1
            }
        };
        self.publish(&table);
        refs
    }

    /// Drops a reference. Returns whether the peer is gone.
    pub fn remove(&self, node_id: u32) -> bool {
        let mut table = self.table.lock();
        let Some(entry) = table.get_mut(&node_id) else {
            warn!("removing unknown peer {}", node_id);
            return false;
        };
        entry.refs -= 1;
        if entry.refs > 0 {
            return false;
        }
        table.remove(&node_id);
        debug!("peer {} removed", node_id);
        if self.driver.load_full().is_some_and(|d| d.node_id == node_id) {
            self.driver.store(None);
        }
        self.publish(&table);
        true
    }

    fn publish(&self, table: &BTreeMap<u32, PeerEntry>) {
        self.targets
            .store(Arc::new(table.values().map(|e| Arc::clone(&e.peer)).collect()));
    }

    /// Points the driver at `node_id`'s activation, or clears it when the
    /// peer is unknown.
    pub fn set_driver(&self, node_id: u32) -> bool {
        let peer = self
            .table
            .lock()
            .get(&node_id)
            .map(|e| Arc::clone(&e.peer));
        let found = peer.is_some();
        self.driver.store(peer);
        found
    }

    pub fn driver(&self) -> Option<Arc<Peer>> {
        self.driver.load_full()
    }

    /// Triggers every peer. Returns how many were woken.
    pub fn trigger_all(&self, now: u64) -> Result<usize> {
        let mut woken = 0;
        for peer in self.targets.load().iter() {
            if peer.trigger(now)? {
                woken += 1;
            }
        }
        Ok(woken)
    }

    pub fn len(&self) -> usize {
        self.targets.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, node_id: u32) -> bool {
        self.table.lock().contains_key(&node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(node_id: u32, required: i32) -> Peer {
        let activation = SharedRef::<Activation>::alloc().unwrap();
        activation.state[0].required.store(required, Ordering::Relaxed);
        activation.state[0].reset();
        Peer {
            node_id,
            activation,
            doorbell: Doorbell::new().unwrap(),
        }
    }

    #[test]
    fn test_record_counts_down() {
        let record = ActivationRecord::default();
        record.required.store(2, Ordering::Relaxed);
        record.reset();
        assert!(!record.decrement());
        assert!(record.decrement());
        record.reset();
        assert_eq!(record.pending.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_status_transitions() {
        let act = Activation::default();
        assert_eq!(act.status(), Some(ActivationStatus::NotTriggered));
        act.trigger(10);
        act.trigger(25);
        assert_eq!(act.status(), Some(ActivationStatus::Triggered));
        assert_eq!(act.prev_signal_time.load(Ordering::Relaxed), 10);
        act.awake(30);
        act.finish(40, 3);
        assert_eq!(act.status(), Some(ActivationStatus::Finished));
        assert_eq!(act.state[0].status.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_trigger_wakes_when_last() {
        let table = PeerTable::new();
        table.add(peer(5, 2));
        let activation = table.targets.load()[0].activation.clone();

        assert_eq!(table.trigger_all(100).unwrap(), 0);
        assert_eq!(table.trigger_all(200).unwrap(), 1);
        assert_eq!(activation.status(), Some(ActivationStatus::Triggered));
        assert_eq!(activation.signal_time.load(Ordering::Relaxed), 200);
        assert_eq!(table.targets.load()[0].doorbell.read().unwrap(), 1);
    }

    #[test]
    fn test_peers_are_reference_counted() {
        let table = PeerTable::new();
        assert_eq!(table.add(peer(7, 1)), 1);
        assert_eq!(table.add(peer(7, 1)), 2);
        assert_eq!(table.len(), 1);

        assert!(table.set_driver(7));
        assert!(!table.remove(7));
        assert!(table.driver().is_some());
        assert!(table.remove(7));
        assert!(table.driver().is_none());
        assert!(table.is_empty());
        assert!(!table.remove(7));
    }

    #[test]
    fn test_unknown_driver_clears() {
        let table = PeerTable::new();
        table.add(peer(1, 1));
        assert!(table.set_driver(1));
        assert!(!table.set_driver(9));
        assert!(table.driver().is_none());
    }

    #[test]
    fn test_monotonic_advances() {
        let a = monotonic_nsec();
        let b = monotonic_nsec();
        assert!(b >= a);
    }
}
