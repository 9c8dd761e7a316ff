//! The node contract shared by local nodes and remote proxies.

use crate::cpu::CpuFeatures;
use crate::data_loop::LoopRef;
use crate::error::{Error, Result};
use crate::io::IoKind;
use crate::memory::MemRegion;
use crate::buffer::BufferSlot;
use crate::param::{ParamId, ParamInfo, ParamResult};
use crate::pod::Object;
use crate::port::{Direction, PortInfo};
use crate::status::Status;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::sync::Arc;

/// String key/value map handed to node factories.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Properties(BTreeMap<String, String>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct NodeFlags(u64);

impl NodeFlags {
    pub const NONE: NodeFlags = NodeFlags(0);
    /// `process()` is real-time safe.
    pub const RT: NodeFlags = NodeFlags(1 << 0);
    pub const IN_DYNAMIC_PORTS: NodeFlags = NodeFlags(1 << 1);
    pub const OUT_DYNAMIC_PORTS: NodeFlags = NodeFlags(1 << 2);

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, other: NodeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: NodeFlags) -> Self {
        NodeFlags(self.0 | other.0)
    }
}

pub mod node_change {
    pub const FLAGS: u64 = 1 << 0;
    pub const PROPS: u64 = 1 << 1;
    pub const PARAMS: u64 = 1 << 2;
    pub const ALL: u64 = FLAGS | PROPS | PARAMS;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub max_input_ports: u32,
    pub max_output_ports: u32,
    pub change_mask: u64,
    pub flags: NodeFlags,
    pub props: Properties,
    pub params: SmallVec<[ParamInfo; 8]>,
}

impl NodeInfo {
    pub fn new(max_input_ports: u32, max_output_ports: u32, flags: NodeFlags) -> Self {
        Self {
            max_input_ports,
            max_output_ports,
            change_mask: node_change::ALL,
            flags,
            props: Properties::new(),
            params: SmallVec::new(),
        }
    }

    pub fn max_ports(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Input => self.max_input_ports,
            Direction::Output => self.max_output_ports,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    Start,
    Pause,
    Suspend,
    Flush,
    Drain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeEvent {
    Error(i32),
    Buffering,
    RequestRefresh,
    RequestProcess,
}

/// How a control-plane call finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Complete,
    /// The result arrives later through [`NodeEvents::result`] with this seq.
    Pending { seq: u32 },
}

/// Control-plane notifications. Called on the thread that made the call.
pub trait NodeEvents: Send {
    fn info(&mut self, _info: &NodeInfo) {}

    /// `None` means the port was removed.
    fn port_info(&mut self, _direction: Direction, _port_id: u32, _info: Option<&PortInfo>) {}

    /// Outcome of a [`Completion::Pending`] call: status bits or a negative errno.
    fn result(&mut self, _seq: u32, _res: i32) {}

    fn event(&mut self, _event: &NodeEvent) {}
}

/// Data-plane notifications. Called from the data thread.
pub trait NodeCallbacks: Send {
    fn ready(&mut self, _status: Status) {}

    fn reuse_buffer(&mut self, _port_id: u32, _buffer_id: u32) {}

    fn xrun(&mut self, _trigger_nsec: u64, _delay: u64) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Registered [`NodeEvents`] listeners.
#[derive(Default)]
pub struct Listeners {
    next: u64,
    entries: Vec<(ListenerId, Box<dyn NodeEvents>)>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `events` and returns it for the initial emission.
    pub fn add(&mut self, events: Box<dyn NodeEvents>) -> (ListenerId, &mut dyn NodeEvents) {
        let id = ListenerId(self.next);
        self.next += 1;
        self.entries.push((id, events));
        let last = self.entries.len() - 1;
        (id, self.entries[last].1.as_mut())
    }

    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(i, _)| *i != id);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn info(&mut self, info: &NodeInfo) {
        for (_, l) in &mut self.entries {
            l.info(info);
        }
    }

    pub fn port_info(&mut self, direction: Direction, port_id: u32, info: Option<&PortInfo>) {
        for (_, l) in &mut self.entries {
            l.port_info(direction, port_id, info);
        }
    }

    pub fn result(&mut self, seq: u32, res: i32) {
        for (_, l) in &mut self.entries {
            l.result(seq, res);
        }
    }

    pub fn event(&mut self, event: &NodeEvent) {
        for (_, l) in &mut self.entries {
            l.event(event);
        }
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("len", &self.entries.len())
            .finish()
    }
}

/// Process-wide services injected at node creation.
#[derive(Debug, Clone, Default)]
pub struct Support {
    pub cpu: Option<CpuFeatures>,
    pub data_loop: Option<LoopRef>,
}

impl Support {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cpu(mut self, cpu: CpuFeatures) -> Self {
        self.cpu = Some(cpu);
        self
    }

    pub fn with_data_loop(mut self, data_loop: LoopRef) -> Self {
        self.data_loop = Some(data_loop);
        self
    }
}

/// A schedulable unit with ports.
///
/// Control methods run on a non-RT thread, or on the data loop where noted.
/// [`Node::process`] runs on the data thread and is never concurrent with itself.
pub trait Node: Send {
    fn info(&self) -> &NodeInfo;

    /// Registers `events` and immediately emits the full node info and every
    /// port info to it alone.
    fn add_listener(&mut self, events: Box<dyn NodeEvents>) -> ListenerId;

    fn remove_listener(&mut self, id: ListenerId);

    fn set_callbacks(&mut self, callbacks: Option<Box<dyn NodeCallbacks>>);

    fn send_command(&mut self, command: Command) -> Result<Completion>;

    fn set_io(&mut self, kind: IoKind, area: Option<MemRegion>) -> Result<Completion>;

    fn enum_params(
        &self,
        id: ParamId,
        _start: u32,
        _num: u32,
        _filter: Option<&Object>,
    ) -> Result<Vec<ParamResult>> {
        Err(Error::NotSupported(format!("node param {:?}", id)))
    }

    fn set_param(&mut self, id: ParamId, _param: Option<&Object>) -> Result<Completion> {
        Err(Error::NotSupported(format!("node param {:?}", id)))
    }

    fn add_port(
        &mut self,
        direction: Direction,
        port_id: u32,
        props: Option<&Properties>,
    ) -> Result<Completion>;

    fn remove_port(&mut self, direction: Direction, port_id: u32) -> Result<Completion>;

    /// Up to `num` params of class `id` starting at enumeration index `start`.
    /// Each result's `next` is the index to resume from.
    fn port_enum_params(
        &self,
        direction: Direction,
        port_id: u32,
        id: ParamId,
        start: u32,
        num: u32,
        filter: Option<&Object>,
    ) -> Result<Vec<ParamResult>>;

    fn port_set_param(
        &mut self,
        direction: Direction,
        port_id: u32,
        id: ParamId,
        param: Option<&Object>,
    ) -> Result<Completion>;

    fn port_use_buffers(
        &mut self,
        direction: Direction,
        port_id: u32,
        buffers: &[Arc<BufferSlot>],
    ) -> Result<Completion>;

    fn port_set_io(
        &mut self,
        direction: Direction,
        port_id: u32,
        kind: IoKind,
        area: Option<MemRegion>,
    ) -> Result<Completion>;

    fn port_reuse_buffer(&mut self, port_id: u32, buffer_id: u32) -> Result<()>;

    fn process(&mut self) -> Result<Status>;
}

/// Lazily walks [`Node::port_enum_params`] one result at a time.
pub struct ParamIter<'a, N: Node + ?Sized> {
    node: &'a N,
    direction: Direction,
    port_id: u32,
    id: ParamId,
    filter: Option<&'a Object>,
    next: u32,
    done: bool,
}

impl<'a, N: Node + ?Sized> ParamIter<'a, N> {
    pub fn new(
        node: &'a N,
        direction: Direction,
        port_id: u32,
        id: ParamId,
        filter: Option<&'a Object>,
    ) -> Self {
        Self {
            node,
            direction,
            port_id,
            id,
            filter,
            next: 0,
            done: false,
        }
    }

    /// Index the next call to `next()` resumes from.
    pub fn position(&self) -> u32 {
        self.next
    }

    pub fn restart(&mut self, start: u32) {
        self.next = start;
        self.done = false;
    }
}

impl<N: Node + ?Sized> Iterator for ParamIter<'_, N> {
    type Item = Result<ParamResult>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.node.port_enum_params(
            self.direction,
            self.port_id,
            self.id,
            self.next,
            1,
            self.filter,
        ) {
            Ok(mut results) => match results.pop() {
                Some(result) => {
                    self.next = result.next;
                    Some(Ok(result))
                }
                None => {
                    self.done = true;
                    None
                }
            },
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
