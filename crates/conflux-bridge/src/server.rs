//! Host-side proxy for a node that lives in another process.
//!
//! [`ClientNode`] implements [`Node`] by marshalling every control call into a
//! [`ServerEvent`]; the remote answers with `Done` and keeps the proxy's view
//! of its ports current through `PortUpdate`. On the data path `process()`
//! only publishes the position and rings the remote's doorbell.

use crate::activation::{activation_command, monotonic_nsec, Activation};
use crate::error::{BridgeError, Result};
use crate::lockfree_bridge::{Incoming, LockFreeBridge};
use crate::mem::{mem_flags, MemRegistry};
use crate::protocol::{
    port_update, update, BridgeConfig, ClientMessage, MemRef, MemType, ServerEvent, WireBuffer,
    WireData, WireDataKind, WireMeta, MAX_IO, MAX_MIX, MIX_ID_INVALID,
};
use crate::shared_memory::MemBlock;
use conflux_core::pod;
use conflux_core::{
    Buffer, BufferSlot, Command, Completion, DataKind, Direction, Doorbell, IoKind, ListenerId,
    Listeners, MemRegion, Node, NodeCallbacks, NodeEvents, NodeFlags, NodeInfo, Object, ParamId,
    ParamResult, PortInfo, Position, Properties, SharedRef, Status, MAX_BUFFERS,
};
use std::collections::BTreeMap;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Done results kept for [`ClientNode::wait_for_done`].
const MAX_RESULTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Unbound,
    TransportNegotiated,
    Running,
}

#[derive(Debug, Default)]
struct Mix {
    /// Mem ids referenced by the current buffers.
    buffer_mems: Vec<u32>,
    n_buffers: usize,
    ios: Vec<(IoKind, u32)>,
}

#[derive(Debug)]
struct ProxyPort {
    info: Option<PortInfo>,
    params: Vec<Object>,
    have_format: bool,
    /// `MAX_MIX` peer mixes, then the port's own mix.
    mixes: Vec<Option<Mix>>,
}

impl ProxyPort {
    fn new() -> Self {
        Self {
            info: None,
            params: Vec::new(),
            have_format: false,
            mixes: (0..=MAX_MIX).map(|_| None).collect(),
        }
    }

    fn mix_index(mix_id: u32) -> Option<usize> {
        if mix_id == MIX_ID_INVALID {
            Some(MAX_MIX)
        } else if (mix_id as usize) < MAX_MIX {
            Some(mix_id as usize)
        } else {
            None
        }
    }
}

/// Releases every mem id the mix holds.
fn clear_mix(mems: &mut MemRegistry, mix: &mut Mix) {
    for id in mix.buffer_mems.drain(..) {
        mems.release(id);
    }
    mix.n_buffers = 0;
    for (_, id) in mix.ios.drain(..) {
        mems.release(id);
    }
}

fn enum_cached(
    params: &[Object],
    id: ParamId,
    start: u32,
    num: u32,
    filter: Option<&Object>,
) -> conflux_core::Result<Vec<ParamResult>> {
    if num == 0 {
        return Err(conflux_core::Error::InvalidArgument(
            "num must be at least 1".into(),
        ));
    }
    let mut results = Vec::new();
    for (index, param) in params.iter().enumerate().skip(start as usize) {
        if param.id != id {
            continue;
        }
        if let Some(param) = pod::filter(param, filter) {
            let index = index as u32;
            results.push(ParamResult {
                id,
                index,
                next: index + 1,
                param,
            });
            if results.len() as u32 == num {
                break;
            }
        }
    }
    Ok(results)
}

/// Proxy for a remote node.
pub struct ClientNode {
    config: BridgeConfig,
    node_id: u32,
    state: BridgeState,
    info: NodeInfo,
    params: Vec<Object>,
    listeners: Listeners,
    callbacks: Option<Box<dyn NodeCallbacks>>,
    bridge: LockFreeBridge<ServerEvent, ClientMessage>,
    seq: u32,
    mems: MemRegistry,
    ports: [BTreeMap<u32, ProxyPort>; 2],
    node_ios: Vec<(IoKind, u32)>,
    peer_mems: BTreeMap<u32, u32>,
    results: BTreeMap<u32, i32>,
    to_remote: Doorbell,
    from_remote: Doorbell,
    activation_block: MemBlock,
    activation: SharedRef<Activation>,
    position: Option<SharedRef<Position>>,
}

impl ClientNode {
    /// Starts the bridge on `stream`. Nothing is sent before [`ClientNode::bind`].
    pub fn new(stream: UnixStream, node_id: u32, config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        let activation_block = MemBlock::create(
            &config.shm_prefix,
            &format!("activation-{}", node_id),
            std::mem::size_of::<Activation>(),
        )?;
        let activation = activation_block.region().view::<Activation>(0)?;
        activation.driver_id.store(node_id, Ordering::Relaxed);

        let bridge = LockFreeBridge::spawn(&format!("client-node-{}", node_id), stream, &config)?;
        let mut info = NodeInfo::new(0, 0, NodeFlags::RT);
        info.change_mask = 0;

        Ok(Self {
            config,
            node_id,
            state: BridgeState::Unbound,
            info,
            params: Vec::new(),
            listeners: Listeners::new(),
            callbacks: None,
            bridge,
            seq: 0,
            mems: MemRegistry::new(),
            ports: [BTreeMap::new(), BTreeMap::new()],
            node_ios: Vec::new(),
            peer_mems: BTreeMap::new(),
            results: BTreeMap::new(),
            to_remote: Doorbell::new()?,
            from_remote: Doorbell::new()?,
            activation_block,
            activation,
            position: None,
        })
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.bridge.is_connected()
    }

    pub fn activation(&self) -> &SharedRef<Activation> {
        &self.activation
    }

    /// The shared activation block, for handing to peers.
    pub fn activation_region(&self) -> &MemRegion {
        self.activation_block.region()
    }

    /// Duplicate of the doorbell that wakes the remote.
    pub fn remote_doorbell(&self) -> Result<Doorbell> {
        Ok(self.to_remote.try_clone()?)
    }

    /// Duplicate of the doorbell the remote rings when it finished a cycle.
    /// Register it as a source and call [`ClientNode::handle_ready`] on wake.
    pub fn ready_doorbell(&self) -> Result<Doorbell> {
        Ok(self.from_remote.try_clone()?)
    }

    pub fn port_info(&self, direction: Direction, port_id: u32) -> Option<&PortInfo> {
        self.ports[direction.index()]
            .get(&port_id)
            .and_then(|p| p.info.as_ref())
    }

    pub fn n_ports(&self, direction: Direction) -> usize {
        self.ports[direction.index()].len()
    }

    pub fn mems(&self) -> &MemRegistry {
        &self.mems
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    fn push(&self, event: ServerEvent, fds: Vec<OwnedFd>) -> Result<()> {
        trace!("client-node {} -> {:?}", self.node_id, event);
        self.bridge.push(event, fds)
    }

    fn send(&mut self, build: impl FnOnce(u32) -> ServerEvent) -> Result<Completion> {
        let seq = self.next_seq();
        self.push(build(seq), Vec::new())?;
        Ok(Completion::Pending { seq })
    }

    /// Announces the transport: doorbells plus the activation block.
    pub fn bind(&mut self) -> Result<()> {
        if self.state != BridgeState::Unbound {
            return Err(BridgeError::InvalidState(format!(
                "client-node {} is already bound",
                self.node_id
            )));
        }
        let region = self.activation_block.region().clone();
        let activation = self.share(&region, MemType::MemFd)?;

        let mut fds = self.to_remote.dup_fds()?;
        fds.extend(self.from_remote.dup_fds()?);
        self.push(
            ServerEvent::Transport {
                node_id: self.node_id,
                activation,
            },
            fds,
        )?;
        self.state = BridgeState::TransportNegotiated;
        debug!("client-node {} bound", self.node_id);
        Ok(())
    }

    /// Takes a reference on the mem id of `fd`, announcing it when new.
    fn ensure_mem(&mut self, fd: &Arc<OwnedFd>, mem_type: MemType) -> Result<u32> {
        let (mem_id, is_new) = self.mems.ensure_mem(fd, mem_type, mem_flags::READWRITE)?;
        if is_new {
            let announced = fd.try_clone().map_err(BridgeError::from).and_then(|dup| {
                self.push(
                    ServerEvent::AddMem {
                        mem_id,
                        mem_type,
                        flags: mem_flags::READWRITE,
                    },
                    vec![dup],
                )
            });
            if let Err(e) = announced {
                self.mems.release(mem_id);
                return Err(e);
            }
        }
        Ok(mem_id)
    }

    /// Describes `region` as a range of a shared mem id.
    fn share(&mut self, region: &MemRegion, mem_type: MemType) -> Result<MemRef> {
        let (Some(fd), Some(offset)) = (region.fd(), region.file_offset()) else {
            return Err(conflux_core::Error::InvalidMemory(
                "memory is not backed by a shareable fd".into(),
            )
            .into());
        };
        let offset = u32::try_from(offset)
            .map_err(|_| conflux_core::Error::InvalidMemory("offset beyond 4 GiB".into()))?;
        let size = u32::try_from(region.len())
            .map_err(|_| conflux_core::Error::InvalidMemory("region beyond 4 GiB".into()))?;
        let fd = Arc::clone(fd);
        let mem_id = self.ensure_mem(&fd, mem_type)?;
        Ok(MemRef::new(mem_id, offset, size))
    }

    fn describe_buffer(&mut self, buffer: &Buffer, acquired: &mut Vec<u32>) -> Result<WireBuffer> {
        let mut wire = WireBuffer::default();
        for meta in &buffer.metas {
            let memory = self.share(&meta.memory, MemType::MemFd)?;
            acquired.push(memory.mem_id);
            wire.metas.push(WireMeta {
                kind: meta.kind,
                memory,
            });
        }
        for data in &buffer.datas {
            let chunk = self.share(data.chunk.region(), MemType::MemFd)?;
            acquired.push(chunk.mem_id);

            let (kind, memory) = match &data.kind {
                DataKind::MemPtr => {
                    let region = data.memory.as_ref().ok_or_else(|| {
                        conflux_core::Error::InvalidMemory("plane has no memory".into())
                    })?;
                    (WireDataKind::MemPtr, self.share(region, MemType::MemFd)?)
                }
                DataKind::MemFd { fd, mapoffset } => {
                    let mem_id = self.ensure_mem(fd, MemType::MemFd)?;
                    (WireDataKind::MemFd, MemRef::new(mem_id, *mapoffset, data.maxsize))
                }
                DataKind::DmaBuf { fd, mapoffset } => {
                    let mem_id = self.ensure_mem(fd, MemType::DmaBuf)?;
                    (WireDataKind::DmaBuf, MemRef::new(mem_id, *mapoffset, data.maxsize))
                }
            };
            acquired.push(memory.mem_id);
            wire.datas.push(WireData {
                kind,
                flags: data.flags,
                maxsize: data.maxsize,
                memory,
                chunk,
            });
        }
        Ok(wire)
    }

    fn check_port(&self, direction: Direction, port_id: u32) -> conflux_core::Result<&ProxyPort> {
        self.ports[direction.index()]
            .get(&port_id)
            .ok_or(conflux_core::Error::PortNotFound { direction, port_id })
    }

    /// [`Node::port_use_buffers`] on one mix of the port.
    pub fn port_use_buffers_mix(
        &mut self,
        direction: Direction,
        port_id: u32,
        mix_id: u32,
        buffers: &[Arc<BufferSlot>],
    ) -> Result<Completion> {
        let port = self.check_port(direction, port_id)?;
        if !port.have_format && !buffers.is_empty() {
            return Err(conflux_core::Error::IoError(
                format!("port {:?} {} has no format", direction, port_id).into(),
            )
            .into());
        }
        let Some(mix_index) = ProxyPort::mix_index(mix_id) else {
            return Err(conflux_core::Error::InvalidArgument(format!("invalid mix id {}", mix_id)).into());
        };
        if buffers.len() > MAX_BUFFERS {
            return Err(conflux_core::Error::NoSpace {
                count: buffers.len(),
                capacity: MAX_BUFFERS,
            }
            .into());
        }

        let mut acquired = Vec::new();
        let mut wire = Vec::with_capacity(buffers.len());
        for slot in buffers {
            match self.describe_buffer(&slot.load(), &mut acquired) {
                Ok(b) => wire.push(b),
                Err(e) => {
                    for id in acquired {
                        self.mems.release(id);
                    }
                    return Err(e);
                }
            }
        }

        let Self { ports, mems, .. } = self;
        if let Some(port) = ports[direction.index()].get_mut(&port_id) {
            let mix = port.mixes[mix_index].get_or_insert_with(Mix::default);
            for id in mix.buffer_mems.drain(..) {
                mems.release(id);
            }
            mix.buffer_mems = acquired;
            mix.n_buffers = buffers.len();
        }

        self.send(|seq| ServerEvent::PortUseBuffers {
            seq,
            direction,
            port_id,
            mix_id,
            buffers: wire,
        })
    }

    /// [`Node::port_set_io`] on one mix of the port.
    pub fn port_set_io_mix(
        &mut self,
        direction: Direction,
        port_id: u32,
        mix_id: u32,
        kind: IoKind,
        area: Option<MemRegion>,
    ) -> Result<Completion> {
        self.check_port(direction, port_id)?;
        let Some(mix_index) = ProxyPort::mix_index(mix_id) else {
            return Err(conflux_core::Error::InvalidArgument(format!("invalid mix id {}", mix_id)).into());
        };

        let memory = area
            .as_ref()
            .map(|a| self.share(a, MemType::MemFd))
            .transpose()?;

        let Self { ports, mems, .. } = self;
        if let Some(port) = ports[direction.index()].get_mut(&port_id) {
            let mix = port.mixes[mix_index].get_or_insert_with(Mix::default);
            if let Err(e) = update_io(mems, &mut mix.ios, kind, memory.map(|m| m.mem_id)) {
                return Err(e.into());
            }
        }

        self.send(|seq| ServerEvent::PortSetIo {
            seq,
            direction,
            port_id,
            mix_id,
            kind,
            memory,
        })
    }

    /// Links or unlinks a peer the remote wakes when it finishes.
    pub fn set_activation(
        &mut self,
        node_id: u32,
        peer: Option<(&MemRegion, &Doorbell)>,
    ) -> Result<()> {
        if let Some(old) = self.peer_mems.remove(&node_id) {
            self.mems.release(old);
        }
        match peer {
            Some((region, doorbell)) => {
                let memory = self.share(region, MemType::MemFd)?;
                self.peer_mems.insert(node_id, memory.mem_id);
                self.push(
                    ServerEvent::SetActivation {
                        node_id,
                        memory: Some(memory),
                    },
                    doorbell.dup_fds()?,
                )
            }
            None => self.push(
                ServerEvent::SetActivation {
                    node_id,
                    memory: None,
                },
                Vec::new(),
            ),
        }
    }

    /// Handles every message already received, waiting up to `timeout` for
    /// the first. Returns how many were handled.
    pub fn dispatch(&mut self, timeout: Option<Duration>) -> Result<usize> {
        let mut handled = 0;
        let mut next = self.bridge.recv_timeout(timeout);
        while let Some(incoming) = next {
            match incoming {
                Incoming::Message { msg, .. } => self.handle_message(msg),
                Incoming::Disconnected(reason) => self.handle_disconnect(&reason),
            }
            handled += 1;
            next = self.bridge.try_recv();
        }
        Ok(handled)
    }

    /// Dispatches until the `Done` for `seq` arrives. Returns its result.
    pub fn wait_for_done(&mut self, seq: u32, timeout: Duration) -> Result<i32> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(res) = self.results.remove(&seq) {
                return Ok(res);
            }
            if !self.is_connected() {
                self.dispatch(Some(Duration::ZERO))?;
                return self.results.remove(&seq).ok_or(BridgeError::Disconnected);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(BridgeError::Timeout {
                    operation: format!("done for seq {}", seq),
                    duration_ms: timeout.as_millis() as u64,
                });
            }
            self.dispatch(Some(deadline - now))?;
        }
    }

    /// Dispatches until `cond` holds.
    pub fn dispatch_until(
        &mut self,
        timeout: Duration,
        mut cond: impl FnMut(&ClientNode) -> bool,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while !cond(self) {
            let now = Instant::now();
            if now >= deadline {
                return Err(BridgeError::Timeout {
                    operation: "dispatch condition".into(),
                    duration_ms: timeout.as_millis() as u64,
                });
            }
            self.dispatch(Some(deadline - now))?;
        }
        Ok(())
    }

    fn handle_message(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::Update {
                change_mask,
                max_input_ports,
                max_output_ports,
                params,
                info,
            } => self.handle_update(change_mask, max_input_ports, max_output_ports, params, info),
            ClientMessage::PortUpdate {
                direction,
                port_id,
                change_mask,
                params,
                info,
            } => self.handle_port_update(direction, port_id, change_mask, params, info),
            ClientMessage::SetActive { active } => {
                debug!("client-node {} active: {}", self.node_id, active);
                self.state = if active {
                    BridgeState::Running
                } else {
                    BridgeState::TransportNegotiated
                };
            }
            ClientMessage::Event { event } => self.listeners.event(&event),
            ClientMessage::Done { seq, res } => {
                trace!("client-node {} done seq {} res {}", self.node_id, seq, res);
                self.results.insert(seq, res);
                while self.results.len() > MAX_RESULTS {
                    self.results.pop_first();
                }
                self.listeners.result(seq, res);
            }
        }
    }

    fn handle_update(
        &mut self,
        change_mask: u32,
        max_input_ports: u32,
        max_output_ports: u32,
        params: Vec<Object>,
        info: Option<NodeInfo>,
    ) {
        let mut changed = 0;
        if change_mask & update::MAX_INPUTS != 0 {
            self.info.max_input_ports = max_input_ports;
        }
        if change_mask & update::MAX_OUTPUTS != 0 {
            self.info.max_output_ports = max_output_ports;
        }
        if change_mask & update::PARAMS != 0 {
            self.params = params;
            changed |= conflux_core::node::node_change::PARAMS;
        }
        if let Some(info) = info {
            if change_mask & update::PROPS != 0 {
                self.info.props = info.props;
                changed |= conflux_core::node::node_change::PROPS;
            }
            if self.info.flags != info.flags {
                self.info.flags = info.flags;
                changed |= conflux_core::node::node_change::FLAGS;
            }
            self.info.params = info.params;
        }
        self.info.change_mask = changed;
        self.listeners.info(&self.info);
        self.info.change_mask = 0;
    }

    fn handle_port_update(
        &mut self,
        direction: Direction,
        port_id: u32,
        change_mask: u32,
        params: Vec<Object>,
        info: Option<PortInfo>,
    ) {
        let Self {
            ports,
            mems,
            listeners,
            ..
        } = self;
        let table = &mut ports[direction.index()];

        if change_mask == 0 {
            if let Some(mut port) = table.remove(&port_id) {
                for mix in port.mixes.iter_mut().flatten() {
                    clear_mix(mems, mix);
                }
                listeners.port_info(direction, port_id, None);
            }
            return;
        }

        let port = table.entry(port_id).or_insert_with(|| {
            debug!("port {:?} {} appeared", direction, port_id);
            ProxyPort::new()
        });
        if change_mask & port_update::PARAMS != 0 {
            port.have_format = params.iter().any(|p| p.id == ParamId::Format);
            port.params = params;
        }
        if change_mask & port_update::INFO != 0 {
            if let Some(info) = info {
                port.info = Some(info);
            }
        }
        if let Some(info) = &port.info {
            listeners.port_info(direction, port_id, Some(info));
        }
    }

    /// The remote is gone: its ports go with it. The proxy itself stays.
    fn handle_disconnect(&mut self, reason: &str) {
        warn!("client-node {} disconnected: {}", self.node_id, reason);
        let Self {
            ports,
            mems,
            listeners,
            ..
        } = self;
        for direction in [Direction::Input, Direction::Output] {
            for (port_id, mut port) in std::mem::take(&mut ports[direction.index()]) {
                for mix in port.mixes.iter_mut().flatten() {
                    clear_mix(mems, mix);
                }
                listeners.port_info(direction, port_id, None);
            }
        }
        self.state = BridgeState::Unbound;
    }

    /// Drains the remote's doorbell and reports the finished cycle.
    pub fn handle_ready(&mut self) -> Result<()> {
        let count = self.from_remote.read()?;
        if count == 0 {
            return Ok(());
        }
        if count > 1 {
            warn!(
                "client-node {}: {} wakeups coalesced, {} missed",
                self.node_id,
                count,
                count - 1
            );
        }
        if let Some(callbacks) = &mut self.callbacks {
            callbacks.ready(Status::HAVE_DATA);
        }
        Ok(())
    }
}

/// Binds or clears the io of `kind` in `ios`. Fails with `NoSpace` past
/// [`MAX_IO`] kinds.
fn update_io(
    mems: &mut MemRegistry,
    ios: &mut Vec<(IoKind, u32)>,
    kind: IoKind,
    mem_id: Option<u32>,
) -> conflux_core::Result<()> {
    let existing = ios.iter().position(|(k, _)| *k == kind);
    match (existing, mem_id) {
        (Some(i), Some(id)) => {
            mems.release(ios[i].1);
            ios[i].1 = id;
        }
        (Some(i), None) => {
            let (_, old) = ios.remove(i);
            mems.release(old);
        }
        (None, Some(id)) => {
            if ios.len() >= MAX_IO {
                mems.release(id);
                return Err(conflux_core::Error::NoSpace {
                    count: ios.len() + 1,
                    capacity: MAX_IO,
                });
            }
            ios.push((kind, id));
        }
        (None, None) => {}
    }
    Ok(())
}

impl Node for ClientNode {
    fn info(&self) -> &NodeInfo {
        &self.info
    }

    fn add_listener(&mut self, events: Box<dyn NodeEvents>) -> ListenerId {
        let Self {
            listeners,
            info,
            ports,
            ..
        } = self;
        let (id, l) = listeners.add(events);

        let old = info.change_mask;
        info.change_mask = conflux_core::node::node_change::ALL;
        l.info(info);
        info.change_mask = old;

        for direction in [Direction::Input, Direction::Output] {
            for (port_id, port) in &ports[direction.index()] {
                if let Some(info) = &port.info {
                    l.port_info(direction, *port_id, Some(info));
                }
            }
        }
        id
    }

    fn remove_listener(&mut self, id: ListenerId) {
        self.listeners.remove(id);
    }

    fn set_callbacks(&mut self, callbacks: Option<Box<dyn NodeCallbacks>>) {
        self.callbacks = callbacks;
    }

    fn send_command(&mut self, command: Command) -> conflux_core::Result<Completion> {
        let value = match command {
            Command::Start => activation_command::START,
            Command::Pause | Command::Suspend => activation_command::STOP,
            _ => activation_command::NONE,
        };
        if value != activation_command::NONE {
            self.activation.command.store(value, Ordering::Release);
        }
        Ok(self.send(|seq| ServerEvent::Command { seq, command })?)
    }

    /// A position area is kept locally and copied into the shared activation
    /// every cycle; other kinds go to the remote.
    fn set_io(&mut self, kind: IoKind, area: Option<MemRegion>) -> conflux_core::Result<Completion> {
        if kind == IoKind::Position {
            self.position = area.map(|a| a.view::<Position>(0)).transpose()?;
            return Ok(Completion::Complete);
        }
        let memory = area
            .as_ref()
            .map(|a| self.share(a, MemType::MemFd))
            .transpose()?;
        update_io(&mut self.mems, &mut self.node_ios, kind, memory.map(|m| m.mem_id))?;
        Ok(self.send(|seq| ServerEvent::SetIo { seq, kind, memory })?)
    }

    fn enum_params(
        &self,
        id: ParamId,
        start: u32,
        num: u32,
        filter: Option<&Object>,
    ) -> conflux_core::Result<Vec<ParamResult>> {
        enum_cached(&self.params, id, start, num, filter)
    }

    fn add_port(
        &mut self,
        direction: Direction,
        port_id: u32,
        props: Option<&Properties>,
    ) -> conflux_core::Result<Completion> {
        if port_id >= self.info.max_ports(direction)
            || self.ports[direction.index()].contains_key(&port_id)
        {
            return Err(conflux_core::Error::InvalidArgument(format!(
                "port {:?} {} is not free",
                direction, port_id
            )));
        }
        let props = props.cloned();
        Ok(self.send(|seq| ServerEvent::AddPort {
            seq,
            direction,
            port_id,
            props,
        })?)
    }

    fn remove_port(&mut self, direction: Direction, port_id: u32) -> conflux_core::Result<Completion> {
        self.check_port(direction, port_id)?;
        Ok(self.send(|seq| ServerEvent::RemovePort {
            seq,
            direction,
            port_id,
        })?)
    }

    fn port_enum_params(
        &self,
        direction: Direction,
        port_id: u32,
        id: ParamId,
        start: u32,
        num: u32,
        filter: Option<&Object>,
    ) -> conflux_core::Result<Vec<ParamResult>> {
        let port = self.check_port(direction, port_id)?;
        enum_cached(&port.params, id, start, num, filter)
    }

    fn port_set_param(
        &mut self,
        direction: Direction,
        port_id: u32,
        id: ParamId,
        param: Option<&Object>,
    ) -> conflux_core::Result<Completion> {
        self.check_port(direction, port_id)?;
        let param = param.cloned();
        Ok(self.send(|seq| ServerEvent::PortSetParam {
            seq,
            direction,
            port_id,
            id,
            param,
        })?)
    }

    fn port_use_buffers(
        &mut self,
        direction: Direction,
        port_id: u32,
        buffers: &[Arc<BufferSlot>],
    ) -> conflux_core::Result<Completion> {
        Ok(self.port_use_buffers_mix(direction, port_id, MIX_ID_INVALID, buffers)?)
    }

    fn port_set_io(
        &mut self,
        direction: Direction,
        port_id: u32,
        kind: IoKind,
        area: Option<MemRegion>,
    ) -> conflux_core::Result<Completion> {
        Ok(self.port_set_io_mix(direction, port_id, MIX_ID_INVALID, kind, area)?)
    }

    fn port_reuse_buffer(&mut self, port_id: u32, _buffer_id: u32) -> conflux_core::Result<()> {
        self.check_port(Direction::Output, port_id)?;
        Err(conflux_core::Error::NotSupported(
            "buffer reuse on a remote node".into(),
        ))
    }

    fn process(&mut self) -> conflux_core::Result<Status> {
        if self.state != BridgeState::Running {
            return Err(conflux_core::Error::IoError("client-node is not running".into()));
        }
        if let Some(position) = &self.position {
            self.activation.position.copy_from(position);
        }
        self.activation.trigger(monotonic_nsec());
        self.to_remote.signal(1)?;
        Ok(Status::OK)
    }
}

impl std::fmt::Debug for ClientNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientNode")
            .field("node_id", &self.node_id)
            .field("state", &self.state)
            .field("inputs", &self.ports[0].len())
            .field("outputs", &self.ports[1].len())
            .field("mems_in_use", &self.mems.in_use())
            .field("timeout_ms", &self.config.timeout_ms)
            .finish()
    }
}
