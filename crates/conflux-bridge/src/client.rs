//! Remote side of a client-node: hosts a real [`Node`] on its own data loop
//! and serves the host's [`ServerEvent`]s against it.
//!
//! Control events are applied on the calling thread through the loop's
//! invoker. Every change the hosted node reports is sent back as an
//! `Update` or `PortUpdate` before the `Done` of the event that caused it.

use crate::activation::{monotonic_nsec, Activation, Peer, PeerTable};
use crate::error::{BridgeError, Result};
use crate::lockfree_bridge::{Incoming, LockFreeBridge};
use crate::mem::MemMap;
use crate::protocol::{
    port_update, update, BridgeConfig, ClientMessage, MemRef, ServerEvent, WireBuffer,
    WireDataKind, MIX_ID_INVALID,
};
use conflux_core::node::node_change;
use conflux_core::{
    Buffer, BufferSlot, Chunk, Completion, CpuFeatures, Data, DataFlags, DataKind, DataLoop,
    Direction, Doorbell, Invoker, IoKind, Meta, MemRegion, Node, NodeEvent, NodeEvents, NodeInfo,
    Object, ParamFlags, ParamInfo, PortInfo, Position, SharedRef, SourceEvents, SourceId, Support,
};
use crossbeam_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

#[derive(Debug)]
enum Change {
    Info(NodeInfo),
    Port(Direction, u32, Option<PortInfo>),
    Result(u32, i32),
    Event(NodeEvent),
}

struct ChangeForwarder(Sender<Change>);

impl NodeEvents for ChangeForwarder {
    fn info(&mut self, info: &NodeInfo) {
        let _ = self.0.send(Change::Info(info.clone()));
    }

    fn port_info(&mut self, direction: Direction, port_id: u32, info: Option<&PortInfo>) {
        let _ = self
            .0
            .send(Change::Port(direction, port_id, info.cloned()));
    }

    fn result(&mut self, seq: u32, res: i32) {
        let _ = self.0.send(Change::Result(seq, res));
    }

    fn event(&mut self, event: &NodeEvent) {
        let _ = self.0.send(Change::Event(event.clone()));
    }
}

/// State owned by the data loop.
struct Hosted<N> {
    node: N,
    node_id: u32,
    activation: Option<SharedRef<Activation>>,
    to_host: Option<Doorbell>,
    peers: Arc<PeerTable>,
    driver_id: u32,
    cycles: Arc<AtomicU64>,
}

impl<N: Node> Hosted<N> {
    /// One graph cycle, run when the host rings our doorbell.
    fn on_wake(&mut self, bell: &Doorbell, events: SourceEvents) {
        if events.contains(SourceEvents::ERR) || events.contains(SourceEvents::HUP) {
            warn!("remote node {}: wake doorbell closed", self.node_id);
            return;
        }
        let count = match bell.read() {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                warn!("remote node {}: failed to read doorbell: {}", self.node_id, e);
                return;
            }
        };
        if count > 1 {
            warn!(
                "remote node {}: {} wakeups coalesced, {} missed",
                self.node_id,
                count,
                count - 1
            );
        }
        let Some(activation) = &self.activation else {
            return;
        };

        activation.awake(monotonic_nsec());

        let driver_id = activation.driver_id.load(Ordering::Acquire);
        if driver_id != self.driver_id {
            debug!("remote node {}: driver is now {}", self.node_id, driver_id);
            self.driver_id = driver_id;
            self.peers.set_driver(driver_id);
        }
        if let Some(driver) = self.peers.driver() {
            activation.position.copy_from(&driver.activation.position);
        }

        let status = match self.node.process() {
            Ok(status) => status.as_raw(),
            Err(e) => {
                warn!("remote node {}: process failed: {}", self.node_id, e);
                e.errno()
            }
        };
        let now = monotonic_nsec();
        activation.finish(now, status);
        self.cycles.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.peers.trigger_all(now) {
            warn!("remote node {}: failed to wake peers: {}", self.node_id, e);
        }
        if let Some(to_host) = &self.to_host {
            if let Err(e) = to_host.signal(1) {
                warn!("remote node {}: failed to wake host: {}", self.node_id, e);
            }
        }
    }
}

type MixKey = (Direction, u32, u32);

/// Serves a [`Node`] to a host over a client-node connection.
pub struct RemoteNode<N: Node + 'static> {
    bridge: LockFreeBridge<ClientMessage, ServerEvent>,
    data_loop: DataLoop<Hosted<N>>,
    invoker: Invoker<Hosted<N>>,
    changes: Receiver<Change>,
    mems: MemMap,
    peers: Arc<PeerTable>,
    cycles: Arc<AtomicU64>,
    wake_source: Option<SourceId>,
    /// Hosted-node seqs still owed to the host, by the host's seq.
    pending: HashMap<u32, u32>,
    mix_buffers: HashMap<MixKey, Vec<Arc<BufferSlot>>>,
    mix_ios: HashMap<(MixKey, IoKind), MemRegion>,
    poll_interval: Duration,
}

impl<N: Node + 'static> RemoteNode<N> {
    /// Builds the node with a [`Support`] carrying detected CPU features and
    /// the new data loop, starts the loop and announces the node.
    pub fn new<B>(stream: UnixStream, config: BridgeConfig, build: B) -> Result<Self>
    where
        B: FnOnce(&Support) -> conflux_core::Result<N>,
    {
        config.validate()?;
        let (tx, changes) = crossbeam_channel::unbounded();
        let peers = Arc::new(PeerTable::new());
        let cycles = Arc::new(AtomicU64::new(0));

        let mut data_loop = DataLoop::with_state("remote-node", |loop_ref| {
            let support = Support::new()
                .with_cpu(CpuFeatures::detect())
                .with_data_loop(loop_ref);
            let mut node = build(&support)?;
            node.add_listener(Box::new(ChangeForwarder(tx)));
            Ok(Hosted {
                node,
                node_id: 0,
                activation: None,
                to_host: None,
                peers: Arc::clone(&peers),
                driver_id: u32::MAX,
                cycles: Arc::clone(&cycles),
            })
        })?;
        let bridge = LockFreeBridge::spawn("remote-node-bridge", stream, &config)?;
        data_loop.start()?;
        let invoker = data_loop.invoker();

        let mut remote = Self {
            bridge,
            data_loop,
            invoker,
            changes,
            mems: MemMap::new(),
            peers,
            cycles,
            wake_source: None,
            pending: HashMap::new(),
            mix_buffers: HashMap::new(),
            mix_ios: HashMap::new(),
            poll_interval: Duration::from_millis(config.timeout_ms.min(100)),
        };
        remote.flush_changes()?;
        Ok(remote)
    }

    /// Completed graph cycles.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn n_peers(&self) -> usize {
        self.peers.len()
    }

    pub fn is_connected(&self) -> bool {
        self.bridge.is_connected()
    }

    /// Buffers the host set on a peer mix of a port.
    pub fn mix_buffers(&self, direction: Direction, port_id: u32, mix_id: u32) -> &[Arc<BufferSlot>] {
        self.mix_buffers
            .get(&(direction, port_id, mix_id))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn mix_io(&self, direction: Direction, port_id: u32, mix_id: u32, kind: IoKind) -> Option<&MemRegion> {
        self.mix_ios.get(&((direction, port_id, mix_id), kind))
    }

    /// Runs `f` against the hosted node on its data thread.
    pub fn with_node<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut N) -> R + Send + 'static,
    {
        Ok(self.invoker.invoke(move |h| f(&mut h.node))?)
    }

    fn invoke_node<F>(&self, f: F) -> Result<Completion>
    where
        F: FnOnce(&mut N) -> conflux_core::Result<Completion> + Send + 'static,
    {
        Ok(self.invoker.invoke(move |h| f(&mut h.node))??)
    }

    /// Serves at most one event, waiting up to `timeout`. Returns whether one
    /// was served.
    pub fn dispatch(&mut self, timeout: Option<Duration>) -> Result<bool> {
        let Some(incoming) = self.bridge.recv_timeout(timeout) else {
            return Ok(false);
        };
        let (event, fds) = match incoming {
            Incoming::Message { msg, fds } => (msg, fds),
            Incoming::Disconnected(reason) => {
                info!("host went away: {}", reason);
                return Err(BridgeError::Disconnected);
            }
        };
        trace!("remote node <- {:?}", event);

        let seq = event.seq();
        let outcome = self.apply(event, fds);
        self.flush_changes()?;

        match (seq, outcome) {
            (Some(seq), Ok(Completion::Complete)) => self.send(ClientMessage::Done { seq, res: 0 })?,
            (Some(seq), Ok(Completion::Pending { seq: local })) => {
                self.pending.insert(local, seq);
            }
            (Some(seq), Err(e)) => {
                debug!("seq {} failed: {}", seq, e);
                self.send(ClientMessage::Done { seq, res: e.errno() })?
            }
            (None, Err(e)) => warn!("failed to apply event: {}", e),
            (None, Ok(_)) => {}
        }
        Ok(true)
    }

    /// Serves events until the host disconnects.
    pub fn run(&mut self) -> Result<()> {
        loop {
            match self.dispatch(Some(self.poll_interval)) {
                Ok(_) => {}
                Err(BridgeError::Disconnected) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Moves the serving loop onto its own thread.
    pub fn spawn(self) -> Result<RemoteNodeThread<N>> {
        let handle = thread::Builder::new()
            .name("remote-node-control".into())
            .spawn(move || {
                let mut remote = self;
                remote.run()?;
                remote.into_node()
            })?;
        Ok(RemoteNodeThread { handle })
    }

    /// Stops the data loop and hands the node back.
    pub fn into_node(self) -> Result<N> {
        let Self {
            data_loop, bridge, ..
        } = self;
        drop(bridge);
        Ok(data_loop.into_inner()?.node)
    }

    fn send(&self, msg: ClientMessage) -> Result<()> {
        trace!("remote node -> {:?}", msg);
        self.bridge.push(msg, Vec::new())
    }

    fn region(&mut self, memory: Option<MemRef>) -> Result<Option<MemRegion>> {
        memory.map(|m| self.mems.region(&m)).transpose()
    }

    fn apply(&mut self, event: ServerEvent, fds: Vec<OwnedFd>) -> Result<Completion> {
        match event {
            ServerEvent::Transport { node_id, activation } => {
                self.transport(node_id, activation, fds)?;
                Ok(Completion::Complete)
            }
            ServerEvent::AddMem {
                mem_id,
                mem_type,
                flags,
            } => {
                let mut fds = fds.into_iter();
                let (Some(fd), None) = (fds.next(), fds.next()) else {
                    return Err(BridgeError::ProtocolError(format!(
                        "mem id {} needs exactly one fd",
                        mem_id
                    )));
                };
                debug!("mem id {} added ({:?})", mem_id, mem_type);
                self.mems.add(mem_id, mem_type, flags, fd);
                Ok(Completion::Complete)
            }
            ServerEvent::SetIo { kind, memory, .. } => {
                let area = self.region(memory)?;
                self.invoke_node(move |n| n.set_io(kind, area))
            }
            ServerEvent::Command { command, .. } => self.invoke_node(move |n| n.send_command(command)),
            ServerEvent::AddPort {
                direction,
                port_id,
                props,
                ..
            } => self.invoke_node(move |n| n.add_port(direction, port_id, props.as_ref())),
            ServerEvent::RemovePort {
                direction, port_id, ..
            } => {
                self.mix_buffers
                    .retain(|(d, p, _), _| !(*d == direction && *p == port_id));
                self.mix_ios
                    .retain(|((d, p, _), _), _| !(*d == direction && *p == port_id));
                self.invoke_node(move |n| n.remove_port(direction, port_id))
            }
            ServerEvent::PortSetParam {
                direction,
                port_id,
                id,
                param,
                ..
            } => self.invoke_node(move |n| n.port_set_param(direction, port_id, id, param.as_ref())),
            ServerEvent::PortUseBuffers {
                direction,
                port_id,
                mix_id,
                buffers,
                ..
            } => {
                let slots = buffers
                    .iter()
                    .map(|b| self.import_buffer(b))
                    .collect::<Result<Vec<_>>>()?;
                if mix_id == MIX_ID_INVALID {
                    return self.invoke_node(move |n| n.port_use_buffers(direction, port_id, &slots));
                }
                if slots.is_empty() {
                    self.mix_buffers.remove(&(direction, port_id, mix_id));
                } else {
                    self.mix_buffers.insert((direction, port_id, mix_id), slots);
                }
                Ok(Completion::Complete)
            }
            ServerEvent::PortSetIo {
                direction,
                port_id,
                mix_id,
                kind,
                memory,
                ..
            } => {
                let area = self.region(memory)?;
                if mix_id == MIX_ID_INVALID {
                    return self.invoke_node(move |n| n.port_set_io(direction, port_id, kind, area));
                }
                let key = ((direction, port_id, mix_id), kind);
                match area {
                    Some(area) => self.mix_ios.insert(key, area),
                    None => self.mix_ios.remove(&key),
                };
                Ok(Completion::Complete)
            }
            ServerEvent::SetActivation { node_id, memory } => {
                match memory {
                    Some(memory) => {
                        let activation = self.mems.region(&memory)?.view::<Activation>(0)?;
                        let doorbell = Doorbell::from_fds(fds)?;
                        self.peers.add(Peer {
                            node_id,
                            activation,
                            doorbell,
                        });
                    }
                    None => {
                        self.peers.remove(node_id);
                    }
                }
                Ok(Completion::Complete)
            }
        }
    }

    fn transport(&mut self, node_id: u32, activation: MemRef, mut fds: Vec<OwnedFd>) -> Result<()> {
        if fds.len() < 2 || fds.len() % 2 != 0 {
            return Err(BridgeError::ProtocolError(format!(
                "transport needs two doorbells, got {} fds",
                fds.len()
            )));
        }
        let to_host = Doorbell::from_fds(fds.split_off(fds.len() / 2))?;
        let wake = Doorbell::from_fds(fds)?;

        let region = self.mems.region(&activation)?;
        let shared = region.view::<Activation>(0)?;
        let position = region.slice(Activation::POSITION_OFFSET, std::mem::size_of::<Position>())?;

        self.invoke_node_state(move |h| {
            h.node_id = node_id;
            h.activation = Some(shared);
            h.to_host = Some(to_host);
            h.node.set_io(IoKind::Position, Some(position))
        })?;

        if let Some(old) = self.wake_source.take() {
            self.invoker.remove_source(old)?;
        }
        self.wake_source = Some(
            self.invoker
                .add_source(wake, |h: &mut Hosted<N>, bell: &Doorbell, events| h.on_wake(bell, events))?,
        );
        info!("remote node {} transport ready", node_id);
        self.send(ClientMessage::SetActive { active: true })
    }

    fn invoke_node_state<F>(&self, f: F) -> Result<Completion>
    where
        F: FnOnce(&mut Hosted<N>) -> conflux_core::Result<Completion> + Send + 'static,
    {
        Ok(self.invoker.invoke(f)??)
    }

    fn import_buffer(&mut self, wire: &WireBuffer) -> Result<Arc<BufferSlot>> {
        let mut buffer = Buffer::default();
        for meta in &wire.metas {
            buffer.metas.push(Meta {
                kind: meta.kind,
                memory: self.mems.region(&meta.memory)?,
            });
        }
        for data in &wire.datas {
            let chunk = self.mems.region(&data.chunk)?.view::<Chunk>(0)?;
            let (kind, memory) = match data.kind {
                WireDataKind::MemPtr => (DataKind::MemPtr, Some(self.mems.region(&data.memory)?)),
                WireDataKind::MemFd | WireDataKind::DmaBuf => {
                    let fd = self.mems.fd(data.memory.mem_id)?;
                    let mapoffset = data.memory.offset;
                    let kind = if data.kind == WireDataKind::MemFd {
                        DataKind::MemFd { fd, mapoffset }
                    } else {
                        DataKind::DmaBuf { fd, mapoffset }
                    };
                    // Mappable planes are mapped by whoever reads them.
                    let memory = if data.flags.contains(DataFlags::MAPPABLE) {
                        None
                    } else {
                        Some(self.mems.region(&data.memory)?)
                    };
                    (kind, memory)
                }
            };
            buffer.datas.push(Data {
                kind,
                flags: data.flags,
                maxsize: data.maxsize,
                memory,
                chunk,
            });
        }
        Ok(Arc::new(BufferSlot::new(buffer)))
    }

    fn collect_params(&self, port: Option<(Direction, u32)>, infos: &[ParamInfo]) -> Result<Vec<Object>> {
        let ids: Vec<_> = infos
            .iter()
            .filter(|p| p.flags.contains(ParamFlags::READ))
            .map(|p| p.id)
            .collect();
        Ok(self.invoker.invoke(move |h| {
            let mut params = Vec::new();
            for id in ids {
                let results = match port {
                    Some((direction, port_id)) => {
                        h.node
                            .port_enum_params(direction, port_id, id, 0, u32::MAX, None)
                    }
                    None => h.node.enum_params(id, 0, u32::MAX, None),
                };
                match results {
                    Ok(results) => params.extend(results.into_iter().map(|r| r.param)),
                    Err(e) => trace!("param {:?} not enumerable: {}", id, e),
                }
            }
            params
        })?)
    }

    /// Sends every change the hosted node reported since the last flush.
    fn flush_changes(&mut self) -> Result<()> {
        while let Ok(change) = self.changes.try_recv() {
            match change {
                Change::Info(info) => {
                    let mut change_mask = update::MAX_INPUTS | update::MAX_OUTPUTS;
                    let mut params = Vec::new();
                    if info.change_mask & node_change::PARAMS != 0 {
                        change_mask |= update::PARAMS;
                        params = self.collect_params(None, &info.params)?;
                    }
                    if info.change_mask & node_change::PROPS != 0 {
                        change_mask |= update::PROPS;
                    }
                    self.send(ClientMessage::Update {
                        change_mask,
                        max_input_ports: info.max_input_ports,
                        max_output_ports: info.max_output_ports,
                        params,
                        info: Some(info),
                    })?;
                }
                Change::Port(direction, port_id, None) => {
                    self.send(ClientMessage::PortUpdate {
                        direction,
                        port_id,
                        change_mask: 0,
                        params: Vec::new(),
                        info: None,
                    })?;
                }
                Change::Port(direction, port_id, Some(info)) => {
                    let params = self.collect_params(Some((direction, port_id)), &info.params)?;
                    self.send(ClientMessage::PortUpdate {
                        direction,
                        port_id,
                        change_mask: port_update::PARAMS | port_update::INFO,
                        params,
                        info: Some(info),
                    })?;
                }
                Change::Result(local, res) => match self.pending.remove(&local) {
                    Some(seq) => self.send(ClientMessage::Done { seq, res })?,
                    None => trace!("result for unknown seq {}", local),
                },
                Change::Event(event) => self.send(ClientMessage::Event { event })?,
            }
        }
        Ok(())
    }
}

impl<N: Node + 'static> std::fmt::Debug for RemoteNode<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteNode")
            .field("connected", &self.is_connected())
            .field("cycles", &self.cycles())
            .field("mems", &self.mems.len())
            .field("peers", &self.peers.len())
            .finish()
    }
}

/// A [`RemoteNode`] serving on its own thread.
pub struct RemoteNodeThread<N> {
    handle: thread::JoinHandle<Result<N>>,
}

impl<N> RemoteNodeThread<N> {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the host to disconnect and returns the node.
    pub fn join(self) -> Result<N> {
        self.handle
            .join()
            .map_err(|_| BridgeError::InvalidState("remote node thread panicked".into()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{BridgeState, ClientNode};
    use crate::shared_memory::{alloc_buffers, BufferLayout, MemBlock};
    use conflux_core::{AudioInfo, AudioMixer, ParamId, Properties, SampleFormat};

    const WAIT: Duration = Duration::from_secs(5);

    fn config() -> BridgeConfig {
        BridgeConfig {
            shm_prefix: "conflux_test_".into(),
            ..Default::default()
        }
    }

    fn mixer_pair() -> (ClientNode, RemoteNodeThread<AudioMixer>) {
        let (host, remote) = UnixStream::pair().unwrap();
        let node = ClientNode::new(host, 11, config()).unwrap();
        let remote = RemoteNode::new(remote, config(), |support| {
            AudioMixer::new(support, &Properties::new())
        })
        .unwrap();
        (node, remote.spawn().unwrap())
    }

    fn done(node: &mut ClientNode, completion: Completion) -> i32 {
        match completion {
            Completion::Pending { seq } => node.wait_for_done(seq, WAIT).unwrap(),
            Completion::Complete => 0,
        }
    }

    #[test]
    fn test_initial_update_reaches_host() {
        let (mut node, remote) = mixer_pair();
        node.dispatch_until(WAIT, |n| n.port_info(Direction::Output, 0).is_some())
            .unwrap();
        assert!(node.info().max_input_ports > 1);
        assert_eq!(node.info().max_output_ports, 1);

        drop(node);
        remote.join().unwrap();
    }

    #[test]
    fn test_add_port_round_trip() {
        let (mut node, remote) = mixer_pair();
        node.dispatch_until(WAIT, |n| n.info().max_input_ports > 0)
            .unwrap();

        let c = node.add_port(Direction::Input, 0, None).unwrap();
        assert_eq!(done(&mut node, c), 0);
        assert!(node.port_info(Direction::Input, 0).is_some());

        // Output 0 always exists.
        assert!(node.add_port(Direction::Output, 0, None).is_err());

        let format = AudioInfo::raw(SampleFormat::F32, 48000, 2).to_object(ParamId::Format);
        let c = node
            .port_set_param(Direction::Input, 0, ParamId::Format, Some(&format))
            .unwrap();
        assert_eq!(done(&mut node, c), 0);
        assert_eq!(
            node.port_enum_params(Direction::Input, 0, ParamId::Format, 0, 1, None)
                .unwrap()
                .len(),
            1
        );

        let c = node.remove_port(Direction::Input, 0).unwrap();
        assert_eq!(done(&mut node, c), 0);
        assert_eq!(node.n_ports(Direction::Input), 0);

        drop(node);
        remote.join().unwrap();
    }

    #[test]
    fn test_errors_come_back_as_errno() {
        let (mut node, remote) = mixer_pair();
        node.dispatch_until(WAIT, |n| n.port_info(Direction::Output, 0).is_some())
            .unwrap();

        let bogus = AudioInfo::raw(SampleFormat::F32, 48000, 0).to_object(ParamId::Format);
        let c = node
            .port_set_param(Direction::Output, 0, ParamId::Format, Some(&bogus))
            .unwrap();
        assert!(done(&mut node, c) < 0);

        drop(node);
        remote.join().unwrap();
    }

    #[test]
    fn test_buffers_cross_to_the_remote() {
        let (mut node, remote) = mixer_pair();
        node.dispatch_until(WAIT, |n| n.port_info(Direction::Output, 0).is_some())
            .unwrap();
        let format = AudioInfo::raw(SampleFormat::F32, 48000, 1).to_object(ParamId::Format);
        let c = node
            .port_set_param(Direction::Output, 0, ParamId::Format, Some(&format))
            .unwrap();
        assert_eq!(done(&mut node, c), 0);

        let layout = BufferLayout::new(1, 1024);
        let block = MemBlock::create("conflux_test_", "xbufs", 2 * layout.buffer_size()).unwrap();
        let slots = alloc_buffers(&block, 2, &layout).unwrap();
        let c = node.port_use_buffers(Direction::Output, 0, &slots).unwrap();
        assert_eq!(done(&mut node, c), 0);

        // A peer mix is kept beside the node.
        let c = node
            .port_use_buffers_mix(Direction::Output, 0, 3, &slots[..1])
            .unwrap();
        assert_eq!(done(&mut node, c), 0);

        drop(node);
        remote.join().unwrap();
    }

    #[test]
    fn test_transport_runs_cycles() {
        let (mut node, remote) = mixer_pair();
        let ready = node.ready_doorbell().unwrap();
        node.bind().unwrap();
        node.dispatch_until(WAIT, |n| n.state() == BridgeState::Running)
            .unwrap();

        node.activation()
            .position
            .clock
            .duration
            .store(128, Ordering::Relaxed);
        node.process().unwrap();
        assert!(ready.wait(Some(WAIT)).unwrap());
        node.handle_ready().unwrap();
        assert_eq!(
            node.activation().status(),
            Some(crate::activation::ActivationStatus::Finished)
        );

        drop(node);
        remote.join().unwrap();
    }

    #[test]
    fn test_disconnect_ends_run() {
        let (host, remote) = UnixStream::pair().unwrap();
        let remote = RemoteNode::new(remote, config(), |support| {
            AudioMixer::new(support, &Properties::new())
        })
        .unwrap();
        drop(host);
        let thread = remote.spawn().unwrap();
        let mixer = thread.join().unwrap();
        assert_eq!(mixer.info().max_output_ports, 1);
    }
}
