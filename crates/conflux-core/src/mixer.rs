//! The mixer node: any number of input ports summed into one output port.
//!
//! Two flavors share the engine. The interleaved flavor negotiates one raw
//! format for every port; the DSP flavor fixes ports to mono planar f32 and
//! keeps a list of bound inputs so process does not scan empty slots.
//!
//! A cycle (see [`AudioMixer::process`]):
//! 1. recycle the output buffer the consumer is done with
//! 2. collect every input that has data, marking it consumed
//! 3. with exactly one contributor, alias its descriptor into the output
//! 4. otherwise sum the contributors into a fresh output buffer
//!
//! Nothing on the process path allocates.

use crate::buffer::{Buffer, BufferSlot, ChunkFlags, DataFlags, MetaHeader, MetaType, ID_INVALID};
use crate::config::{MixerConfig, MixerFlavor};
use crate::cpu::CpuFeatures;
use crate::data_loop::LoopRef;
use crate::error::{Error, Result};
use crate::format::{AudioInfo, SampleFormat, MEDIA_SUBTYPE_DSP, MEDIA_SUBTYPE_RAW, MEDIA_TYPE_AUDIO};
use crate::io::{AsyncBuffers, IoBuffers, IoKind, Position};
use crate::memory::{MapAccess, MemRegion, SharedRef};
use crate::mix::MixOps;
use crate::node::{
    Command, Completion, ListenerId, Listeners, Node, NodeCallbacks, NodeEvents, NodeFlags,
    NodeInfo, Properties, Support,
};
use crate::param::{ParamId, ParamResult};
use crate::pod::{self, key, Object, ObjectType, Value};
use crate::pool::{PoolBuffer, MAX_BUFFERS};
use crate::port::{port_change, Direction, Port, PortFlags};
use crate::status::Status;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Input port ids are `0..MAX_PORTS`.
pub const MAX_PORTS: usize = 512;

/// Alignment the kernels want at most.
const MAX_ALIGN: usize = 32;

/// Smallest quantum the advertised buffer size allows.
const MIN_QUANTUM: u32 = 16;

pub struct AudioMixer {
    config: MixerConfig,
    cpu: CpuFeatures,
    max_align: usize,
    data_loop: LoopRef,

    info: NodeInfo,
    listeners: Listeners,
    callbacks: Option<Box<dyn NodeCallbacks>>,
    position: Option<SharedRef<Position>>,

    in_ports: Vec<Option<Box<Port>>>,
    out_port: Port,
    /// One past the highest input id in use.
    last_port: usize,

    /// Ports currently holding a format.
    n_formats: u32,
    format: Option<AudioInfo>,
    ops: Option<MixOps>,
    stride: u32,
    blocks: u32,
    started: bool,

    /// DSP: bound input ids, in bind order.
    mix_list: Vec<u32>,
    /// Input descriptors kept alive while a cycle reads them.
    hold: Vec<Arc<Buffer>>,
}

impl AudioMixer {
    /// Creates a mixer. `props` may carry [`crate::config::KEY_QUANTUM_LIMIT`]
    /// and [`crate::config::KEY_FLAVOR`].
    pub fn new(support: &Support, props: &Properties) -> Result<Self> {
        let data_loop = support
            .data_loop
            .clone()
            .ok_or(Error::MissingSupport("data loop"))?;
        let config = MixerConfig::from_properties(props)?;
        let cpu = support.cpu.unwrap_or_default();
        let max_align = cpu.max_align().min(MAX_ALIGN);

        let mut info = NodeInfo::new(
            MAX_PORTS as u32,
            1,
            NodeFlags::RT.union(NodeFlags::IN_DYNAMIC_PORTS),
        );
        info.change_mask = 0;

        let mut out_port = Port::new(Direction::Output, 0, PortFlags::DYNAMIC_DATA);
        out_port.info.change_mask = 0;

        debug!(
            "audiomixer: {:?} flavor, quantum limit {}, cpu {:?}",
            config.flavor,
            config.quantum_limit,
            cpu.flags()
        );

        Ok(Self {
            config,
            cpu,
            max_align,
            data_loop,
            info,
            listeners: Listeners::new(),
            callbacks: None,
            position: None,
            in_ports: (0..MAX_PORTS).map(|_| None).collect(),
            out_port,
            last_port: 0,
            n_formats: 0,
            format: None,
            ops: None,
            stride: 0,
            blocks: 0,
            started: false,
            mix_list: Vec::with_capacity(MAX_PORTS),
            hold: Vec::with_capacity(MAX_PORTS),
        })
    }

    pub fn config(&self) -> &MixerConfig {
        &self.config
    }

    pub fn flavor(&self) -> MixerFlavor {
        self.config.flavor
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Format shared by every port, once the first port has one.
    pub fn format(&self) -> Option<&AudioInfo> {
        self.format.as_ref()
    }

    pub fn n_formats(&self) -> u32 {
        self.n_formats
    }

    pub fn mix_ops(&self) -> Option<&MixOps> {
        self.ops.as_ref()
    }

    pub fn last_port(&self) -> usize {
        self.last_port
    }

    /// DSP flavor: input ids mixed each cycle.
    pub fn active_inputs(&self) -> &[u32] {
        &self.mix_list
    }

    pub fn port(&self, direction: Direction, port_id: u32) -> Option<&Port> {
        match direction {
            Direction::Input => self.in_ports.get(port_id as usize)?.as_deref(),
            Direction::Output if port_id == 0 => Some(&self.out_port),
            Direction::Output => None,
        }
    }

    fn port_mut(&mut self, direction: Direction, port_id: u32) -> Result<&mut Port> {
        let port = match direction {
            Direction::Input => self
                .in_ports
                .get_mut(port_id as usize)
                .and_then(|p| p.as_deref_mut()),
            Direction::Output if port_id == 0 => Some(&mut self.out_port),
            Direction::Output => None,
        };
        port.ok_or(Error::PortNotFound {
            direction,
            port_id,
        })
    }

    fn is_dsp(&self) -> bool {
        self.config.flavor == MixerFlavor::Dsp
    }

    fn emit_port_info(listeners: &mut Listeners, port: &mut Port, full: bool) {
        let old = if full { port.info.change_mask } else { 0 };
        if full {
            port.info.change_mask = port_change::ALL;
        }
        if port.info.change_mask != 0 {
            listeners.port_info(port.direction, port.id, Some(&port.info));
            port.info.change_mask = old;
        }
    }

    fn enum_format(&self, index: u32) -> Option<Object> {
        if index > 0 {
            return None;
        }
        if let Some(format) = self.format {
            return Some(format.to_object(ParamId::EnumFormat));
        }
        let obj = Object::new(ObjectType::Format, ParamId::EnumFormat)
            .with(key::format::MEDIA_TYPE, Value::Id(MEDIA_TYPE_AUDIO));
        Some(if self.is_dsp() {
            obj.with(key::format::MEDIA_SUBTYPE, Value::Id(MEDIA_SUBTYPE_DSP))
                .with(key::format::AUDIO_FORMAT, Value::Id(SampleFormat::F32P.id()))
        } else {
            obj.with(key::format::MEDIA_SUBTYPE, Value::Id(MEDIA_SUBTYPE_RAW))
                .with(
                    key::format::AUDIO_FORMAT,
                    Value::enum_id(
                        SampleFormat::S8.id(),
                        SampleFormat::INTERLEAVED.iter().map(|f| f.id()),
                    ),
                )
                .with(key::format::AUDIO_RATE, Value::range_int(48000, 1, i32::MAX))
                .with(key::format::AUDIO_CHANNELS, Value::range_int(2, 1, i32::MAX))
        })
    }

    /// Builds the param of class `id` at `index`. `Ok(None)` ends the enumeration.
    fn port_param(&self, port: Option<&Port>, id: ParamId, index: u32) -> Result<Option<Object>> {
        match id {
            ParamId::EnumFormat => Ok(self.enum_format(index)),
            ParamId::Format => {
                let port = port.ok_or_else(|| Error::IoError("format of an unspecified port".into()))?;
                let format = port
                    .format
                    .ok_or_else(|| Error::IoError(format!("port {} has no format", port.id).into()))?;
                Ok((index == 0).then(|| format.to_object(ParamId::Format)))
            }
            ParamId::Buffers => {
                let port = port.ok_or_else(|| Error::IoError("buffers of an unspecified port".into()))?;
                if port.format.is_none() {
                    return Err(Error::IoError(format!("port {} has no format", port.id).into()));
                }
                if index > 0 {
                    return Ok(None);
                }
                let blocks = if self.is_dsp() { 1 } else { self.blocks };
                let stride = u64::from(self.stride);
                let clamp = |v: u64| i32::try_from(v).unwrap_or(i32::MAX);
                Ok(Some(
                    Object::new(ObjectType::ParamBuffers, ParamId::Buffers)
                        .with(
                            key::buffers::BUFFERS,
                            Value::range_int(1, 1, MAX_BUFFERS as i32),
                        )
                        .with(key::buffers::BLOCKS, Value::Int(clamp(u64::from(blocks))))
                        .with(
                            key::buffers::SIZE,
                            Value::range_int(
                                clamp(u64::from(self.config.quantum_limit) * stride),
                                clamp(u64::from(MIN_QUANTUM) * stride),
                                i32::MAX,
                            ),
                        )
                        .with(key::buffers::STRIDE, Value::Int(clamp(stride))),
                ))
            }
            ParamId::Meta => Ok((index == 0).then(|| {
                Object::new(ObjectType::ParamMeta, ParamId::Meta)
                    .with(key::meta::TYPE, Value::Id(MetaType::Header.id()))
                    .with(
                        key::meta::SIZE,
                        Value::Int(std::mem::size_of::<MetaHeader>() as i32),
                    )
            })),
            ParamId::Io => {
                let (kind, size) = match index {
                    0 => (IoKind::Buffers, std::mem::size_of::<IoBuffers>()),
                    1 => (IoKind::AsyncBuffers, std::mem::size_of::<AsyncBuffers>()),
                    _ => return Ok(None),
                };
                Ok(Some(
                    Object::new(ObjectType::ParamIo, ParamId::Io)
                        .with(key::io::ID, Value::Id(kind.as_raw()))
                        .with(key::io::SIZE, Value::Int(size as i32)),
                ))
            }
            other => Err(Error::UnknownParam(other.as_raw())),
        }
    }

    fn set_format(&mut self, direction: Direction, port_id: u32, param: Option<&Object>) -> Result<()> {
        let dsp = self.is_dsp();
        let started = self.started;
        {
            let port = self.port_mut(direction, port_id)?;
            if started && port.has_io() {
                return Err(Error::IoBusy(format!("{:?} port {} is running", direction, port_id)));
            }
        }

        let had_format = self.port(direction, port_id).is_some_and(|p| p.format.is_some());
        match param {
            None => {
                if had_format {
                    self.n_formats = self.n_formats.saturating_sub(1);
                    if self.n_formats == 0 {
                        self.format = None;
                    }
                    self.port_mut(direction, port_id)?.set_format(None);
                    debug!("audiomixer: cleared format on {:?} port {}", direction, port_id);
                }
            }
            Some(obj) => {
                let parsed = AudioInfo::parse(obj)?;
                let info = if dsp {
                    if parsed.subtype != MEDIA_SUBTYPE_DSP || parsed.format != SampleFormat::F32P {
                        return Err(Error::InvalidFormat(format!(
                            "dsp ports take mono f32p, got {:?}",
                            parsed
                        )));
                    }
                    let info = AudioInfo::dsp(parsed.rate);
                    if self.format.is_none() {
                        self.ops = Some(MixOps::select(SampleFormat::F32P, 1, self.cpu.flags())?);
                        self.stride = info.stride();
                        self.blocks = 1;
                        self.format = Some(info);
                    }
                    info
                } else {
                    if parsed.subtype != MEDIA_SUBTYPE_RAW {
                        return Err(Error::InvalidFormat(format!(
                            "media subtype {} is not raw",
                            parsed.subtype
                        )));
                    }
                    match self.format {
                        Some(current) if current != parsed => {
                            return Err(Error::InvalidFormat(format!(
                                "{:?} does not match negotiated {:?}",
                                parsed, current
                            )));
                        }
                        Some(_) => {}
                        None => {
                            if parsed.format == SampleFormat::Unknown || parsed.channels == 0 {
                                return Err(Error::InvalidFormat(format!(
                                    "incomplete format {:?}",
                                    parsed
                                )));
                            }
                            let channels = if parsed.format.is_planar() {
                                1
                            } else {
                                parsed.channels
                            };
                            let ops = MixOps::select(parsed.format, channels, self.cpu.flags())?;
                            debug!("audiomixer: using {} for {:?}", ops.name(), parsed);
                            self.ops = Some(ops);
                            self.stride = parsed.stride();
                            self.blocks = parsed.blocks();
                            self.format = Some(parsed);
                        }
                    }
                    parsed
                };
                if !had_format {
                    self.n_formats += 1;
                }
                self.port_mut(direction, port_id)?.set_format(Some(info));
            }
        }

        let Self {
            listeners,
            in_ports,
            out_port,
            ..
        } = self;
        let port = match direction {
            Direction::Input => match in_ports.get_mut(port_id as usize).and_then(|p| p.as_deref_mut()) {
                Some(port) => port,
                None => return Ok(()),
            },
            Direction::Output => out_port,
        };
        port.info.change_mask |= port_change::PARAMS;
        Self::emit_port_info(listeners, port, false);
        Ok(())
    }

    /// Copies a slot's descriptor for the pool, mapping fd planes where the
    /// flavor maps them.
    fn prepare_buffer(&self, id: u32, slot: &Arc<BufferSlot>) -> Result<PoolBuffer> {
        let current = slot.load();
        let mut own = (*current).clone();
        if own.datas.is_empty() {
            return Err(Error::InvalidMemory(format!("buffer {} has no data planes", id)));
        }

        let mut mapped = false;
        for (j, data) in own.datas.iter_mut().enumerate() {
            if data.memory.is_none() && self.is_dsp() && data.flags.contains(DataFlags::MAPPABLE) {
                if let Some(fd) = data.kind.fd() {
                    let access = if data.flags.contains(DataFlags::WRITABLE) {
                        MapAccess::ReadWrite
                    } else {
                        MapAccess::Read
                    };
                    data.memory = Some(MemRegion::map_fd(
                        Arc::clone(fd),
                        u64::from(data.kind.mapoffset()),
                        data.maxsize as usize,
                        access,
                    )?);
                    mapped = true;
                    debug!("audiomixer: mapped buffer {} plane {}", id, j);
                }
            }
            let memory = data
                .memory
                .as_ref()
                .ok_or_else(|| Error::InvalidMemory(format!("buffer {} plane {} has no memory", id, j)))?;
            if memory.len() < data.maxsize as usize {
                return Err(Error::InvalidMemory(format!(
                    "buffer {} plane {}: maxsize {} exceeds {} mapped bytes",
                    id,
                    j,
                    data.maxsize,
                    memory.len()
                )));
            }
            if !memory.is_aligned(self.max_align) {
                warn!(
                    "audiomixer: buffer {} plane {} not aligned to {}",
                    id, j, self.max_align
                );
            }
        }

        Ok(PoolBuffer::new(id, Arc::clone(slot), own, mapped))
    }
}

impl Node for AudioMixer {
    fn info(&self) -> &NodeInfo {
        &self.info
    }

    fn add_listener(&mut self, events: Box<dyn NodeEvents>) -> ListenerId {
        let Self {
            listeners,
            info,
            in_ports,
            out_port,
            last_port,
            ..
        } = self;
        let (id, events) = listeners.add(events);

        let mut full = info.clone();
        full.change_mask = crate::node::node_change::ALL;
        events.info(&full);

        let mut out_info = out_port.info.clone();
        out_info.change_mask = port_change::ALL;
        events.port_info(Direction::Output, 0, Some(&out_info));

        for port in in_ports[..*last_port].iter().flatten() {
            let mut port_info = port.info.clone();
            port_info.change_mask = port_change::ALL;
            events.port_info(Direction::Input, port.id, Some(&port_info));
        }
        id
    }

    fn remove_listener(&mut self, id: ListenerId) {
        self.listeners.remove(id);
    }

    fn set_callbacks(&mut self, callbacks: Option<Box<dyn NodeCallbacks>>) {
        self.callbacks = callbacks;
    }

    fn send_command(&mut self, command: Command) -> Result<Completion> {
        match command {
            Command::Start => self.started = true,
            Command::Pause => self.started = false,
            other => return Err(Error::NotSupported(format!("command {:?}", other))),
        }
        debug!("audiomixer: {:?}", command);
        Ok(Completion::Complete)
    }

    fn set_io(&mut self, kind: IoKind, area: Option<MemRegion>) -> Result<Completion> {
        if !self.data_loop.can_access() {
            return Err(Error::NotOnDataLoop);
        }
        match kind {
            IoKind::Position => {
                self.position = area.map(|a| a.view::<Position>(0)).transpose()?;
                Ok(Completion::Complete)
            }
            other => Err(Error::NotSupported(format!("node io {:?}", other))),
        }
    }

    fn add_port(
        &mut self,
        direction: Direction,
        port_id: u32,
        props: Option<&Properties>,
    ) -> Result<Completion> {
        let idx = port_id as usize;
        if direction != Direction::Input || idx >= MAX_PORTS || self.in_ports[idx].is_some() {
            return Err(Error::InvalidArgument(format!(
                "cannot add {:?} port {}",
                direction, port_id
            )));
        }

        let mut port = Box::new(Port::new(
            Direction::Input,
            port_id,
            PortFlags::NO_REF
                .union(PortFlags::DYNAMIC_DATA)
                .union(PortFlags::REMOVABLE)
                .union(PortFlags::OPTIONAL),
        ));
        if let Some(props) = props {
            port.info.props = props.clone();
        }
        port.info.change_mask = 0;

        self.last_port = self.last_port.max(idx + 1);
        Self::emit_port_info(&mut self.listeners, &mut port, true);
        self.in_ports[idx] = Some(port);
        debug!("audiomixer: added input port {}, last port {}", port_id, self.last_port);
        Ok(Completion::Complete)
    }

    fn remove_port(&mut self, direction: Direction, port_id: u32) -> Result<Completion> {
        let idx = port_id as usize;
        let port = match direction {
            Direction::Input => self.in_ports.get_mut(idx).and_then(Option::take),
            Direction::Output => None,
        };
        let port = port.ok_or(Error::PortNotFound {
            direction,
            port_id,
        })?;

        if port.format.is_some() && self.n_formats > 0 {
            self.n_formats -= 1;
            if self.n_formats == 0 {
                self.format = None;
            }
        }
        if idx + 1 == self.last_port {
            self.last_port = self.in_ports[..idx]
                .iter()
                .rposition(Option::is_some)
                .map_or(0, |i| i + 1);
        }
        self.mix_list.retain(|&id| id != port_id);

        self.listeners.port_info(direction, port_id, None);
        debug!("audiomixer: removed input port {}", port_id);
        Ok(Completion::Complete)
    }

    fn port_enum_params(
        &self,
        direction: Direction,
        port_id: u32,
        id: ParamId,
        start: u32,
        num: u32,
        filter: Option<&Object>,
    ) -> Result<Vec<ParamResult>> {
        if num == 0 {
            return Err(Error::InvalidArgument("num must be at least 1".into()));
        }
        let port = if direction == Direction::Input && port_id == ID_INVALID {
            None
        } else {
            Some(self.port(direction, port_id).ok_or(Error::PortNotFound {
                direction,
                port_id,
            })?)
        };

        let mut results = Vec::new();
        let mut index = start;
        while let Some(param) = self.port_param(port, id, index)? {
            let next = index + 1;
            if let Some(param) = pod::filter(&param, filter) {
                results.push(ParamResult {
                    id,
                    index,
                    next,
                    param,
                });
                if results.len() as u32 == num {
                    break;
                }
            }
            index = next;
        }
        Ok(results)
    }

    fn port_set_param(
        &mut self,
        direction: Direction,
        port_id: u32,
        id: ParamId,
        param: Option<&Object>,
    ) -> Result<Completion> {
        self.port_mut(direction, port_id)?;
        match id {
            ParamId::Format => {
                self.set_format(direction, port_id, param)?;
                Ok(Completion::Complete)
            }
            other => Err(Error::UnknownParam(other.as_raw())),
        }
    }

    fn port_use_buffers(
        &mut self,
        direction: Direction,
        port_id: u32,
        buffers: &[Arc<BufferSlot>],
    ) -> Result<Completion> {
        let started = self.started;
        let port = self.port_mut(direction, port_id)?;
        if started && port.has_io() {
            return Err(Error::IoBusy(format!("{:?} port {} is running", direction, port_id)));
        }
        if !buffers.is_empty() && port.format.is_none() {
            return Err(Error::IoError(
                format!("{:?} port {} has no format", direction, port_id).into(),
            ));
        }
        if buffers.len() > MAX_BUFFERS {
            return Err(Error::NoSpace {
                count: buffers.len(),
                capacity: MAX_BUFFERS,
            });
        }

        let entries = buffers
            .iter()
            .enumerate()
            .map(|(i, slot)| self.prepare_buffer(i as u32, slot))
            .collect::<Result<Vec<_>>>()?;
        // Callers see mapped planes only once the whole set is accepted.
        for entry in entries.iter().filter(|e| e.is_mapped()) {
            entry.slot.store(Arc::clone(&entry.own));
        }

        let port = self.port_mut(direction, port_id)?;
        port.pool.attach(entries)?;
        if direction == Direction::Output {
            port.pool.queue_all();
        }
        debug!(
            "audiomixer: {:?} port {} uses {} buffers",
            direction,
            port_id,
            buffers.len()
        );
        Ok(Completion::Complete)
    }

    fn port_set_io(
        &mut self,
        direction: Direction,
        port_id: u32,
        kind: IoKind,
        area: Option<MemRegion>,
    ) -> Result<Completion> {
        self.port_mut(direction, port_id)?;
        if !matches!(kind, IoKind::Buffers | IoKind::AsyncBuffers) {
            return Err(Error::UnknownParam(kind.as_raw()));
        }
        if !self.data_loop.can_access() {
            return Err(Error::NotOnDataLoop);
        }

        let bound = area.is_some();
        self.port_mut(direction, port_id)?.bind_io(area.as_ref())?;

        if self.is_dsp() && direction == Direction::Input {
            let listed = self.mix_list.contains(&port_id);
            if bound && !listed {
                self.mix_list.push(port_id);
            } else if !bound && listed {
                self.mix_list.retain(|&id| id != port_id);
            }
        }
        trace!("audiomixer: {:?} port {} io {:?} bound {}", direction, port_id, kind, bound);
        Ok(Completion::Complete)
    }

    fn port_reuse_buffer(&mut self, port_id: u32, buffer_id: u32) -> Result<()> {
        if port_id != 0 {
            return Err(Error::PortNotFound {
                direction: Direction::Output,
                port_id,
            });
        }
        if buffer_id as usize >= self.out_port.pool.len() {
            return Err(Error::InvalidArgument(format!("no buffer {}", buffer_id)));
        }
        self.out_port.pool.queue(buffer_id)
    }

    /// Runs one cycle.
    ///
    /// Returns `HAVE_DATA | NEED_DATA` after producing, or `HAVE_DATA` while the
    /// previous output is still unconsumed.
    fn process(&mut self) -> Result<Status> {
        let cycle = self
            .position
            .as_ref()
            .map_or(0, |p| (p.clock.cycle() & 1) as usize);

        let Self {
            config,
            in_ports,
            out_port: out,
            last_port,
            ops,
            stride,
            mix_list,
            hold,
            ..
        } = self;

        let outio = out.io[cycle]
            .as_deref()
            .ok_or_else(|| Error::IoError("output io not bound".into()))?;
        if outio.status() == Status::HAVE_DATA.as_raw() {
            return Ok(Status::HAVE_DATA);
        }

        let recycled = outio.buffer_id();
        if (recycled as usize) < out.pool.len() {
            if let Err(e) = out.pool.queue(recycled) {
                trace!("audiomixer: recycle {}: {}", recycled, e);
            }
            outio.set_buffer_id(ID_INVALID);
        }

        let mut datas = [std::ptr::null::<u8>(); MAX_PORTS];
        let mut n = 0usize;
        let mut maxsize = u32::MAX;
        hold.clear();

        {
            let mut visit = |port: &Port| {
                let Some(inio) = port.io[cycle].as_deref() else {
                    return;
                };
                let id = inio.buffer_id();
                if id as usize >= port.pool.len() || inio.status() != Status::HAVE_DATA.as_raw() {
                    trace!("audiomixer: input {} not ready ({}, {})", port.id, id, inio.status());
                    return;
                }
                let Some(inb) = port.pool.get(id) else {
                    return;
                };
                let current = inb.slot.load();
                let src = current.datas.first().and_then(|bd| {
                    let chunk = &bd.chunk;
                    let offs = chunk.offset().min(bd.maxsize);
                    let size = (bd.maxsize - offs).min(chunk.size());
                    maxsize = maxsize.min(size);
                    if chunk.flags().contains(ChunkFlags::EMPTY) {
                        return None;
                    }
                    match bd.memory.as_ref() {
                        Some(mem) if offs as usize + size as usize <= mem.len() => {
                            // SAFETY: offs + size lies inside the region.
                            Some(unsafe { mem.as_ptr().add(offs as usize) }.cast_const())
                        }
                        _ => {
                            trace!("audiomixer: input {} buffer {} unreadable", port.id, id);
                            None
                        }
                    }
                });
                if let Some(src) = src {
                    datas[n] = src;
                    n += 1;
                    hold.push(current);
                }
                inio.set_status(Status::NEED_DATA.as_raw());
            };

            match config.flavor {
                MixerFlavor::Interleaved => {
                    for port in in_ports[..*last_port].iter().flatten() {
                        visit(port);
                    }
                }
                MixerFlavor::Dsp => {
                    for &id in mix_list.iter() {
                        if let Some(port) = in_ports[id as usize].as_deref() {
                            visit(port);
                        }
                    }
                }
            }
        }

        let Some(out_id) = out.pool.dequeue() else {
            if !out.pool.is_empty() {
                warn!("audiomixer: out of buffers ({})", out.pool.len());
            }
            hold.clear();
            return Err(Error::OutOfBuffers);
        };
        let Some(outb) = out.pool.get(out_id) else {
            hold.clear();
            return Err(Error::OutOfBuffers);
        };

        let out_data = outb.own.datas.first();
        let passthrough = n == 1
            && match config.flavor {
                MixerFlavor::Interleaved => true,
                MixerFlavor::Dsp => out_data.is_some_and(|d| d.flags.contains(DataFlags::DYNAMIC)),
            };

        if passthrough {
            outb.slot.store(Arc::clone(&hold[0]));
        } else {
            let mixed = match (ops.as_ref(), out_data) {
                (Some(ops), Some(d)) => d.memory.as_ref().map(|mem| (ops, d, mem)),
                _ => None,
            };
            let Some((ops, d, mem)) = mixed else {
                hold.clear();
                if let Err(e) = out.pool.queue(out_id) {
                    trace!("audiomixer: requeue {}: {}", out_id, e);
                }
                return Err(Error::IoError("output buffer cannot be mixed into".into()));
            };
            outb.slot.store(Arc::clone(&outb.own));

            let maxsize = maxsize.min(d.maxsize);
            let flags = d.chunk.flags().update(ChunkFlags::EMPTY, n == 0);
            d.chunk.set(0, maxsize, *stride as i32, flags);

            let frames = maxsize.checked_div(*stride).unwrap_or(0) as usize;
            trace!("audiomixer: {} inputs, {} frames with {}", n, frames, ops.name());
            // SAFETY: every source holds at least maxsize bytes past its offset,
            // the output region at least d.maxsize, all kept alive by `hold`/`outb`.
            unsafe { ops.process(mem.as_ptr(), &datas[..n], frames) };
        }
        hold.clear();

        outio.set(Status::HAVE_DATA.as_raw(), out_id);
        Ok(Status::HAVE_DATA | Status::NEED_DATA)
    }
}
