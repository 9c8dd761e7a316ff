//! Port state: format, buffer pool and io binding.

use crate::error::{Error, Result};
use crate::format::AudioInfo;
use crate::io::{AsyncBuffers, IoBuffers};
use crate::memory::{MemRegion, SharedRef};
use crate::node::Properties;
use crate::param::{ParamFlags, ParamId, ParamInfo};
use crate::pool::BufferPool;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Direction {
    Input = 0,
    Output = 1,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::Input => Direction::Output,
            Direction::Output => Direction::Input,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PortFlags(u64);

impl PortFlags {
    pub const NONE: PortFlags = PortFlags(0);
    pub const REMOVABLE: PortFlags = PortFlags(1 << 0);
    pub const OPTIONAL: PortFlags = PortFlags(1 << 1);
    pub const CAN_ALLOC_BUFFERS: PortFlags = PortFlags(1 << 2);
    pub const IN_PLACE: PortFlags = PortFlags(1 << 3);
    /// Buffers handed to this port are never kept across cycles.
    pub const NO_REF: PortFlags = PortFlags(1 << 4);
    pub const LIVE: PortFlags = PortFlags(1 << 5);
    pub const PHYSICAL: PortFlags = PortFlags(1 << 6);
    pub const TERMINAL: PortFlags = PortFlags(1 << 7);
    /// Data plane memory may be swapped per cycle.
    pub const DYNAMIC_DATA: PortFlags = PortFlags(1 << 8);

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, other: PortFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: PortFlags) -> Self {
        PortFlags(self.0 | other.0)
    }
}

pub mod port_change {
    pub const FLAGS: u64 = 1 << 0;
    pub const RATE: u64 = 1 << 1;
    pub const PROPS: u64 = 1 << 2;
    pub const PARAMS: u64 = 1 << 3;
    pub const ALL: u64 = FLAGS | RATE | PROPS | PARAMS;
}

/// Published description of a port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortInfo {
    pub change_mask: u64,
    pub flags: PortFlags,
    pub props: Properties,
    pub params: SmallVec<[ParamInfo; 8]>,
}

impl PortInfo {
    pub fn new(flags: PortFlags) -> Self {
        Self {
            change_mask: port_change::ALL,
            flags,
            props: Properties::new(),
            params: SmallVec::new(),
        }
    }

    pub fn param_flags(&self, id: ParamId) -> Option<ParamFlags> {
        self.params.iter().find(|p| p.id == id).map(|p| p.flags)
    }

    pub fn set_param_flags(&mut self, id: ParamId, flags: ParamFlags) {
        if let Some(p) = self.params.iter_mut().find(|p| p.id == id) {
            if p.flags != flags {
                p.flags = flags;
                self.change_mask |= port_change::PARAMS;
            }
        }
    }
}

/// Per-port props. Carried and published, not applied by the mixer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PortProps {
    pub volume: f64,
    pub mute: bool,
}

impl Default for PortProps {
    fn default() -> Self {
        Self {
            volume: 1.0,
            mute: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PortState {
    Unconfigured,
    FormatSet,
    BuffersAttached,
    IoBound,
    Active,
}

#[derive(Debug)]
pub struct Port {
    pub direction: Direction,
    pub id: u32,
    pub info: PortInfo,
    pub props: PortProps,
    pub format: Option<AudioInfo>,
    pub stride: u32,
    pub blocks: u32,
    pub(crate) pool: BufferPool,
    /// Cells indexed by cycle parity.
    pub(crate) io: [Option<SharedRef<IoBuffers>>; 2],
}

impl Port {
    pub fn new(direction: Direction, id: u32, flags: PortFlags) -> Self {
        let mut info = PortInfo::new(flags);
        info.params.extend([
            ParamInfo::new(ParamId::EnumFormat, ParamFlags::READ),
            ParamInfo::new(ParamId::Meta, ParamFlags::READ),
            ParamInfo::new(ParamId::Io, ParamFlags::READ),
            ParamInfo::new(ParamId::Format, ParamFlags::WRITE),
            ParamInfo::new(ParamId::Buffers, ParamFlags::NONE),
        ]);
        Self {
            direction,
            id,
            info,
            props: PortProps::default(),
            format: None,
            stride: 0,
            blocks: 0,
            pool: BufferPool::new(),
            io: [None, None],
        }
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn has_io(&self) -> bool {
        self.io[0].is_some()
    }

    pub fn io(&self, cycle: usize) -> Option<&IoBuffers> {
        self.io[cycle & 1].as_deref()
    }

    pub fn state(&self, started: bool) -> PortState {
        match (self.format.is_some(), !self.pool.is_empty(), self.has_io()) {
            (false, _, _) => PortState::Unconfigured,
            (true, false, _) => PortState::FormatSet,
            (true, true, false) => PortState::BuffersAttached,
            (true, true, true) if started => PortState::Active,
            (true, true, true) => PortState::IoBound,
        }
    }

    /// Records `format` and flips the Format/Buffers param flags.
    pub(crate) fn set_format(&mut self, format: Option<AudioInfo>) {
        match format {
            Some(info) => {
                self.stride = info.stride();
                self.blocks = info.blocks();
                self.format = Some(info);
                self.info.set_param_flags(ParamId::Format, ParamFlags::READWRITE);
                self.info.set_param_flags(ParamId::Buffers, ParamFlags::READ);
            }
            None => {
                self.format = None;
                self.stride = 0;
                self.blocks = 0;
                self.pool.clear();
                self.info.set_param_flags(ParamId::Format, ParamFlags::WRITE);
                self.info.set_param_flags(ParamId::Buffers, ParamFlags::NONE);
            }
        }
    }

    /// Binds the io cells from `area`.
    ///
    /// An area large enough for [`AsyncBuffers`] gives the two cycle slots, with
    /// this port's direction picking which half comes first. A single
    /// [`IoBuffers`] is used for both slots.
    pub(crate) fn bind_io(&mut self, area: Option<&MemRegion>) -> Result<()> {
        let io = match area {
            None => [None, None],
            Some(area) if area.len() >= std::mem::size_of::<AsyncBuffers>() => {
                let size = std::mem::size_of::<IoBuffers>();
                let first = self.direction.index();
                let second = self.direction.reverse().index();
                [
                    Some(area.view::<IoBuffers>(first * size)?),
                    Some(area.view::<IoBuffers>(second * size)?),
                ]
            }
            Some(area) if area.len() >= std::mem::size_of::<IoBuffers>() => {
                let cell = area.view::<IoBuffers>(0)?;
                [Some(cell.clone()), Some(cell)]
            }
            Some(area) => {
                return Err(Error::InvalidArgument(format!(
                    "io area of {} bytes is too small",
                    area.len()
                )))
            }
        };
        self.io = io;
        Ok(())
    }
}
