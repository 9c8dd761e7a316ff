//! Param ids and the per-node/per-port param info table.

use serde::{Deserialize, Serialize};

/// Identifies a class of params on a node or port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ParamId {
    Invalid = 0,
    PropInfo = 1,
    Props = 2,
    EnumFormat = 3,
    Format = 4,
    Buffers = 5,
    Meta = 6,
    Io = 7,
    Latency = 15,
}

impl ParamId {
    pub fn as_raw(self) -> u32 {
        self as u32
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => ParamId::Invalid,
            1 => ParamId::PropInfo,
            2 => ParamId::Props,
            3 => ParamId::EnumFormat,
            4 => ParamId::Format,
            5 => ParamId::Buffers,
            6 => ParamId::Meta,
            7 => ParamId::Io,
            15 => ParamId::Latency,
            _ => return None,
        })
    }
}

/// Access flags of a [`ParamInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ParamFlags(u32);

impl ParamFlags {
    pub const NONE: ParamFlags = ParamFlags(0);
    pub const SERIAL: ParamFlags = ParamFlags(1 << 0);
    pub const READ: ParamFlags = ParamFlags(1 << 1);
    pub const WRITE: ParamFlags = ParamFlags(1 << 2);
    pub const READWRITE: ParamFlags = ParamFlags((1 << 1) | (1 << 2));

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: ParamFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Advertises one param id and whether it can be read and/or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamInfo {
    pub id: ParamId,
    pub flags: ParamFlags,
}

impl ParamInfo {
    pub const fn new(id: ParamId, flags: ParamFlags) -> Self {
        Self { id, flags }
    }
}

/// One emitted param: its enumeration index, the index to resume from, and the param.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamResult {
    pub id: ParamId,
    pub index: u32,
    pub next: u32,
    pub param: crate::pod::Object,
}
