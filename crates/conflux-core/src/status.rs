//! Process status bits.

use crate::error::Result;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Status bitmask returned by `process()` and stored in `IoBuffers::status`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Status(u32);

impl Status {
    pub const OK: Status = Status(0);
    pub const NEED_DATA: Status = Status(1 << 0);
    pub const HAVE_DATA: Status = Status(1 << 1);
    pub const STOPPED: Status = Status(1 << 2);
    pub const DRAINED: Status = Status(1 << 3);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Status(bits)
    }

    /// Raw value as stored in an io area. Negative raw values are errors and map to `None`.
    pub fn from_raw(raw: i32) -> Option<Self> {
        u32::try_from(raw).ok().map(Status)
    }

    pub const fn as_raw(self) -> i32 {
        self.0 as i32
    }

    pub const fn contains(self, other: Status) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Status {
    type Output = Status;

    fn bitor(self, rhs: Status) -> Status {
        Status(self.0 | rhs.0)
    }
}

impl BitOrAssign for Status {
    fn bitor_assign(&mut self, rhs: Status) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return write!(f, "Status(OK)");
        }
        let names = [
            (Status::NEED_DATA, "NEED_DATA"),
            (Status::HAVE_DATA, "HAVE_DATA"),
            (Status::STOPPED, "STOPPED"),
            (Status::DRAINED, "DRAINED"),
        ];
        let mut first = true;
        write!(f, "Status(")?;
        for (bit, name) in names {
            if self.contains(bit) {
                if !first {
                    write!(f, " | ")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        write!(f, ")")
    }
}

/// Collapses a process result into the wire integer: status bits or negative errno.
pub fn status_code(result: &Result<Status>) -> i32 {
    match result {
        Ok(status) => status.as_raw(),
        Err(e) => e.errno(),
    }
}
