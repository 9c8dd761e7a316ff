//! Error types for conflux-core.

use std::borrow::Cow;
use thiserror::Error;

/// Error type for node, port and buffer operations.
///
/// Every variant maps onto a negative POSIX errno through [`Error::errno`], which
/// is what crosses process boundaries and lands in `IoBuffers::status`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Invalid param: {0}")]
    InvalidParam(String),

    #[error("Unknown param or io id: {0}")]
    UnknownParam(u32),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Too many buffers: {count} exceeds capacity {capacity}")]
    NoSpace { count: usize, capacity: usize },

    #[error("Port is busy: {0}")]
    IoBusy(String),

    /// Errors raised by `process` carry borrowed messages.
    #[error("IO error: {0}")]
    IoError(Cow<'static, str>),

    #[error("Out of buffers")]
    OutOfBuffers,

    #[error("Buffer {0} is already queued")]
    AlreadyQueued(u32),

    #[error("Invalid memory: {0}")]
    InvalidMemory(String),

    #[error("Missing required support: {0}")]
    MissingSupport(&'static str),

    #[error("Operation must run on the data loop")]
    NotOnDataLoop,

    #[error("Port not found: {direction:?} {port_id}")]
    PortNotFound {
        direction: crate::port::Direction,
        port_id: u32,
    },

    #[error("Data loop is not running")]
    LoopStopped,

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Negative errno equivalent of this error.
    pub fn errno(&self) -> i32 {
        let code = match self {
            Error::InvalidArgument(_)
            | Error::InvalidFormat(_)
            | Error::InvalidParam(_)
            | Error::AlreadyQueued(_)
            | Error::InvalidMemory(_)
            | Error::PortNotFound { .. }
            | Error::InvalidConfig(_)
            | Error::MissingSupport(_) => libc::EINVAL,
            Error::UnknownParam(_) => libc::ENOENT,
            Error::NotSupported(_) => libc::ENOTSUP,
            Error::NoSpace { .. } => libc::ENOSPC,
            Error::IoBusy(_) => libc::EBUSY,
            Error::IoError(_) => libc::EIO,
            Error::OutOfBuffers => libc::EPIPE,
            Error::NotOnDataLoop => libc::EPERM,
            Error::LoopStopped => libc::ESRCH,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        };
        -code
    }

    /// Reconstructs an error from a negative errno reported by a remote peer.
    pub fn from_errno(res: i32) -> Self {
        let code = res.saturating_abs();
        match code {
            libc::ENOENT => Error::UnknownParam(0),
            libc::ENOTSUP => Error::NotSupported("remote".into()),
            libc::ENOSPC => Error::NoSpace {
                count: 0,
                capacity: 0,
            },
            libc::EBUSY => Error::IoBusy("remote".into()),
            libc::EIO => Error::IoError("remote".into()),
            libc::EPIPE => Error::OutOfBuffers,
            libc::EINVAL => Error::InvalidArgument("remote".into()),
            _ => Error::Io(std::io::Error::from_raw_os_error(code)),
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
