//! Error types for the client-node bridge

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Shared memory error: {0}")]
    SharedMemoryError(String),

    #[error("Invalid bridge state: {0}")]
    InvalidState(String),

    #[error("Remote end disconnected")]
    Disconnected,

    #[error("Outgoing message queue is full")]
    QueueFull,

    #[error("Timeout after {duration_ms}ms: {operation}")]
    Timeout { operation: String, duration_ms: u64 },

    #[error(transparent)]
    Core(#[from] conflux_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

impl BridgeError {
    /// Negative errno reported back to the peer in `Done`.
    pub fn errno(&self) -> i32 {
        match self {
            BridgeError::Core(e) => e.errno(),
            BridgeError::Io(e) => -e.raw_os_error().unwrap_or(libc::EIO),
            BridgeError::QueueFull => -libc::EBUSY,
            BridgeError::Timeout { .. } => -libc::ETIMEDOUT,
            BridgeError::Disconnected => -libc::EPIPE,
            BridgeError::ProtocolError(_) | BridgeError::InvalidState(_) => -libc::EINVAL,
            BridgeError::ConnectionFailed(_)
            | BridgeError::SharedMemoryError(_)
            | BridgeError::Serialization(_) => -libc::EIO,
        }
    }
}

/// Node methods on the proxy return core errors.
impl From<BridgeError> for conflux_core::Error {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Core(e) => e,
            BridgeError::Io(e) => conflux_core::Error::Io(e),
            BridgeError::QueueFull => conflux_core::Error::IoBusy("bridge queue is full".into()),
            other => conflux_core::Error::IoError(other.to_string().into()),
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
