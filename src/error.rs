//! Centralized error type for the conflux umbrella crate.
//!
//! Wraps the core and bridge errors so `?` propagates naturally across crate boundaries.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] conflux_core::Error),

    #[cfg(feature = "bridge")]
    #[error("Bridge: {0}")]
    Bridge(#[from] conflux_bridge::BridgeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Negative errno equivalent, as reported in `Done` results.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Core(e) => e.errno(),
            #[cfg(feature = "bridge")]
            Error::Bridge(e) => e.errno(),
            Error::Io(e) => -e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_passes_through() {
        let err: Error = conflux_core::Error::NoSpace {
            count: 65,
            capacity: 64,
        }
        .into();
        assert_eq!(err.errno(), -libc::ENOSPC);

        let io: Error = std::io::Error::from_raw_os_error(libc::EAGAIN).into();
        assert_eq!(io.errno(), -libc::EAGAIN);
    }

    #[cfg(feature = "bridge")]
    #[test]
    fn test_bridge_errors_wrap() {
        let err: Error = conflux_bridge::BridgeError::Disconnected.into();
        assert!(matches!(err, Error::Bridge(_)));
        assert_eq!(err.errno(), -libc::EPIPE);
    }
}
