//! Cross-process wakeup counter.
//!
//! Every `signal(n)` adds `n` to an 8-byte counter; `read()` returns the sum and
//! resets it. On Linux this is an eventfd, elsewhere a non-blocking pipe carrying
//! 8-byte records.

use crate::error::Result;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

#[derive(Debug)]
pub struct Doorbell {
    read: OwnedFd,
    /// Separate write end for the pipe fallback.
    write: Option<OwnedFd>,
}

impl Doorbell {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn new() -> Result<Self> {
        // SAFETY: plain syscall, the returned fd is checked below.
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self {
            // SAFETY: fd is a fresh eventfd we own.
            read: unsafe { OwnedFd::from_raw_fd(fd) },
            write: None,
        })
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub fn new() -> Result<Self> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: fds has room for two descriptors.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: both fds are fresh and owned by us from here on.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        for fd in [&read, &write] {
            set_nonblock_cloexec(fd.as_raw_fd())?;
        }
        Ok(Self {
            read,
            write: Some(write),
        })
    }

    /// Adds `count` to the counter.
    pub fn signal(&self, count: u64) -> Result<()> {
        let fd = self.write.as_ref().unwrap_or(&self.read).as_raw_fd();
        let bytes = count.to_ne_bytes();
        // SAFETY: bytes is a valid 8-byte buffer.
        let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            // A saturated counter still wakes the reader.
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err.into());
        }
        Ok(())
    }

    /// Returns the accumulated count and clears it. 0 when nothing was signalled.
    pub fn read(&self) -> Result<u64> {
        let mut total = 0u64;
        let mut buf = [0u8; 8];
        loop {
            // SAFETY: buf is a valid 8-byte buffer.
            let n = unsafe { libc::read(self.read.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => return Ok(total),
                    io::ErrorKind::Interrupted => continue,
                    _ => return Err(err.into()),
                }
            }
            if n != 8 {
                return Ok(total);
            }
            total = total.saturating_add(u64::from_ne_bytes(buf));
            if self.write.is_none() {
                // eventfd hands out the whole sum in one read.
                return Ok(total);
            }
        }
    }

    /// Blocks until the counter is non-zero or `timeout` passes. Returns whether it fired.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let mut pfd = [libc::pollfd {
            fd: self.read.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        Ok(poll_fds(&mut pfd, timeout)? > 0)
    }

    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            read: self.read.try_clone()?,
            write: self.write.as_ref().map(OwnedFd::try_clone).transpose()?,
        })
    }

    /// Duplicated descriptors for handing to another process.
    pub fn dup_fds(&self) -> Result<Vec<OwnedFd>> {
        let mut fds = vec![self.read.try_clone()?];
        if let Some(write) = &self.write {
            fds.push(write.try_clone()?);
        }
        Ok(fds)
    }

    /// Rebuilds a doorbell from descriptors produced by [`Doorbell::dup_fds`].
    pub fn from_fds(fds: Vec<OwnedFd>) -> Result<Self> {
        let mut fds = fds.into_iter();
        let read = fds.next().ok_or_else(|| {
            crate::Error::InvalidArgument("doorbell needs at least one descriptor".into())
        })?;
        Ok(Self {
            read,
            write: fds.next(),
        })
    }
}

impl AsRawFd for Doorbell {
    fn as_raw_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }
}

impl AsFd for Doorbell {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.read.as_fd()
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_nonblock_cloexec(fd: RawFd) -> Result<()> {
    // SAFETY: fcntl on an fd we own.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Polls `pfds` in place, retrying on EINTR. Returns the number of ready entries.
pub(crate) fn poll_fds(pfds: &mut [libc::pollfd], timeout: Option<Duration>) -> io::Result<usize> {
    let timeout_ms = timeout.map_or(-1, |t| t.as_millis().min(i32::MAX as u128) as i32);
    loop {
        // SAFETY: pfds is a valid array of pollfd for the duration of the call.
        let n = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout_ms) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signals_coalesce() {
        let bell = Doorbell::new().unwrap();
        assert_eq!(bell.read().unwrap(), 0);
        for _ in 0..5 {
            bell.signal(1).unwrap();
        }
        assert_eq!(bell.read().unwrap(), 5);
        assert_eq!(bell.read().unwrap(), 0);
    }

    #[test]
    fn test_wait_times_out() {
        let bell = Doorbell::new().unwrap();
        assert!(!bell.wait(Some(Duration::from_millis(10))).unwrap());
        bell.signal(2).unwrap();
        assert!(bell.wait(Some(Duration::from_millis(10))).unwrap());
        assert_eq!(bell.read().unwrap(), 2);
    }

    #[test]
    fn test_dup_shares_counter() {
        let bell = Doorbell::new().unwrap();
        let other = Doorbell::from_fds(bell.dup_fds().unwrap()).unwrap();
        std::thread::spawn(move || other.signal(3).unwrap())
            .join()
            .unwrap();
        assert_eq!(bell.read().unwrap(), 3);
    }
}
