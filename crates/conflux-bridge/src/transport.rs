//! IPC transport layer
//!
//! Length-prefixed bincode frames over a Unix stream socket. File descriptors
//! ride along as SCM_RIGHTS ancillary data on the first byte of their frame.
//!
//! Frame layout: `[u32 payload len BE][u32 fd count BE][payload]`.

use crate::error::{BridgeError, Result};
use crate::protocol::{ClientMessage, ServerEvent};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::Interest;
use tokio::net::{UnixListener, UnixStream};

pub const MAX_FDS: usize = 16;
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;
const HEADER_LEN: usize = 8;
/// Room for `CMSG_SPACE(MAX_FDS * 4)`, kept u64-aligned.
const CMSG_WORDS: usize = 16;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: libc::c_int = 0;

/// Message transport for IPC. Clones share the socket.
#[derive(Clone)]
pub struct MessageTransport {
    stream: Arc<UnixStream>,
    max_frame: usize,
}

impl MessageTransport {
    /// Create transport from existing Unix stream
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream: Arc::new(stream),
            max_frame: DEFAULT_MAX_FRAME,
        }
    }

    /// Adopts a std stream. Must be called inside the runtime that will drive it.
    pub fn from_std(stream: std::os::unix::net::UnixStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::new(UnixStream::from_std(stream)?))
    }

    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            BridgeError::ConnectionFailed(format!("{}: {}", socket_path.display(), e))
        })?;
        Ok(Self::new(stream))
    }

    /// Connected pair, for in-process wiring and tests.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::new(a), Self::new(b)))
    }

    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// Sends one frame carrying `msg` and duplicates of `fds`.
    pub async fn send<M: Serialize>(&self, msg: &M, fds: &[RawFd]) -> Result<()> {
        if fds.len() > MAX_FDS {
            return Err(BridgeError::ProtocolError(format!(
                "{} descriptors exceed the limit of {}",
                fds.len(),
                MAX_FDS
            )));
        }
        let payload = bincode::serialize(msg)?;
        if payload.len() > self.max_frame {
            return Err(BridgeError::ProtocolError(format!(
                "frame of {} bytes exceeds the limit of {}",
                payload.len(),
                self.max_frame
            )));
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&(fds.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);

        let mut written = 0;
        while written < frame.len() {
            let pending = &frame[written..];
            let attach = if written == 0 { fds } else { &[] };
            let n = self
                .stream
                .async_io(Interest::WRITABLE, || {
                    send_with_fds(self.stream.as_raw_fd(), pending, attach)
                })
                .await?;
            if n == 0 {
                return Err(BridgeError::Disconnected);
            }
            written += n;
        }
        Ok(())
    }

    /// Receives one frame. Fails with `Disconnected` on a clean EOF.
    pub async fn recv<M: DeserializeOwned>(&self) -> Result<(M, Vec<OwnedFd>)> {
        let mut fds = Vec::new();

        let mut header = [0u8; HEADER_LEN];
        self.read_exact(&mut header, &mut fds).await?;
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let n_fds = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if len > self.max_frame {
            return Err(BridgeError::ProtocolError(format!(
                "frame of {} bytes exceeds the limit of {}",
                len, self.max_frame
            )));
        }
        if n_fds > MAX_FDS {
            return Err(BridgeError::ProtocolError(format!(
                "frame announces {} descriptors",
                n_fds
            )));
        }

        let mut payload = vec![0u8; len];
        self.read_exact(&mut payload, &mut fds).await?;
        if fds.len() != n_fds {
            return Err(BridgeError::ProtocolError(format!(
                "expected {} descriptors, received {}",
                n_fds,
                fds.len()
            )));
        }

        let msg = bincode::deserialize(&payload)?;
        Ok((msg, fds))
    }

    async fn read_exact(&self, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self
                .stream
                .async_io(Interest::READABLE, || {
                    recv_with_fds(self.stream.as_raw_fd(), &mut buf[filled..], fds)
                })
                .await?;
            if n == 0 {
                return Err(BridgeError::Disconnected);
            }
            filled += n;
        }
        Ok(())
    }

    pub async fn send_event(&self, event: &ServerEvent, fds: &[RawFd]) -> Result<()> {
        self.send(event, fds).await
    }

    pub async fn recv_event(&self) -> Result<(ServerEvent, Vec<OwnedFd>)> {
        self.recv().await
    }

    pub async fn send_message(&self, msg: &ClientMessage) -> Result<()> {
        self.send(msg, &[]).await
    }

    pub async fn recv_message(&self) -> Result<ClientMessage> {
        let (msg, fds) = self.recv().await?;
        if !fds.is_empty() {
            return Err(BridgeError::ProtocolError(
                "client messages carry no descriptors".into(),
            ));
        }
        Ok(msg)
    }
}

fn send_with_fds(socket: RawFd, data: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };
    let mut cmsg_buf = [0u64; CMSG_WORDS];
    // SAFETY: msghdr is plain old data; zeroed is its empty value.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if !fds.is_empty() {
        let fd_bytes = std::mem::size_of_val(fds) as libc::c_uint;
        // SAFETY: CMSG_* only compute offsets; the buffer holds CMSG_SPACE(fd_bytes)
        // because fds.len() <= MAX_FDS.
        unsafe {
            msg.msg_control = cmsg_buf.as_mut_ptr().cast();
            msg.msg_controllen = libc::CMSG_SPACE(fd_bytes) as _;
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(fd_bytes) as _;
            std::ptr::copy_nonoverlapping(
                fds.as_ptr(),
                libc::CMSG_DATA(cmsg).cast::<RawFd>(),
                fds.len(),
            );
        }
    }

    // SAFETY: msg points at live buffers for the duration of the call.
    let n = unsafe { libc::sendmsg(socket, &msg, SEND_FLAGS) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn recv_with_fds(socket: RawFd, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let mut cmsg_buf = [0u64; CMSG_WORDS];
    // SAFETY: as in send_with_fds.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = std::mem::size_of_val(&cmsg_buf) as _;

    // SAFETY: msg points at live buffers for the duration of the call.
    let n = unsafe { libc::recvmsg(socket, &mut msg, RECV_FLAGS) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let first_new = fds.len();
    // SAFETY: the kernel filled msg_control; CMSG_NXTHDR stays inside msg_controllen.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                let bytes = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                for i in 0..bytes / std::mem::size_of::<RawFd>() {
                    let raw = std::ptr::read_unaligned(data.add(i));
                    fds.push(OwnedFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    for fd in &fds[first_new..] {
        // SAFETY: fd was just received and is owned by us.
        unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) };
    }

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        fds.truncate(first_new);
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "ancillary data truncated",
        ));
    }
    Ok(n as usize)
}

/// Transport listener for accepting connections
pub struct TransportListener {
    listener: UnixListener,
    path: PathBuf,
}

impl TransportListener {
    /// Binds `socket_path`, replacing a stale socket file.
    pub fn bind(socket_path: &Path) -> Result<Self> {
        let _ = std::fs::remove_file(socket_path);
        let listener = UnixListener::bind(socket_path)?;
        Ok(Self {
            listener,
            path: socket_path.to_path_buf(),
        })
    }

    pub async fn accept(&self) -> Result<MessageTransport> {
        let (stream, _) = self.listener.accept().await?;
        Ok(MessageTransport::new(stream))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TransportListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
