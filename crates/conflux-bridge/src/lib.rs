//! Client-node bridge for conflux
//!
//! Runs a [`Node`](conflux_core::Node) in another process and drives it from
//! the host as if it were local.
//!
//! ## Halves
//!
//! - [`ClientNode`]: host side. Implements `Node` by marshalling every call
//!   over a Unix socket and caching what the remote reports
//! - [`RemoteNode`]: remote side. Hosts the real node on its own data loop
//!   and serves the host's events against it
//!
//! Buffers, io areas and activation records live in shared memory; the
//! socket only carries descriptors and ids. Each cycle is one doorbell ring
//! in each direction.
//!
//! ## Usage
//!
//! ```ignore
//! use conflux_bridge::{BridgeConfig, ClientNode, RemoteNode};
//! use std::os::unix::net::UnixStream;
//!
//! let (host, remote) = UnixStream::pair()?;
//! let remote = RemoteNode::new(remote, BridgeConfig::default(), |support| {
//!     AudioMixer::new(support, &Properties::new())
//! })?
//! .spawn()?;
//!
//! let mut node = ClientNode::new(host, 42, BridgeConfig::default())?;
//! node.bind()?;
//! ```

pub mod error;
pub use error::{BridgeError, Result};

#[doc(hidden)]
pub mod protocol;
pub use protocol::{BridgeConfig, ClientMessage, MemRef, MemType, ServerEvent, MIX_ID_INVALID};

#[doc(hidden)]
pub mod shared_memory;
pub use shared_memory::{alloc_buffers, BufferLayout, MemBlock};

pub mod activation;
pub use activation::{Activation, ActivationStatus, Peer, PeerTable};

mod mem;
pub use mem::{mem_flags, MemMap, MemRegistry};

mod server;
pub use server::{BridgeState, ClientNode};

mod client;
pub use client::{RemoteNode, RemoteNodeThread};

mod lockfree_bridge;
pub use lockfree_bridge::{Incoming, LockFreeBridge};

mod transport;
pub use transport::{MessageTransport, TransportListener};
