//! # Conflux - Real-time Node Graph Core
//!
//! Node, port and buffer negotiation for audio graphs, built from two crates.
//!
//! ## Architecture
//!
//! Conflux is an umbrella crate that coordinates:
//! - **conflux-core** - Node contract, ports, buffer pool, audiomixer, SIMD mix kernels, data loop
//! - **conflux-bridge** - Client-node bridge (remote nodes over shared memory and doorbells)
//!
//! ## Quick Start
//!
//! ```ignore
//! use conflux::prelude::*;
//!
//! let support = Support::new()
//!     .with_cpu(CpuFeatures::detect())
//!     .with_data_loop(LoopRef::detached("data"));
//! let mut mixer = AudioMixer::new(&support, &Properties::new())?;
//!
//! mixer.add_port(Direction::Input, 0, None)?;
//! let format = AudioInfo::raw(SampleFormat::F32, 48000, 2).to_object(ParamId::Format);
//! mixer.port_set_param(Direction::Input, 0, ParamId::Format, Some(&format))?;
//! mixer.port_set_param(Direction::Output, 0, ParamId::Format, Some(&format))?;
//! ```
//!
//! ## Feature Flags
//!
//! - `default` - Core plus the bridge
//! - `bridge` - Client-node bridge (Unix only)

/// Re-export of conflux-core for direct access
pub use conflux_core as core;

pub use conflux_core::{
    AudioInfo, AudioMixer, Buffer, BufferPool, BufferSlot, Chunk, ChunkFlags, Command, Completion,
    CpuFeatures, CpuFlags, Data, DataFlags, DataKind, DataLoop, Direction, Doorbell, Invoker,
    IoBuffers, IoKind, LoopRef, MemRegion, MixOps, MixerConfig, MixerFlavor, Node, NodeCallbacks,
    NodeEvents, NodeInfo, Object, ParamId, PortInfo, Position, Properties, SampleFormat,
    SharedRef, Status, Support, MAX_BUFFERS,
};

/// Re-export of conflux-bridge for direct access
#[cfg(feature = "bridge")]
pub use conflux_bridge as bridge;

#[cfg(feature = "bridge")]
pub use conflux_bridge::{BridgeConfig, BridgeError, ClientNode, RemoteNode};

mod error;
pub use error::{Error, Result};

/// Prelude module for convenient imports
///
/// ```ignore
/// use conflux::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{Error, Result};

    pub use conflux_core::{
        AudioInfo, AudioMixer, Buffer, BufferSlot, Command, Completion, CpuFeatures, Data,
        DataFlags, Direction, IoBuffers, IoKind, LoopRef, MemRegion, MixOps, Node, ParamId,
        Properties, SampleFormat, Status, Support,
    };

    #[cfg(feature = "bridge")]
    pub use conflux_bridge::{BridgeConfig, ClientNode, RemoteNode};
}
