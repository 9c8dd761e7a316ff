//! Node, port and buffer negotiation for real-time audio graphs.
//!
//! # Primary API
//!
//! - [`Node`]: The contract every graph node implements
//! - [`AudioMixer`]: Sums any number of input ports into one output port
//! - [`MixOps`]: Per-format mixing kernels with runtime SIMD selection
//! - [`BufferPool`]: Fixed-capacity buffer bookkeeping with a free queue
//! - [`DataLoop`] / [`Invoker`]: Serialized execution on the data thread
//!
//! # Example
//!
//! ```ignore
//! use conflux_core::prelude::*;
//!
//! let support = Support::new()
//!     .with_cpu(CpuFeatures::detect())
//!     .with_data_loop(LoopRef::detached("data"));
//! let mut mixer = AudioMixer::new(&support, &Properties::new())?;
//!
//! mixer.add_port(Direction::Input, 0, None)?;
//! let format = AudioInfo::raw(SampleFormat::F32, 48000, 2).to_object(ParamId::Format);
//! mixer.port_set_param(Direction::Input, 0, ParamId::Format, Some(&format))?;
//! ```

pub mod error;
pub use error::{Error, Result};

pub mod status;
pub use status::{status_code, Status};

pub mod param;
pub use param::{ParamFlags, ParamId, ParamInfo, ParamResult};

pub mod pod;
pub use pod::{Object, ObjectType, Value};

pub mod format;
pub use format::{AudioInfo, SampleFormat};

pub mod cpu;
pub use cpu::{CpuFeatures, CpuFlags};

pub mod memory;
pub use memory::{MapAccess, MemRegion, SharedRef, ShmSafe};

pub mod buffer;
pub use buffer::{
    Buffer, BufferSlot, Chunk, ChunkFlags, Data, DataFlags, DataKind, Meta, MetaHeader, MetaType,
    ID_INVALID,
};

pub mod io;
pub use io::{AsyncBuffers, Clock, IoBuffers, IoKind, Position};

pub mod pool;
pub use pool::{BufferPool, PoolBuffer, MAX_BUFFERS};

pub mod port;
pub use port::{Direction, Port, PortFlags, PortInfo, PortProps, PortState};

pub mod node;
pub use node::{
    Command, Completion, ListenerId, Listeners, Node, NodeCallbacks, NodeEvent, NodeEvents,
    NodeFlags, NodeInfo, ParamIter, Properties, Support,
};

pub mod doorbell;
pub use doorbell::Doorbell;

pub mod data_loop;
pub use data_loop::{DataLoop, Invoker, LoopRef, SourceEvents, SourceId};

pub mod config;
pub use config::{MixerConfig, MixerFlavor};

pub mod mix;
pub use mix::{MixFn, MixOps};

pub mod mixer;
pub use mixer::{AudioMixer, MAX_PORTS};

pub mod prelude {
    pub use crate::{
        AudioInfo, AudioMixer, Buffer, BufferSlot, Command, CpuFeatures, Data, DataFlags,
        Direction, Error, IoBuffers, IoKind, LoopRef, MemRegion, MixOps, Node, ParamId,
        Properties, Result, SampleFormat, Status, Support,
    };
}
