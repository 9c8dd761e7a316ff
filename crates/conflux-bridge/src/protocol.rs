//! IPC protocol between the host-side proxy and the remote node.
//!
//! Every frame carries one message plus the file descriptors listed in the
//! message's docs, in that order.

use conflux_core::{
    Command, DataFlags, Direction, IoKind, MetaType, NodeEvent, NodeInfo, Object, ParamId,
    PortInfo, Properties,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Addresses the port's own mix.
pub const MIX_ID_INVALID: u32 = u32::MAX;
pub const MEM_ID_INVALID: u32 = u32::MAX;
/// Mixes per port, not counting the port's own mix.
pub const MAX_MIX: usize = 128;
/// IO areas bound per mix.
pub const MAX_IO: usize = 32;

/// `change_mask` bits of [`ClientMessage::Update`].
pub mod update {
    pub const MAX_INPUTS: u32 = 1 << 0;
    pub const MAX_OUTPUTS: u32 = 1 << 1;
    pub const PARAMS: u32 = 1 << 2;
    pub const PROPS: u32 = 1 << 3;
}

/// `change_mask` bits of [`ClientMessage::PortUpdate`]. An empty mask removes the port.
pub mod port_update {
    pub const PARAMS: u32 = 1 << 0;
    pub const INFO: u32 = 1 << 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemType {
    MemFd,
    DmaBuf,
}

/// Byte range inside a registered memory block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemRef {
    pub mem_id: u32,
    pub offset: u32,
    pub size: u32,
}

impl MemRef {
    pub const fn new(mem_id: u32, offset: u32, size: u32) -> Self {
        Self {
            mem_id,
            offset,
            size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireDataKind {
    /// The plane lives at `memory` inside a shared block.
    MemPtr,
    /// The plane is its own fd; `memory.offset` is the map offset.
    MemFd,
    DmaBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMeta {
    pub kind: MetaType,
    pub memory: MemRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireData {
    pub kind: WireDataKind,
    pub flags: DataFlags,
    pub maxsize: u32,
    pub memory: MemRef,
    pub chunk: MemRef,
}

/// Buffer descriptor as seen by the remote: mem ids and offsets only.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WireBuffer {
    pub metas: Vec<WireMeta>,
    pub datas: Vec<WireData>,
}

/// Host → remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerEvent {
    /// fds: the host→remote doorbell, then the remote→host doorbell. Each is
    /// one or two descriptors and both use the same count. The activation
    /// block was announced with `AddMem` before.
    Transport { node_id: u32, activation: MemRef },
    /// fds: the memory.
    AddMem {
        mem_id: u32,
        mem_type: MemType,
        flags: u32,
    },
    SetIo {
        seq: u32,
        kind: IoKind,
        memory: Option<MemRef>,
    },
    Command {
        seq: u32,
        command: Command,
    },
    AddPort {
        seq: u32,
        direction: Direction,
        port_id: u32,
        props: Option<Properties>,
    },
    RemovePort {
        seq: u32,
        direction: Direction,
        port_id: u32,
    },
    PortSetParam {
        seq: u32,
        direction: Direction,
        port_id: u32,
        id: ParamId,
        param: Option<Object>,
    },
    PortUseBuffers {
        seq: u32,
        direction: Direction,
        port_id: u32,
        mix_id: u32,
        buffers: Vec<WireBuffer>,
    },
    PortSetIo {
        seq: u32,
        direction: Direction,
        port_id: u32,
        mix_id: u32,
        kind: IoKind,
        memory: Option<MemRef>,
    },
    /// fds: the peer's doorbell when `memory` is set. `None` removes the peer.
    SetActivation {
        node_id: u32,
        memory: Option<MemRef>,
    },
}

impl ServerEvent {
    /// Sequence number of events answered with `Done`.
    pub fn seq(&self) -> Option<u32> {
        match self {
            ServerEvent::SetIo { seq, .. }
            | ServerEvent::Command { seq, .. }
            | ServerEvent::AddPort { seq, .. }
            | ServerEvent::RemovePort { seq, .. }
            | ServerEvent::PortSetParam { seq, .. }
            | ServerEvent::PortUseBuffers { seq, .. }
            | ServerEvent::PortSetIo { seq, .. } => Some(*seq),
            ServerEvent::Transport { .. }
            | ServerEvent::AddMem { .. }
            | ServerEvent::SetActivation { .. } => None,
        }
    }

}

/// Remote → host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    Update {
        change_mask: u32,
        max_input_ports: u32,
        max_output_ports: u32,
        params: Vec<Object>,
        info: Option<NodeInfo>,
    },
    PortUpdate {
        direction: Direction,
        port_id: u32,
        change_mask: u32,
        params: Vec<Object>,
        info: Option<PortInfo>,
    },
    SetActive {
        active: bool,
    },
    Event {
        event: NodeEvent,
    },
    /// `res` is 0 or a negative errno.
    Done {
        seq: u32,
        res: i32,
    },
}

/// Bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub socket_path: PathBuf,
    pub shm_prefix: String,
    pub timeout_ms: u64,
    /// Capacity of the outgoing message queue.
    pub queue_size: usize,
    pub max_frame_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            socket_path: std::env::temp_dir().join("conflux-client-node.sock"),
            shm_prefix: "conflux_".to_string(),
            timeout_ms: 5000,
            queue_size: 256,
            max_frame_size: 16 * 1024 * 1024,
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> conflux_core::Result<()> {
        use conflux_core::Error;

        if self.shm_prefix.is_empty() || self.shm_prefix.contains('/') {
            return Err(Error::InvalidConfig(format!(
                "shm prefix {:?} must be a non-empty file name",
                self.shm_prefix
            )));
        }
        if self.queue_size == 0 {
            return Err(Error::InvalidConfig("queue size must be non-zero".into()));
        }
        if self.max_frame_size < 64 {
            return Err(Error::InvalidConfig(format!(
                "max frame size {} is too small",
                self.max_frame_size
            )));
        }
        Ok(())
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conflux_core::{AudioInfo, SampleFormat};

    #[test]
    fn test_event_serialization() {
        let format = AudioInfo::raw(SampleFormat::F32, 48000, 2).to_object(ParamId::Format);
        let event = ServerEvent::PortSetParam {
            seq: 7,
            direction: Direction::Input,
            port_id: 3,
            id: ParamId::Format,
            param: Some(format.clone()),
        };

        let encoded = bincode::serialize(&event).unwrap();
        let decoded: ServerEvent = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.seq(), Some(7));
    }

    #[test]
    fn test_seq_only_on_answered_events() {
        let transport = ServerEvent::Transport {
            node_id: 1,
            activation: MemRef::new(0, 0, 64),
        };
        assert_eq!(transport.seq(), None);

        let removed = ServerEvent::SetActivation {
            node_id: 4,
            memory: None,
        };
        assert_eq!(removed.seq(), None);

        let command = ServerEvent::Command {
            seq: 9,
            command: Command::Start,
        };
        assert_eq!(command.seq(), Some(9));
    }

    #[test]
    fn test_bridge_config_default() {
        let config = BridgeConfig::default();
        assert_eq!(config.timeout_ms, 5000);
        assert!(config.validate().is_ok());

        let json = serde_json::to_string(&config).unwrap();
        let back: BridgeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.queue_size, config.queue_size);
    }

    #[test]
    fn test_bridge_config_rejects_bad_prefix() {
        let config = BridgeConfig {
            shm_prefix: "a/b".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
