//! Test helpers and fixtures for conflux integration tests
//!
//! ## Tolerance Levels
//!
//! Use the appropriate tolerance from [`tolerances`] module:
//! - `FLOAT_EPSILON` (1e-6): Exact operations (passthrough, two-input sums)
//! - `KERNEL_EPSILON` (1e-5): Many-input sums through SIMD kernels

#![allow(dead_code)]

pub mod alloc_counter;
pub mod tolerances;

use conflux::core::{ChunkFlags, Meta, MetaHeader, MetaType};
use conflux::prelude::*;
use std::sync::Arc;

/// Default test sample rate (matches common hardware)
pub const TEST_SAMPLE_RATE: u32 = 48000;

/// Frames per test buffer
pub const TEST_FRAMES: usize = 64;

/// Installs a fmt subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Support with detected CPU features and a detached data loop, so every
/// call counts as being on the loop.
pub fn test_support() -> Support {
    Support::new()
        .with_cpu(CpuFeatures::detect())
        .with_data_loop(LoopRef::detached("test"))
}

pub fn test_mixer(flavor: &str) -> AudioMixer {
    AudioMixer::new(
        &test_support(),
        &Properties::new().with(conflux::core::config::KEY_FLAVOR, flavor),
    )
    .expect("Failed to create mixer")
}

pub fn f32_format(channels: u32) -> conflux::Object {
    AudioInfo::raw(SampleFormat::F32, TEST_SAMPLE_RATE, channels).to_object(ParamId::Format)
}

/// Heap-backed buffer with a header meta and one plane of `bytes`.
pub fn heap_slot(bytes: usize, flags: DataFlags) -> Arc<BufferSlot> {
    let header = Meta {
        kind: MetaType::Header,
        memory: MemRegion::alloc(std::mem::size_of::<MetaHeader>()).expect("header"),
    };
    let data = Data::with_memory(MemRegion::alloc(bytes).expect("plane"), flags).expect("data");
    let mut buffer = Buffer::default();
    buffer.metas.push(header);
    buffer.datas.push(data);
    Arc::new(BufferSlot::new(buffer))
}

/// Fills the first plane and marks the chunk as holding exactly `samples`.
pub fn write_f32(slot: &BufferSlot, samples: &[f32]) {
    let buffer = slot.load();
    let d = &buffer.datas[0];
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_ne_bytes()).collect();
    d.memory
        .as_ref()
        .expect("plane memory")
        .write_bytes(0, &bytes)
        .expect("write");
    d.chunk.set(0, bytes.len() as u32, 4, ChunkFlags::NONE);
}

/// Reads what the chunk of the first plane currently covers.
pub fn read_f32(slot: &BufferSlot) -> Vec<f32> {
    let buffer = slot.load();
    let d = &buffer.datas[0];
    let mut bytes = vec![0u8; d.chunk.size() as usize];
    d.memory
        .as_ref()
        .expect("plane memory")
        .read_bytes(d.chunk.offset() as usize, &mut bytes)
        .expect("read");
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

pub fn chunk_flags(slot: &BufferSlot) -> ChunkFlags {
    slot.load().datas[0].chunk.flags()
}

/// An io area holding one buffers cell.
pub fn io_area() -> MemRegion {
    MemRegion::alloc(std::mem::size_of::<IoBuffers>()).expect("io area")
}

/// A mixer with `inputs` interleaved f32 inputs, one buffer each, and one
/// output buffer, all negotiated and bound.
pub struct MixerRig {
    pub mixer: AudioMixer,
    pub inputs: Vec<Arc<BufferSlot>>,
    pub output: Arc<BufferSlot>,
    pub channels: u32,
}

impl MixerRig {
    pub fn new(inputs: u32, channels: u32) -> Self {
        let mut mixer = test_mixer("interleaved");
        let format = f32_format(channels);
        let bytes = TEST_FRAMES * channels as usize * 4;

        let mut slots = Vec::new();
        for id in 0..inputs {
            mixer.add_port(Direction::Input, id, None).expect("add input");
            mixer
                .port_set_param(Direction::Input, id, ParamId::Format, Some(&format))
                .expect("input format");
            let slot = heap_slot(bytes, DataFlags::READWRITE);
            mixer
                .port_use_buffers(Direction::Input, id, &[slot.clone()])
                .expect("input buffers");
            mixer
                .port_set_io(Direction::Input, id, IoKind::Buffers, Some(io_area()))
                .expect("input io");
            slots.push(slot);
        }

        mixer
            .port_set_param(Direction::Output, 0, ParamId::Format, Some(&format))
            .expect("output format");
        let output = heap_slot(bytes, DataFlags::READWRITE);
        mixer
            .port_use_buffers(Direction::Output, 0, &[output.clone()])
            .expect("output buffers");
        mixer
            .port_set_io(Direction::Output, 0, IoKind::Buffers, Some(io_area()))
            .expect("output io");

        Self {
            mixer,
            inputs: slots,
            output,
            channels,
        }
    }

    /// Writes `value` into input `id` and marks its buffer ready.
    pub fn feed(&self, id: u32, value: f32) {
        let n = TEST_FRAMES * self.channels as usize;
        write_f32(&self.inputs[id as usize], &vec![value; n]);
        self.input_io(id).set(Status::HAVE_DATA.as_raw(), 0);
    }

    pub fn input_io(&self, id: u32) -> &IoBuffers {
        self.mixer
            .port(Direction::Input, id)
            .and_then(|p| p.io(0))
            .expect("input io bound")
    }

    pub fn output_io(&self) -> &IoBuffers {
        self.mixer
            .port(Direction::Output, 0)
            .and_then(|p| p.io(0))
            .expect("output io bound")
    }

    /// Hands the output buffer back, as a consumer that finished reading would.
    pub fn consume(&self) {
        self.output_io().set_status(Status::NEED_DATA.as_raw());
    }
}
