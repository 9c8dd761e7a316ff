//! Negotiation integration tests
//!
//! Format locking across ports, param enumeration after negotiation, and the
//! buffer capacity limit of a port.

use crate::helpers::*;
use conflux::core::{Error as CoreError, ParamFlags, MAX_PORTS};
use conflux::prelude::*;
use conflux::MAX_BUFFERS;

/// The first format fixes the mixer; it frees up only once every port
/// dropped its format.
#[test]
fn test_format_locked_until_last_port_clears() {
    let mut mixer = test_mixer("interleaved");
    for id in 0..2 {
        mixer.add_port(Direction::Input, id, None).unwrap();
    }

    mixer
        .port_set_param(Direction::Input, 0, ParamId::Format, Some(&f32_format(2)))
        .unwrap();
    assert!(matches!(
        mixer.port_set_param(Direction::Input, 1, ParamId::Format, Some(&f32_format(1))),
        Err(CoreError::InvalidFormat(_))
    ));

    mixer
        .port_set_param(Direction::Input, 0, ParamId::Format, None)
        .unwrap();
    assert!(mixer.format().is_none());
    mixer
        .port_set_param(Direction::Input, 1, ParamId::Format, Some(&f32_format(1)))
        .unwrap();
    assert_eq!(mixer.format().map(|f| f.channels), Some(1));
}

/// Once negotiated, every port offers exactly the negotiated format.
#[test]
fn test_enum_format_follows_negotiation() {
    let mut mixer = test_mixer("interleaved");
    mixer.add_port(Direction::Input, 4, None).unwrap();
    mixer
        .port_set_param(Direction::Output, 0, ParamId::Format, Some(&f32_format(2)))
        .unwrap();

    let offered = mixer
        .port_enum_params(Direction::Input, 4, ParamId::EnumFormat, 0, 4, None)
        .unwrap();
    assert_eq!(offered.len(), 1);
    assert!(offered[0].param.is_fixed());
    assert_eq!(
        AudioInfo::parse(&offered[0].param).unwrap(),
        AudioInfo::raw(SampleFormat::F32, TEST_SAMPLE_RATE, 2)
    );

    let current = mixer
        .port_enum_params(Direction::Output, 0, ParamId::Format, 0, 4, None)
        .unwrap();
    assert_eq!(current.len(), 1);
    let info = &mixer.port(Direction::Output, 0).unwrap().info;
    assert_eq!(info.param_flags(ParamId::Format), Some(ParamFlags::READWRITE));
}

/// Enumeration resumes from `next`.
#[test]
fn test_enumeration_resumes() {
    let mixer = test_mixer("interleaved");
    let first = mixer
        .port_enum_params(Direction::Output, 0, ParamId::Io, 0, 1, None)
        .unwrap();
    assert_eq!(first.len(), 1);
    let rest = mixer
        .port_enum_params(Direction::Output, 0, ParamId::Io, first[0].next, 8, None)
        .unwrap();
    assert!(!rest.is_empty());
    assert!(rest.iter().all(|r| r.index >= first[0].next));
}

#[test]
fn test_buffer_capacity() {
    let mut mixer = test_mixer("interleaved");
    mixer
        .port_set_param(Direction::Output, 0, ParamId::Format, Some(&f32_format(1)))
        .unwrap();

    let full: Vec<_> = (0..MAX_BUFFERS)
        .map(|_| heap_slot(256, DataFlags::READWRITE))
        .collect();
    mixer
        .port_use_buffers(Direction::Output, 0, &full)
        .unwrap();
    assert_eq!(mixer.port(Direction::Output, 0).unwrap().pool().len(), MAX_BUFFERS);

    let mut over = full.clone();
    over.push(heap_slot(256, DataFlags::READWRITE));
    assert!(matches!(
        mixer.port_use_buffers(Direction::Output, 0, &over),
        Err(CoreError::NoSpace { count: 65, capacity: 64 })
    ));
    // A rejected set leaves the previous buffers in place.
    assert_eq!(mixer.port(Direction::Output, 0).unwrap().pool().len(), MAX_BUFFERS);
}

#[test]
fn test_port_limits() {
    let mut mixer = test_mixer("interleaved");
    assert_eq!(mixer.info().max_input_ports as usize, MAX_PORTS);
    mixer
        .add_port(Direction::Input, MAX_PORTS as u32 - 1, None)
        .unwrap();
    assert!(matches!(
        mixer.add_port(Direction::Input, MAX_PORTS as u32, None),
        Err(CoreError::InvalidArgument(_))
    ));
    assert_eq!(mixer.last_port(), MAX_PORTS);
}

/// DSP ports negotiate mono f32p only.
#[test]
fn test_dsp_flavor_formats() {
    let mut mixer = test_mixer("dsp");
    mixer.add_port(Direction::Input, 0, None).unwrap();
    assert!(mixer
        .port_set_param(Direction::Input, 0, ParamId::Format, Some(&f32_format(2)))
        .is_err());
    let dsp = AudioInfo::dsp(TEST_SAMPLE_RATE).to_object(ParamId::Format);
    mixer
        .port_set_param(Direction::Input, 0, ParamId::Format, Some(&dsp))
        .unwrap();
    assert_eq!(
        mixer.mix_ops().map(|ops| ops.format()),
        Some(SampleFormat::F32P)
    );
}
