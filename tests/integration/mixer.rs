//! Audiomixer integration tests
//!
//! Drives whole process cycles through the public node API: formats, buffers
//! and io cells are negotiated the way a graph would, then inputs are marked
//! ready and the mixed output is read back.

use crate::helpers::alloc_counter::count_allocations;
use crate::helpers::tolerances::*;
use crate::helpers::*;
use approx::assert_abs_diff_eq;
use conflux::core::ChunkFlags;
use conflux::prelude::*;
use proptest::prelude::*;

/// Two of three inputs ready: their sum lands in the output, the third port
/// is left alone.
#[test]
fn test_mix_ready_inputs() {
    init_tracing();
    for channels in [1, 2] {
        let mut rig = MixerRig::new(3, channels);
        rig.feed(0, 0.5);
        rig.feed(1, -0.25);
        rig.input_io(2).set(Status::DRAINED.as_raw(), 7);

        let status = rig.mixer.process().unwrap();
        assert_eq!(status, Status::HAVE_DATA | Status::NEED_DATA);

        let out = read_f32(&rig.output);
        assert_eq!(out.len(), TEST_FRAMES * channels as usize);
        for s in out {
            assert_abs_diff_eq!(s, 0.25, epsilon = FLOAT_EPSILON);
        }

        assert_eq!(rig.input_io(0).status(), Status::NEED_DATA.as_raw());
        assert_eq!(rig.input_io(1).status(), Status::NEED_DATA.as_raw());
        assert_eq!(rig.input_io(2).status(), Status::DRAINED.as_raw());
        assert_eq!(rig.input_io(2).buffer_id(), 7);
        assert_eq!(rig.output_io().status(), Status::HAVE_DATA.as_raw());
        assert_eq!(rig.output_io().buffer_id(), 0);
    }
}

/// While the consumer has not taken the last output nothing moves.
#[test]
fn test_full_output_is_noop() {
    let mut rig = MixerRig::new(2, 1);
    rig.feed(0, 0.1);
    rig.feed(1, 0.0);
    rig.mixer.process().unwrap();

    rig.feed(0, 0.9);
    rig.feed(1, 0.9);
    assert_eq!(rig.mixer.process().unwrap(), Status::HAVE_DATA);
    assert_eq!(rig.input_io(0).status(), Status::HAVE_DATA.as_raw());
    assert_eq!(rig.input_io(1).status(), Status::HAVE_DATA.as_raw());
    assert_abs_diff_eq!(read_f32(&rig.output)[0], 0.1, epsilon = FLOAT_EPSILON);

    rig.consume();
    rig.mixer.process().unwrap();
    assert_abs_diff_eq!(read_f32(&rig.output)[0], 1.8, epsilon = FLOAT_EPSILON);
}

/// One ready input is forwarded without copying.
#[test]
fn test_single_input_passthrough() {
    let mut rig = MixerRig::new(2, 2);
    rig.feed(1, 0.75);
    rig.mixer.process().unwrap();

    assert!(BufferSlot::shows_same(&rig.output, &rig.inputs[1]));
    assert_abs_diff_eq!(read_f32(&rig.output)[3], 0.75, epsilon = FLOAT_EPSILON);

    // The next mixed cycle writes into the output's own memory again.
    rig.consume();
    rig.feed(0, 0.25);
    rig.feed(1, 0.25);
    rig.mixer.process().unwrap();
    assert!(!BufferSlot::shows_same(&rig.output, &rig.inputs[1]));
    assert_abs_diff_eq!(read_f32(&rig.output)[0], 0.5, epsilon = FLOAT_EPSILON);
}

/// No contributor still produces a buffer, flagged empty.
#[test]
fn test_no_ready_inputs_gives_empty_output() {
    let mut rig = MixerRig::new(2, 2);
    assert_eq!(
        rig.mixer.process().unwrap(),
        Status::HAVE_DATA | Status::NEED_DATA
    );
    assert!(chunk_flags(&rig.output).contains(ChunkFlags::EMPTY));

    rig.consume();
    rig.feed(0, 0.5);
    rig.feed(1, 0.5);
    rig.mixer.process().unwrap();
    assert!(!chunk_flags(&rig.output).contains(ChunkFlags::EMPTY));
}

/// Inputs whose chunk is flagged empty are skipped.
#[test]
fn test_empty_input_chunks_are_skipped() {
    let mut rig = MixerRig::new(3, 1);
    rig.feed(0, 0.5);
    rig.feed(1, 0.25);
    rig.feed(2, 0.125);
    let buffer = rig.inputs[2].load();
    let chunk = &buffer.datas[0].chunk;
    chunk.set(0, chunk.size(), 4, ChunkFlags::EMPTY);

    rig.mixer.process().unwrap();
    assert_abs_diff_eq!(read_f32(&rig.output)[0], 0.75, epsilon = FLOAT_EPSILON);
    // Skipped inputs are still consumed.
    assert_eq!(rig.input_io(2).status(), Status::NEED_DATA.as_raw());
}

/// The shortest contributor bounds the output.
#[test]
fn test_output_length_follows_shortest_input() {
    let mut rig = MixerRig::new(2, 1);
    rig.feed(0, 0.5);
    rig.feed(1, 0.5);
    rig.inputs[1].load().datas[0].chunk.set(0, 16, 4, ChunkFlags::NONE);

    rig.mixer.process().unwrap();
    assert_eq!(read_f32(&rig.output).len(), 4);
}

#[test]
fn test_process_without_output_buffers() {
    let mut mixer = test_mixer("interleaved");
    mixer
        .port_set_io(Direction::Output, 0, IoKind::Buffers, Some(io_area()))
        .unwrap();
    assert!(matches!(mixer.process(), Err(conflux::core::Error::OutOfBuffers)));
}

/// Neither a mixing cycle nor a failing one allocates once warmed up.
#[test]
fn test_process_does_not_allocate() {
    let mut unbound = test_mixer("interleaved");
    assert!(unbound.process().is_err());
    let (result, allocations) = count_allocations(|| unbound.process());
    assert!(matches!(result, Err(conflux::core::Error::IoError(_))));
    assert_eq!(allocations, 0);

    let mut rig = MixerRig::new(2, 1);
    for _ in 0..2 {
        rig.feed(0, 0.25);
        rig.feed(1, 0.25);
        rig.mixer.process().unwrap();
        rig.consume();
    }
    rig.feed(0, 0.25);
    rig.feed(1, 0.5);
    let (status, allocations) = count_allocations(|| rig.mixer.process());
    assert_eq!(status.unwrap(), Status::HAVE_DATA | Status::NEED_DATA);
    assert_eq!(allocations, 0);
    assert_abs_diff_eq!(read_f32(&rig.output)[0], 0.75, epsilon = FLOAT_EPSILON);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn output_is_sum_of_ready_inputs(
        values in prop::collection::vec(-1.0f32..1.0, 1..6),
        ready in prop::collection::vec(any::<bool>(), 6),
    ) {
        let mut rig = MixerRig::new(values.len() as u32, 2);
        let mut expected = 0.0f32;
        let mut any_ready = false;
        for (id, v) in values.iter().enumerate() {
            if ready[id] {
                rig.feed(id as u32, *v);
                expected += v;
                any_ready = true;
            }
        }
        rig.mixer.process().unwrap();

        if any_ready {
            for s in read_f32(&rig.output) {
                prop_assert!((s - expected).abs() <= KERNEL_EPSILON);
            }
        } else {
            prop_assert!(chunk_flags(&rig.output).contains(ChunkFlags::EMPTY));
        }
        for (id, _) in values.iter().enumerate() {
            let want = if ready[id] { Status::NEED_DATA.as_raw() } else { 0 };
            prop_assert_eq!(rig.input_io(id as u32).status(), want);
        }
    }
}
