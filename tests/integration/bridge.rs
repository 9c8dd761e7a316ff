//! Client-node bridge integration tests
//!
//! A mixer runs behind a [`RemoteNode`] on one end of a socket pair and is
//! driven through a [`ClientNode`] on the other, with buffers and io cells in
//! shared memory.

use crate::helpers::tolerances::*;
use crate::helpers::*;
use approx::assert_abs_diff_eq;
use conflux::bridge::{
    alloc_buffers, BridgeState, BufferLayout, MemBlock, RemoteNodeThread,
};
use conflux::prelude::*;
use conflux::Doorbell;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn config() -> BridgeConfig {
    BridgeConfig {
        shm_prefix: "conflux_it_".into(),
        ..Default::default()
    }
}

fn connect() -> (ClientNode, RemoteNodeThread<AudioMixer>) {
    init_tracing();
    let (host, remote) = UnixStream::pair().unwrap();
    let remote = RemoteNode::new(remote, config(), |support| {
        AudioMixer::new(support, &Properties::new())
    })
    .unwrap()
    .spawn()
    .unwrap();
    let mut node = ClientNode::new(host, 3, config()).unwrap();
    node.dispatch_until(WAIT, |n| n.port_info(Direction::Output, 0).is_some())
        .unwrap();
    (node, remote)
}

fn wait(node: &mut ClientNode, completion: Completion) {
    if let Completion::Pending { seq } = completion {
        assert_eq!(node.wait_for_done(seq, WAIT).unwrap(), 0, "seq {} failed", seq);
    }
}

struct SharedRig {
    inputs: Vec<Arc<BufferSlot>>,
    output: Arc<BufferSlot>,
    ios: Vec<MemRegion>,
    _blocks: Vec<MemBlock>,
}

/// Negotiates two mono f32 inputs and the output through the proxy.
fn negotiate(node: &mut ClientNode) -> SharedRig {
    let format = f32_format(1);
    for id in 0..2 {
        let c = node.add_port(Direction::Input, id, None).unwrap();
        wait(node, c);
        let c = node
            .port_set_param(Direction::Input, id, ParamId::Format, Some(&format))
            .unwrap();
        wait(node, c);
    }
    let c = node
        .port_set_param(Direction::Output, 0, ParamId::Format, Some(&format))
        .unwrap();
    wait(node, c);

    let layout = BufferLayout::new(1, TEST_FRAMES * 4);
    let buffers = MemBlock::create("conflux_it_", "buffers", 3 * layout.buffer_size()).unwrap();
    let mut slots = alloc_buffers(&buffers, 3, &layout).unwrap();
    let output = slots.pop().unwrap();
    let io_block = MemBlock::create("conflux_it_", "io", 4096).unwrap();
    let ios: Vec<_> = (0..3).map(|i| io_block.slice(i * 64, 8).unwrap()).collect();

    for id in 0..2u32 {
        let c = node
            .port_use_buffers(Direction::Input, id, &slots[id as usize..id as usize + 1])
            .unwrap();
        wait(node, c);
        let c = node
            .port_set_io(Direction::Input, id, IoKind::Buffers, Some(ios[id as usize].clone()))
            .unwrap();
        wait(node, c);
    }
    let c = node
        .port_use_buffers(Direction::Output, 0, &[output.clone()])
        .unwrap();
    wait(node, c);
    let c = node
        .port_set_io(Direction::Output, 0, IoKind::Buffers, Some(ios[2].clone()))
        .unwrap();
    wait(node, c);

    SharedRig {
        inputs: slots,
        output,
        ios,
        _blocks: vec![buffers, io_block],
    }
}

fn cell(area: &MemRegion) -> conflux::SharedRef<IoBuffers> {
    area.view::<IoBuffers>(0).unwrap()
}

/// One cycle: host publishes inputs, rings the remote, and reads the mix
/// back from shared memory.
#[test]
fn test_remote_mix_cycle() {
    let (mut node, remote) = connect();
    let rig = negotiate(&mut node);
    let ready = node.ready_doorbell().unwrap();
    node.bind().unwrap();
    node.dispatch_until(WAIT, |n| n.state() == BridgeState::Running)
        .unwrap();

    write_f32(&rig.inputs[0], &[0.5; TEST_FRAMES]);
    write_f32(&rig.inputs[1], &[-0.125; TEST_FRAMES]);
    cell(&rig.ios[0]).set(Status::HAVE_DATA.as_raw(), 0);
    cell(&rig.ios[1]).set(Status::HAVE_DATA.as_raw(), 0);

    node.process().unwrap();
    assert!(ready.wait(Some(WAIT)).unwrap());

    let out = cell(&rig.ios[2]);
    assert_eq!(out.status(), Status::HAVE_DATA.as_raw());
    assert_eq!(out.buffer_id(), 0);
    let mixed = read_f32(&rig.output);
    assert_eq!(mixed.len(), TEST_FRAMES);
    for s in mixed {
        assert_abs_diff_eq!(s, 0.375, epsilon = FLOAT_EPSILON);
    }
    assert_eq!(cell(&rig.ios[0]).status(), Status::NEED_DATA.as_raw());

    drop(node);
    let mixer = remote.join().unwrap();
    assert_eq!(mixer.last_port(), 2);
}

/// Wakeups signalled before the reader drains count together.
#[test]
fn test_doorbell_coalesces() {
    let bell = Doorbell::new().unwrap();
    let writer = bell.try_clone().unwrap();
    let handle = std::thread::spawn(move || {
        for _ in 0..3 {
            writer.signal(1).unwrap();
        }
    });
    handle.join().unwrap();
    assert!(bell.wait(Some(WAIT)).unwrap());
    assert_eq!(bell.read().unwrap(), 3);
    assert_eq!(bell.read().unwrap(), 0);
    assert!(!bell.wait(Some(Duration::from_millis(10))).unwrap());
}

/// A remote that goes away takes its ports with it.
#[test]
fn test_remote_exit_clears_ports() {
    let (host, remote) = UnixStream::pair().unwrap();
    let remote = RemoteNode::new(remote, config(), |support| {
        AudioMixer::new(support, &Properties::new())
    })
    .unwrap();
    let mut node = ClientNode::new(host, 9, config()).unwrap();
    node.dispatch_until(WAIT, |n| n.port_info(Direction::Output, 0).is_some())
        .unwrap();

    drop(remote);
    node.dispatch_until(WAIT, |n| n.n_ports(Direction::Output) == 0)
        .unwrap();
    assert_eq!(node.state(), BridgeState::Unbound);
    assert!(node.add_port(Direction::Input, 0, None).is_err());
}
