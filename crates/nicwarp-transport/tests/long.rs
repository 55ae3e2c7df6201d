//! LONG transport against a deterministic mock ring.

mod common;

use common::{stack, StackConfig, LOCAL, PEER};
use nicwarp_core::{DiscardCause, ErrorKind, Waiter};
use nicwarp_protocol::{
    HwRing, LongBufferHeader, MessageHeader, MessageKind, PortSelector, RdmaDescriptor, RingEvent, RingKind, Transport,
};
use nicwarp_transport::{Completion, TokenState};

const OWNER: u64 = 11;

/// Plays the remote hardware: fills the lowest armed receive buffer and
/// returns the LONG data header announcing it.
fn deliver(stack: &common::Stack, port: u8, payload: &[u8]) -> MessageHeader {
    let addr = stack.zone.rx_buffers.claim_armed().unwrap().hw_address;
    let header = LongBufferHeader { port, length: payload.len() as u32 };
    stack.zone.memory.write(addr, &header.encode()).unwrap();
    stack.zone.memory.write(addr + 8, payload).unwrap();

    let rdma = RdmaDescriptor { local_addr: 0, remote_addr: addr, size: 8 + payload.len() as u32 };
    MessageHeader::long(PEER, LOCAL, port, payload.len(), rdma)
}

#[test]
fn test_send_copies_into_tx_buffer() {
    let stack = stack(StackConfig::default());
    let payload: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();

    let id = stack.long.send(PEER, 2, &payload, Waiter::blocking()).unwrap();
    let pushed = stack.rdma_ring.pushed();
    assert_eq!(pushed.len(), 1);

    let header = pushed[0].0;
    assert_eq!(header.kind, MessageKind::LongData);
    assert_eq!(header.msg_id, id);
    assert_eq!(header.payload_size, 1000);
    assert_eq!(header.rdma.size, 1008);
    // Left for the receiving hardware to fill in.
    assert_eq!(header.rdma.remote_addr, 0);

    let copied = stack.zone.memory.read(header.rdma.local_addr, 1008).unwrap();
    assert_eq!(LongBufferHeader::decode(&copied[..8]), Ok(LongBufferHeader { port: 2, length: 1000 }));
    assert_eq!(&copied[8..], payload.as_slice());
}

#[test]
fn test_send_size_limit() {
    let stack = stack(StackConfig::default());
    assert_eq!(
        stack.long.send(PEER, 0, &vec![0; 70000], Waiter::blocking()),
        Err(ErrorKind::PayloadTooLarge { size: 70000, max: 65528 })
    );
    assert!(stack.long.send(PEER, 0, &vec![7; 65528], Waiter::blocking()).is_ok());
}

#[test]
fn test_tx_buffer_returned_on_ack() {
    let stack = stack(StackConfig { long_buffers: 1, ..StackConfig::default() });
    let id = stack.long.send(PEER, 0, b"first", Waiter::blocking()).unwrap();
    assert!(!stack.long.send_avail());
    assert_eq!(stack.long.send(PEER, 0, b"second", Waiter::non_blocking()), Err(ErrorKind::WouldBlock));

    let request = stack.rdma_ring.pushed()[0].0;
    assert_eq!(request.msg_id, id);
    stack.rdma_ring.inject(MessageHeader::ack_for(&request, PEER, false), Vec::new());
    stack.long.drain();

    assert!(stack.long.send_avail());
    assert!(stack.long.send(PEER, 0, b"second", Waiter::non_blocking()).is_ok());
}

#[test]
fn test_recv_copies_then_rearms() {
    let stack = stack(StackConfig::default());
    stack.ctx.bindings.bind(Transport::Long, OWNER, PortSelector::Exact(4)).unwrap();

    let header = deliver(&stack, 4, b"bulk data");
    stack.rdma_ring.inject(header, Vec::new());
    assert_eq!(stack.long.drain(), 1);
    assert_eq!(stack.zone.rx_buffers.armed(), 3);

    assert_eq!(stack.long.recv(OWNER, 4, Waiter::blocking()), Ok((PEER, b"bulk data".to_vec())));
    assert_eq!(stack.zone.rx_buffers.armed(), 4);
    assert_eq!(stack.ctx.stats.snapshot().long.bytes_received, 9);
}

#[test]
fn test_unresolvable_buffer_is_skipped() {
    let stack = stack(StackConfig::default());
    stack.ctx.bindings.bind(Transport::Long, OWNER, PortSelector::Exact(0)).unwrap();

    let mut stray = deliver(&stack, 0, b"lost");
    stray.rdma.remote_addr += 3;
    stack.rdma_ring.inject(stray, Vec::new());
    let good = deliver(&stack, 0, b"kept");
    stack.rdma_ring.inject(good, Vec::new());
    stack.long.drain();

    assert_eq!(stack.long.recv(OWNER, 0, Waiter::blocking()), Ok((PEER, b"kept".to_vec())));
    assert_eq!(stack.ctx.stats.snapshot().discarded(DiscardCause::AddressOutOfRange), 1);
}

#[test]
fn test_corrupt_buffer_header_is_discarded_and_rearmed() {
    let stack = stack(StackConfig::default());
    stack.ctx.bindings.bind(Transport::Long, OWNER, PortSelector::Exact(0)).unwrap();

    let header = deliver(&stack, 0, b"abc");
    stack.zone.memory.write(header.rdma.remote_addr, &[0; 8]).unwrap();
    stack.rdma_ring.inject(header, Vec::new());
    stack.long.drain();

    assert_eq!(stack.long.recv(OWNER, 0, Waiter::non_blocking()), Err(ErrorKind::WouldBlock));
    assert_eq!(stack.ctx.stats.snapshot().discarded(DiscardCause::BufferHeader), 1);
    assert_eq!(stack.zone.rx_buffers.armed(), 4);
}

#[test]
fn test_flush_rearms_buffers() {
    let stack = stack(StackConfig::default());
    stack.ctx.bindings.bind(Transport::Long, OWNER, PortSelector::Exact(6)).unwrap();
    for _ in 0..2 {
        let header = deliver(&stack, 6, b"x");
        stack.rdma_ring.inject(header, Vec::new());
    }
    stack.long.drain();
    assert_eq!(stack.zone.rx_buffers.armed(), 2);

    let port = nicwarp_protocol::Port::new(6).unwrap();
    assert_eq!(stack.long.flush(port), 2);
    assert_eq!(stack.zone.rx_buffers.armed(), 4);
    assert!(!stack.long.recv_avail(port));
}

#[test]
fn test_acks_pass_while_receive_arena_full() {
    let stack = stack(StackConfig { long_rx_slots: 1, ..StackConfig::default() });
    stack.ctx.bindings.bind(Transport::Long, OWNER, PortSelector::Exact(1)).unwrap();
    stack.ctx.bindings.bind(Transport::Long, OWNER, PortSelector::Exact(2)).unwrap();

    let token = stack.rdma.send(write_to_peer(), Completion::None, Waiter::blocking()).unwrap().token();
    let first = deliver(&stack, 1, b"first");
    let second = deliver(&stack, 2, b"second");
    let third = deliver(&stack, 1, b"third");
    stack.rdma_ring.inject(first, Vec::new());
    stack.rdma_ring.inject(second, Vec::new());
    stack.rdma_ring.inject(MessageHeader::ack_for(&stack.rdma_ring.pushed()[0].0, PEER, false), Vec::new());
    stack.rdma_ring.inject(third, Vec::new());

    assert_eq!(stack.long.drain(), 4);
    assert_eq!(stack.rdma_ring.rx_credit(), 0);
    assert_eq!(stack.rdma.check(&token), TokenState::Acked);
    assert_eq!(stack.long.recv(OWNER, 2, Waiter::non_blocking()), Err(ErrorKind::WouldBlock));

    assert_eq!(stack.long.recv(OWNER, 1, Waiter::non_blocking()), Ok((PEER, b"first".to_vec())));
    assert_eq!(stack.events.try_recv(), Ok(RingEvent::SpaceAvailable(RingKind::Rdma)));
    assert_eq!(stack.long.drain(), 1);
    assert_eq!(stack.long.recv(OWNER, 2, Waiter::non_blocking()), Ok((PEER, b"second".to_vec())));
    stack.long.drain();
    assert_eq!(stack.long.recv(OWNER, 1, Waiter::non_blocking()), Ok((PEER, b"third".to_vec())));
    assert_eq!(stack.zone.rx_buffers.armed(), 4);
}

#[test]
fn test_flush_drops_held_messages() {
    let stack = stack(StackConfig { long_rx_slots: 1, ..StackConfig::default() });
    stack.ctx.bindings.bind(Transport::Long, OWNER, PortSelector::Exact(3)).unwrap();
    for _ in 0..3 {
        let header = deliver(&stack, 3, b"x");
        stack.rdma_ring.inject(header, Vec::new());
    }
    stack.long.drain();
    assert_eq!(stack.zone.rx_buffers.armed(), 1);

    let port = nicwarp_protocol::Port::new(3).unwrap();
    assert_eq!(stack.long.flush(port), 3);
    assert_eq!(stack.zone.rx_buffers.armed(), 4);
    stack.long.drain();
    assert!(!stack.long.recv_avail(port));
}

fn write_to_peer() -> MessageHeader {
    MessageHeader::rdma(
        MessageKind::RdmaWrite,
        LOCAL,
        PEER,
        RdmaDescriptor { local_addr: 0x100, remote_addr: 0x200, size: 64 },
    )
}
