//! RDMA reliability against a deterministic mock ring.

mod common;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use common::{stack, StackConfig, LOCAL, PEER};
use nicwarp_core::{CancelToken, DiscardCause, ErrorKind, Waiter};
use nicwarp_protocol::{MessageHeader, MessageKind, RdmaDescriptor};
use nicwarp_transport::{Completion, SendOutcome, TokenState};

fn write_to(dst: u16) -> MessageHeader {
    MessageHeader::rdma(
        MessageKind::RdmaWrite,
        LOCAL,
        dst,
        RdmaDescriptor { local_addr: 0x100, remote_addr: 0x200, size: 64 },
    )
}

fn ack(msg_id: u16, from: u16, error: bool) -> MessageHeader {
    let request = MessageHeader { msg_id, ..write_to(from) };
    MessageHeader::ack_for(&request, from, error)
}

fn drain_until<F: Fn() -> bool>(stack: &common::Stack, done: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out draining the RDMA ring");
        stack.pump();
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_exhausted_table_blocks_until_ack() {
    let stack = Arc::new(stack(StackConfig { rdma_records: 4, ..StackConfig::default() }));

    for expected in [0u16, 1, 2, 3] {
        let outcome = stack.rdma.send(write_to(PEER), Completion::None, Waiter::blocking()).unwrap();
        assert_eq!(outcome, SendOutcome::Pending(outcome.token()));
        assert_eq!(outcome.token().msg_id, expected);
    }
    assert_eq!(stack.rdma.free_records(), 0);
    assert!(!stack.rdma.send_avail());
    assert_eq!(
        stack.rdma.send(write_to(PEER), Completion::None, Waiter::non_blocking()),
        Err(ErrorKind::WouldBlock)
    );

    let blocked = {
        let stack = Arc::clone(&stack);
        thread::spawn(move || stack.rdma.send(write_to(PEER), Completion::None, Waiter::blocking()))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!blocked.is_finished());

    stack.rdma_ring.inject(ack(2, PEER, false), Vec::new());
    stack.long.drain();

    let outcome = blocked.join().unwrap().unwrap();
    assert_eq!(outcome.token().msg_id, 2);
    assert_eq!(stack.ctx.stats.snapshot().rdma.send_waits, 1);
}

#[test]
fn test_ack_from_wrong_node_leaves_record_pending() {
    let stack = stack(StackConfig::default());
    let token = stack.rdma.send(write_to(PEER), Completion::None, Waiter::blocking()).unwrap().token();

    stack.rdma_ring.inject(ack(token.msg_id, 9, false), Vec::new());
    stack.long.drain();

    assert_eq!(stack.rdma.check(&token), TokenState::Pending);
    let snapshot = stack.ctx.stats.snapshot();
    assert_eq!(snapshot.discarded(DiscardCause::AckSourceMismatch), 1);
    assert_eq!(snapshot.protocol_errors(), 1);

    stack.rdma_ring.inject(ack(token.msg_id, PEER, false), Vec::new());
    stack.long.drain();
    assert_eq!(stack.rdma.check(&token), TokenState::Acked);
}

#[test]
fn test_bad_acks_are_discarded() {
    let stack = stack(StackConfig { rdma_records: 4, ..StackConfig::default() });

    // Out of range, then an id that is not in flight.
    stack.rdma_ring.inject(ack(400, PEER, false), Vec::new());
    stack.rdma_ring.inject(ack(1, PEER, false), Vec::new());
    assert_eq!(stack.long.drain(), 2);

    let snapshot = stack.ctx.stats.snapshot();
    assert_eq!(snapshot.discarded(DiscardCause::AckIdOutOfRange), 1);
    assert_eq!(snapshot.discarded(DiscardCause::UnexpectedAck), 1);
    assert_eq!(stack.rdma.free_records(), 4);
}

#[test]
fn test_callback_runs_once() {
    let stack = stack(StackConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let callback = Completion::Callback(Box::new(move |done| {
        assert!(!done.remote_error);
        seen.fetch_add(1, Ordering::SeqCst);
    }));

    let token = stack.rdma.send(write_to(PEER), callback, Waiter::blocking()).unwrap().token();
    stack.rdma_ring.inject(ack(token.msg_id, PEER, false), Vec::new());
    stack.rdma_ring.inject(ack(token.msg_id, PEER, false), Vec::new());
    stack.long.drain();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(stack.ctx.stats.snapshot().discarded(DiscardCause::UnexpectedAck), 1);
    assert_eq!(stack.ctx.stats.snapshot().rdma_completions, 1);
}

#[test]
fn test_retry_bound_with_callback() {
    let stack = stack(StackConfig::default());
    stack.rdma_ring.respond_as(PEER, true);

    let result = Arc::new(parking_lot::Mutex::new(None));
    let sink = Arc::clone(&result);
    let callback = Completion::Callback(Box::new(move |done| *sink.lock() = Some(done)));
    stack.rdma.send(write_to(PEER), callback, Waiter::blocking()).unwrap();
    stack.pump();

    let done = result.lock().expect("request completed");
    assert!(done.remote_error);
    assert_eq!(done.retries, 100);
    assert_eq!(stack.rdma_ring.push_count(), 101);

    let snapshot = stack.ctx.stats.snapshot();
    assert_eq!(snapshot.rdma_retries, 100);
    assert_eq!(snapshot.rdma_retries_exhausted, 1);
    assert_eq!(stack.rdma.free_records(), 4);
}

#[test]
fn test_retry_bound_blocking() {
    let stack = Arc::new(stack(StackConfig { max_retries: 100, ..StackConfig::default() }));
    stack.rdma_ring.respond_as(PEER, true);

    let sender = {
        let stack = Arc::clone(&stack);
        thread::spawn(move || stack.rdma.send(write_to(PEER), Completion::Blocking, Waiter::blocking()))
    };
    drain_until(&stack, || sender.is_finished());

    match sender.join().unwrap() {
        Ok(SendOutcome::Completed { remote_error, token }) => {
            assert!(remote_error);
            assert_eq!(stack.rdma.check(&token), TokenState::Acked);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(stack.rdma_ring.push_count(), 101);
    assert_eq!(stack.rdma.free_records(), 4);
}

#[test]
fn test_transient_remote_error_is_retried() {
    let stack = stack(StackConfig::default());
    let token = stack.rdma.send(write_to(PEER), Completion::None, Waiter::blocking()).unwrap().token();

    stack.rdma_ring.inject(ack(token.msg_id, PEER, true), Vec::new());
    stack.long.drain();
    assert_eq!(stack.rdma.check(&token), TokenState::Pending);
    assert!(stack.rdma.retries_pending());
    assert_eq!(stack.rdma_ring.push_count(), 1);

    assert_eq!(stack.rdma.resend_due(), 1);
    assert!(!stack.rdma.retries_pending());
    let resent = stack.rdma_ring.pushed();
    assert_eq!(resent.len(), 2);
    assert_eq!(resent[0].0, resent[1].0);

    stack.rdma_ring.inject(ack(token.msg_id, PEER, false), Vec::new());
    stack.long.drain();
    let done = stack.rdma.wait(&token, Waiter::non_blocking()).unwrap();
    assert!(!done.remote_error);
    assert_eq!(done.retries, 1);
}

#[test]
fn test_retry_waits_for_ring_credit() {
    let stack = stack(StackConfig::default());
    let token = stack.rdma.send(write_to(PEER), Completion::None, Waiter::blocking()).unwrap().token();

    stack.rdma_ring.credit.store(0, Ordering::SeqCst);
    stack.rdma_ring.inject(ack(token.msg_id, PEER, true), Vec::new());
    stack.long.drain();
    assert_eq!(stack.rdma.resend_due(), 0);
    assert_eq!(stack.rdma_ring.push_count(), 1);
    assert!(stack.rdma.retries_pending());
    assert_eq!(stack.rdma.check(&token), TokenState::Pending);

    stack.rdma_ring.credit.store(1, Ordering::SeqCst);
    assert_eq!(stack.rdma.resend_due(), 1);
    assert_eq!(stack.rdma_ring.push_count(), 2);
    assert_eq!(stack.ctx.stats.snapshot().rdma_retries, 1);

    stack.rdma_ring.inject(ack(token.msg_id, PEER, false), Vec::new());
    stack.long.drain();
    assert_eq!(stack.rdma.check(&token), TokenState::Acked);
}

#[test]
fn test_retry_is_delayed() {
    let stack = stack(StackConfig { retry_delay: Duration::from_millis(50), ..StackConfig::default() });
    let token = stack.rdma.send(write_to(PEER), Completion::None, Waiter::blocking()).unwrap().token();

    stack.rdma_ring.inject(ack(token.msg_id, PEER, true), Vec::new());
    stack.long.drain();
    assert_eq!(stack.rdma.resend_due(), 0);
    assert_eq!(stack.rdma_ring.push_count(), 1);

    thread::sleep(Duration::from_millis(80));
    assert_eq!(stack.rdma.resend_due(), 1);
    assert_eq!(stack.rdma_ring.push_count(), 2);
}

#[test]
fn test_ack_while_retry_queued_is_unexpected() {
    let stack = stack(StackConfig::default());
    let token = stack.rdma.send(write_to(PEER), Completion::None, Waiter::blocking()).unwrap().token();

    stack.rdma_ring.inject(ack(token.msg_id, PEER, true), Vec::new());
    stack.rdma_ring.inject(ack(token.msg_id, PEER, false), Vec::new());
    stack.long.drain();

    assert_eq!(stack.rdma.check(&token), TokenState::Pending);
    assert_eq!(stack.ctx.stats.snapshot().discarded(DiscardCause::UnexpectedAck), 1);
}

#[test]
fn test_retry_id_mismatch_completes_with_error() {
    let stack = stack(StackConfig::default());
    let result = Arc::new(parking_lot::Mutex::new(None));
    let sink = Arc::clone(&result);
    let callback = Completion::Callback(Box::new(move |done| *sink.lock() = Some(done)));
    let token = stack.rdma.send(write_to(PEER), callback, Waiter::blocking()).unwrap().token();

    stack.rdma_ring.inject(ack(token.msg_id, PEER, true), Vec::new());
    stack.long.drain();
    stack.rdma_ring.override_id(Some(token.msg_id + 1));
    assert_eq!(stack.rdma.resend_due(), 1);

    let done = result.lock().expect("request completed");
    assert!(done.remote_error);
    assert_eq!(done.retries, 1);
    assert_eq!(stack.rdma.check(&token), TokenState::Acked);
    assert_eq!(stack.rdma.free_records(), 4);
    assert_eq!(stack.ctx.stats.snapshot().rdma_retries, 0);
}

#[test]
fn test_generation_invalidates_stale_tokens() {
    let stack = stack(StackConfig::default());
    let first = stack.rdma.send(write_to(PEER), Completion::None, Waiter::blocking()).unwrap().token();
    stack.rdma_ring.inject(ack(first.msg_id, PEER, false), Vec::new());
    stack.long.drain();
    assert_eq!(stack.rdma.check(&first), TokenState::Acked);

    // Free list is LIFO, so the next request reuses the same record.
    let second = stack.rdma.send(write_to(PEER), Completion::None, Waiter::blocking()).unwrap().token();
    assert_eq!(second.msg_id, first.msg_id);
    assert_ne!(second.generation, first.generation);
    stack.rdma_ring.inject(ack(second.msg_id, PEER, false), Vec::new());
    stack.long.drain();

    assert_eq!(stack.rdma.check(&first), TokenState::Invalid);
    assert_eq!(stack.rdma.wait(&first, Waiter::blocking()), Err(ErrorKind::InvalidToken));
    assert_eq!(stack.rdma.check(&second), TokenState::Acked);
}

#[test]
fn test_interrupted_blocking_send_is_finalized_by_ack() {
    let stack = Arc::new(stack(StackConfig::default()));
    let cancel = CancelToken::new();

    let sender = {
        let stack = Arc::clone(&stack);
        let cancel = cancel.clone();
        thread::spawn(move || {
            stack.rdma.send(write_to(PEER), Completion::Blocking, Waiter::blocking().with_cancel(&cancel))
        })
    };
    while stack.rdma_ring.push_count() == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    cancel.cancel();
    assert_eq!(sender.join().unwrap(), Err(ErrorKind::Interrupted));
    assert_eq!(stack.rdma.free_records(), 3);

    let msg_id = stack.rdma_ring.pushed()[0].0.msg_id;
    stack.rdma_ring.inject(ack(msg_id, PEER, false), Vec::new());
    stack.long.drain();
    assert_eq!(stack.rdma.free_records(), 4);
}

#[test]
fn test_hardware_id_mismatch_releases_record() {
    let stack = stack(StackConfig::default());
    stack.rdma_ring.override_id(Some(77));
    assert_eq!(
        stack.rdma.send(write_to(PEER), Completion::None, Waiter::blocking()),
        Err(ErrorKind::HardwareIdMismatch { expected: 0, actual: 77 })
    );
    assert_eq!(stack.rdma.free_records(), 4);
}

#[test]
fn test_unreachable_and_credit() {
    let stack = stack(StackConfig::default());
    assert_eq!(
        stack.rdma.send(write_to(42), Completion::None, Waiter::blocking()),
        Err(ErrorKind::Unreachable(42))
    );

    stack.rdma_ring.credit.store(0, Ordering::SeqCst);
    assert!(!stack.rdma.send_avail());
    assert_eq!(
        stack.rdma.send(write_to(PEER), Completion::None, Waiter::non_blocking()),
        Err(ErrorKind::WouldBlock)
    );
    assert_eq!(stack.rdma_ring.push_count(), 0);
}
