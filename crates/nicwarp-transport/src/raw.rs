//! RAW transport.
//!
//! Sends go straight to the RAW hardware ring under a single TX lock, gated on
//! ring credit. Received messages are copied into a shared slot arena with one
//! queue per port; `recv` copies the payload out and returns the slot before
//! returning to the caller.

use std::{array, sync::Arc};

use nicwarp_core::{
    constants::{PORT_COUNT, RAW_MAX_PAYLOAD},
    DecodingErrorKind, ErrorKind, NodeId, ProtocolErrorKind, QueueId, Result, SlotArena, Waiter,
};
use nicwarp_protocol::{HwRing, MessageHeader, MessageKind, OwnerId, Port, RingEvent, RingKind, RxFrame, Transport};
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::TransportContext;

#[derive(Clone, Copy)]
struct RawSlot {
    src_node: NodeId,
    len: usize,
    data: [u8; RAW_MAX_PAYLOAD],
}

impl RawSlot {
    const EMPTY: RawSlot = RawSlot { src_node: 0, len: 0, data: [0; RAW_MAX_PAYLOAD] };
}

struct RawRx {
    arena: SlotArena,
    slots: Box<[RawSlot]>,
}

/// Small messages carried inline in hardware descriptors.
pub struct RawTransport {
    ctx: Arc<TransportContext>,
    ring: Arc<dyn HwRing>,
    tx: Mutex<()>,
    tx_ready: Condvar,
    rx: Mutex<RawRx>,
    rx_ready: [Condvar; PORT_COUNT],
    receivers: [Mutex<()>; PORT_COUNT],
}

impl RawTransport {
    /// Creates the transport with `rx_slots` receive slots shared by all ports.
    pub fn new(ctx: Arc<TransportContext>, ring: Arc<dyn HwRing>, rx_slots: usize) -> Self {
        RawTransport {
            ctx,
            ring,
            tx: Mutex::new(()),
            tx_ready: Condvar::new(),
            rx: Mutex::new(RawRx {
                arena: SlotArena::new(rx_slots, PORT_COUNT),
                slots: vec![RawSlot::EMPTY; rx_slots].into_boxed_slice(),
            }),
            rx_ready: array::from_fn(|_| Condvar::new()),
            receivers: array::from_fn(|_| Mutex::new(())),
        }
    }

    /// Sends `payload` to `port` on node `dst` and returns the hardware message id.
    pub fn send(&self, dst: NodeId, port: u8, payload: &[u8], waiter: Waiter<'_>) -> Result<u16> {
        let waiter = waiter.with_teardown(&self.ctx.closed);
        if payload.len() > RAW_MAX_PAYLOAD {
            return Err(ErrorKind::PayloadTooLarge { size: payload.len(), max: RAW_MAX_PAYLOAD });
        }
        let port = Port::new(port)?;
        self.ctx.routes.ensure_reachable(dst)?;

        let mut tx = self.tx.lock();
        let ring = &self.ring;
        if waiter.wait_until(&self.tx_ready, &mut tx, |_| ring.tx_credit() > 0)? {
            self.ctx.stats.raw.record_send_wait();
        }

        let header = MessageHeader::raw(self.ctx.node_id, dst, port.get(), payload.len());
        let msg_id = self.ring.tx_push(&header, payload);
        drop(tx);

        self.ctx.stats.raw.record_sent(payload.len());
        trace!("RAW send id {} to node {} port {} ({} bytes)", msg_id, dst, port, payload.len());
        Ok(msg_id)
    }

    /// Receives the next message on `port`, which `owner` must have bound.
    ///
    /// Returns the source node and the payload.
    pub fn recv(&self, owner: OwnerId, port: u8, waiter: Waiter<'_>) -> Result<(NodeId, Vec<u8>)> {
        let waiter = waiter.with_teardown(&self.ctx.closed);
        let port = Port::new(port)?;
        if !self.ctx.bindings.is_bound_by(Transport::Raw, port, owner) {
            return Err(ErrorKind::NotBound(port.get()));
        }
        let queue = QueueId(port.index());

        let _receiver = waiter.lock(&self.receivers[port.index()])?;
        let mut rx = self.rx.lock();
        if waiter.wait_until(&self.rx_ready[port.index()], &mut rx, |rx| rx.arena.queue_nonempty(queue))? {
            self.ctx.stats.raw.record_recv_wait();
        }

        let slot = rx.arena.dequeue(queue).ok_or(ErrorKind::Capacity)?;
        let message = rx.slots[slot.index()];
        let was_exhausted = rx.arena.is_exhausted();
        rx.arena.release(slot);
        drop(rx);

        if was_exhausted {
            self.ctx.kick(RingEvent::SpaceAvailable(RingKind::Raw));
        }
        self.ctx.stats.raw.record_received(message.len);
        trace!("RAW recv on port {} from node {} ({} bytes)", port, message.src_node, message.len);
        Ok((message.src_node, message.data[..message.len].to_vec()))
    }

    /// Discards every queued message on `port`. Returns how many were dropped.
    pub fn flush(&self, port: Port) -> usize {
        let queue = QueueId(port.index());
        let mut rx = self.rx.lock();
        let was_exhausted = rx.arena.is_exhausted();
        let mut flushed = 0;
        while let Some(slot) = rx.arena.dequeue(queue) {
            rx.arena.release(slot);
            flushed += 1;
        }
        drop(rx);

        if was_exhausted && flushed > 0 {
            self.ctx.kick(RingEvent::SpaceAvailable(RingKind::Raw));
        }
        flushed
    }

    /// Returns true if a send would not have to wait for ring credit.
    pub fn send_avail(&self) -> bool {
        self.ring.tx_credit() > 0
    }

    /// Returns true if a message is queued on `port`.
    pub fn recv_avail(&self, port: Port) -> bool {
        self.rx.lock().arena.queue_nonempty(QueueId(port.index()))
    }

    /// Moves received frames from the RAW ring into the port queues.
    ///
    /// Stops early when the receive arena is exhausted; the remaining frames stay
    /// in the ring until a receiver frees a slot. Returns the number queued.
    pub fn drain(&self) -> usize {
        let mut queued = 0;
        while self.ring.rx_credit() > 0 {
            let Some(slot) = self.rx.lock().arena.alloc() else {
                trace!("RAW receive arena exhausted, leaving frames in the ring");
                break;
            };
            let Some(frame) = self.ring.rx_pop() else {
                self.rx.lock().arena.release(slot);
                break;
            };

            let mut rx = self.rx.lock();
            match Self::accept(frame) {
                Ok((header, payload)) => {
                    let entry = &mut rx.slots[slot.index()];
                    entry.src_node = header.src_node;
                    entry.len = payload.len();
                    entry.data[..payload.len()].copy_from_slice(&payload);
                    rx.arena.enqueue(QueueId(header.port as usize), slot);
                    drop(rx);

                    self.rx_ready[header.port as usize].notify_one();
                    queued += 1;
                }
                Err(err) => {
                    rx.arena.release(slot);
                    drop(rx);
                    self.ctx.discard(&err);
                }
            }
        }
        queued
    }

    fn accept(frame: RxFrame) -> std::result::Result<(MessageHeader, Vec<u8>), ProtocolErrorKind> {
        let (header, payload) = frame.map_err(ProtocolErrorKind::Malformed)?;
        if header.kind != MessageKind::RawData {
            return Err(ProtocolErrorKind::UnexpectedKind);
        }
        if header.port as usize >= PORT_COUNT {
            return Err(ProtocolErrorKind::InvalidPort(header.port));
        }
        if payload.len() > RAW_MAX_PAYLOAD {
            return Err(ProtocolErrorKind::Malformed(DecodingErrorKind::PayloadLength {
                declared: header.payload_size,
                actual: payload.len(),
            }));
        }
        Ok((header, payload))
    }

    /// Wakes senders waiting for RAW ring credit.
    pub fn notify_tx_available(&self) {
        let _tx = self.tx.lock();
        self.tx_ready.notify_all();
    }

    /// Wakes every blocked sender and receiver, e.g. on teardown.
    pub fn wake_all(&self) {
        self.notify_tx_available();
        let _rx = self.rx.lock();
        for cond in &self.rx_ready {
            cond.notify_all();
        }
    }
}
