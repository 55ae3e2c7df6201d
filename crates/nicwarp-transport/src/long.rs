//! LONG transport.
//!
//! A LONG message is copied into one of the local TX buffers of the RDMA zone
//! and written by the RDMA ring into whichever RX buffer the receiving
//! hardware has armed; the receiver learns the buffer from the data header.
//! The TX buffer is returned from the completion callback, so `send` only
//! waits for a free TX buffer and never for the remote acknowledgement.
//!
//! The receiver queues the arriving headers per port. `recv` resolves the
//! receive buffer from the header's destination address, copies the payload
//! out and only then re-arms the buffer for the hardware. While the receive
//! arena is exhausted, arriving headers are held in order until slots free
//! up, so acknowledgements behind them keep flowing.

use std::{array, collections::VecDeque, sync::Arc};

use nicwarp_core::{
    constants::{LONG_BUFFER_HEADER_SIZE, LONG_MAX_PAYLOAD, PORT_COUNT},
    ErrorKind, NodeId, ProtocolErrorKind, QueueId, Result, SlotArena, SlotId, Waiter,
};
use nicwarp_protocol::{
    HwRing, LongBufferHeader, MessageHeader, MessageKind, OwnerId, Port, RdmaDescriptor, RdmaZone, RingEvent,
    RingKind, RxFrame, Transport,
};
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::{
    reliability::{Completion, Reliability},
    TransportContext,
};

struct LongTx {
    arena: Mutex<SlotArena>,
    ready: Condvar,
}

impl LongTx {
    fn release(&self, slot: SlotId) {
        self.arena.lock().release(slot);
        self.ready.notify_one();
    }
}

struct LongRx {
    arena: SlotArena,
    headers: Box<[Option<MessageHeader>]>,
    // Arrived while the arena was exhausted. Bounded by the RX buffer count,
    // since each entry pins a written buffer.
    held: VecDeque<MessageHeader>,
}

/// Bulk messages delivered by RDMA write into pre-armed receive buffers.
pub struct LongTransport {
    ctx: Arc<TransportContext>,
    ring: Arc<dyn HwRing>,
    rdma: Arc<Reliability>,
    zone: Arc<RdmaZone>,
    tx: Arc<LongTx>,
    rx: Mutex<LongRx>,
    rx_ready: [Condvar; PORT_COUNT],
    receivers: [Mutex<()>; PORT_COUNT],
}

impl LongTransport {
    /// Creates the transport.
    ///
    /// One TX slot exists per TX buffer of `zone`; `rx_slots` bounds the queued
    /// but unread messages across all ports.
    pub fn new(
        ctx: Arc<TransportContext>,
        ring: Arc<dyn HwRing>,
        rdma: Arc<Reliability>,
        zone: Arc<RdmaZone>,
        rx_slots: usize,
    ) -> Self {
        let tx_buffers = zone.layout.tx_buffers;
        LongTransport {
            ctx,
            ring,
            rdma,
            zone,
            tx: Arc::new(LongTx { arena: Mutex::new(SlotArena::new(tx_buffers, 0)), ready: Condvar::new() }),
            rx: Mutex::new(LongRx {
                arena: SlotArena::new(rx_slots, PORT_COUNT),
                headers: vec![None; rx_slots].into_boxed_slice(),
                held: VecDeque::new(),
            }),
            rx_ready: array::from_fn(|_| Condvar::new()),
            receivers: array::from_fn(|_| Mutex::new(())),
        }
    }

    /// Sends `payload` to `port` on node `dst` and returns the hardware message id.
    pub fn send(&self, dst: NodeId, port: u8, payload: &[u8], waiter: Waiter<'_>) -> Result<u16> {
        let waiter = waiter.with_teardown(&self.ctx.closed);
        if payload.len() > LONG_MAX_PAYLOAD {
            return Err(ErrorKind::PayloadTooLarge { size: payload.len(), max: LONG_MAX_PAYLOAD });
        }
        let port = Port::new(port)?;
        self.ctx.routes.ensure_reachable(dst)?;

        let slot = {
            let mut arena = self.tx.arena.lock();
            if waiter.wait_until(&self.tx.ready, &mut arena, |a| !a.is_exhausted())? {
                self.ctx.stats.long.record_send_wait();
            }
            arena.alloc().ok_or(ErrorKind::Capacity)?
        };

        let local_addr = self.zone.layout.tx_buffer_addr(slot.index());
        let buffer_header = LongBufferHeader { port: port.get(), length: payload.len() as u32 };
        let copied = self
            .zone
            .memory
            .write(local_addr, &buffer_header.encode())
            .and_then(|_| self.zone.memory.write(local_addr + LONG_BUFFER_HEADER_SIZE as u64, payload));
        if let Err(err) = copied {
            self.tx.release(slot);
            return Err(err.into());
        }

        // The receiving hardware fills in the buffer it wrote.
        let size = (LONG_BUFFER_HEADER_SIZE + payload.len()) as u32;
        let rdma = RdmaDescriptor { local_addr, remote_addr: 0, size };
        let header = MessageHeader::long(self.ctx.node_id, dst, port.get(), payload.len(), rdma);

        let tx = Arc::clone(&self.tx);
        let on_complete = Completion::Callback(Box::new(move |_| tx.release(slot)));
        match self.rdma.send(header, on_complete, waiter) {
            Ok(outcome) => {
                let msg_id = outcome.token().msg_id;
                self.ctx.stats.long.record_sent(payload.len());
                trace!("LONG send id {} to node {} port {} ({} bytes)", msg_id, dst, port, payload.len());
                Ok(msg_id)
            }
            Err(err) => {
                self.tx.release(slot);
                Err(err)
            }
        }
    }

    /// Receives the next message on `port`, which `owner` must have bound.
    ///
    /// Messages whose receive buffer cannot be resolved or validated are
    /// discarded and the next one is tried.
    pub fn recv(&self, owner: OwnerId, port: u8, waiter: Waiter<'_>) -> Result<(NodeId, Vec<u8>)> {
        let waiter = waiter.with_teardown(&self.ctx.closed);
        let port = Port::new(port)?;
        if !self.ctx.bindings.is_bound_by(Transport::Long, port, owner) {
            return Err(ErrorKind::NotBound(port.get()));
        }
        let queue = QueueId(port.index());
        let _receiver = waiter.lock(&self.receivers[port.index()])?;

        loop {
            let header = {
                let mut rx = self.rx.lock();
                if waiter.wait_until(&self.rx_ready[port.index()], &mut rx, |rx| rx.arena.queue_nonempty(queue))? {
                    self.ctx.stats.long.record_recv_wait();
                }
                self.take(&mut rx, queue)?
            };

            match self.copy_out(&header, port) {
                Ok(payload) => {
                    self.ctx.stats.long.record_received(payload.len());
                    trace!("LONG recv on port {} from node {} ({} bytes)", port, header.src_node, payload.len());
                    return Ok((header.src_node, payload));
                }
                Err(err) => self.ctx.discard(&err),
            }
        }
    }

    fn take(&self, rx: &mut LongRx, queue: QueueId) -> Result<MessageHeader> {
        let slot = rx.arena.dequeue(queue).ok_or(ErrorKind::Capacity)?;
        let header = rx.headers[slot.index()].take();
        let was_exhausted = rx.arena.is_exhausted();
        rx.arena.release(slot);
        if was_exhausted || !rx.held.is_empty() {
            self.ctx.kick(RingEvent::SpaceAvailable(RingKind::Rdma));
        }
        header.ok_or(ErrorKind::Capacity)
    }

    /// Copies the payload out of the receive buffer, then re-arms the buffer.
    fn copy_out(&self, header: &MessageHeader, port: Port) -> std::result::Result<Vec<u8>, ProtocolErrorKind> {
        let buffer = self.zone.rx_buffers.resolve(header.rdma.remote_addr)?;
        let payload = self.read_buffer(buffer.hw_address, header, port);
        self.zone.rx_buffers.arm(buffer.buf_id);
        payload
    }

    fn read_buffer(
        &self,
        addr: u64,
        header: &MessageHeader,
        port: Port,
    ) -> std::result::Result<Vec<u8>, ProtocolErrorKind> {
        let raw = self.zone.memory.read(addr, LONG_BUFFER_HEADER_SIZE)?;
        let buffer_header = LongBufferHeader::decode(&raw)?;
        if buffer_header.port != port.get() || buffer_header.length != header.payload_size {
            return Err(ProtocolErrorKind::BufferHeader);
        }
        self.zone.memory.read(addr + LONG_BUFFER_HEADER_SIZE as u64, buffer_header.length as usize)
    }

    /// Discards every queued or held message on `port`, re-arming their buffers.
    pub fn flush(&self, port: Port) -> usize {
        let queue = QueueId(port.index());
        let mut rx = self.rx.lock();
        let was_exhausted = rx.arena.is_exhausted();
        let mut flushed = 0;
        while let Some(slot) = rx.arena.dequeue(queue) {
            if let Some(header) = rx.headers[slot.index()].take() {
                self.rearm(&header);
            }
            rx.arena.release(slot);
            flushed += 1;
        }
        let before = rx.held.len();
        rx.held.retain(|header| {
            let keep = header.port != port.get();
            if !keep {
                self.rearm(header);
            }
            keep
        });
        flushed += before - rx.held.len();
        let pending = !rx.held.is_empty();
        drop(rx);

        if (was_exhausted || pending) && flushed > 0 {
            self.ctx.kick(RingEvent::SpaceAvailable(RingKind::Rdma));
        }
        flushed
    }

    fn rearm(&self, header: &MessageHeader) {
        if let Ok(buffer) = self.zone.rx_buffers.resolve(header.rdma.remote_addr) {
            self.zone.rx_buffers.arm(buffer.buf_id);
        }
    }

    /// Returns true if a send would find a TX buffer, ring credit and a request record.
    pub fn send_avail(&self) -> bool {
        !self.tx.arena.lock().is_exhausted() && self.rdma.send_avail()
    }

    /// Returns true if a message is queued on `port`.
    pub fn recv_avail(&self, port: Port) -> bool {
        self.rx.lock().arena.queue_nonempty(QueueId(port.index()))
    }

    /// Drains the RDMA ring: acknowledgements go to the reliability table, LONG
    /// data to the port queues.
    ///
    /// Held messages are queued first. Every frame is popped regardless of
    /// receive slots; LONG data that finds the arena exhausted is held.
    pub fn drain(&self) -> usize {
        let mut handled = self.admit_held();
        while self.ring.rx_credit() > 0 {
            let Some(frame) = self.ring.rx_pop() else {
                break;
            };
            match self.route(frame) {
                Ok(Some(header)) => self.deliver(header),
                Ok(None) => {}
                Err(err) => self.ctx.discard(&err),
            }
            handled += 1;
        }
        handled
    }

    fn deliver(&self, header: MessageHeader) {
        let port = header.port as usize;
        let mut rx = self.rx.lock();
        if rx.held.is_empty() {
            if let Some(slot) = rx.arena.alloc() {
                rx.headers[slot.index()] = Some(header);
                rx.arena.enqueue(QueueId(port), slot);
                drop(rx);
                self.rx_ready[port].notify_one();
                return;
            }
        }
        trace!("LONG receive arena exhausted, holding message for port {}", port);
        rx.held.push_back(header);
    }

    /// Moves held messages into free receive slots, oldest first.
    fn admit_held(&self) -> usize {
        let mut rx = self.rx.lock();
        let mut admitted = 0;
        while !rx.held.is_empty() {
            let Some(slot) = rx.arena.alloc() else {
                break;
            };
            let Some(header) = rx.held.pop_front() else {
                rx.arena.release(slot);
                break;
            };
            let port = header.port as usize;
            rx.headers[slot.index()] = Some(header);
            rx.arena.enqueue(QueueId(port), slot);
            self.rx_ready[port].notify_one();
            admitted += 1;
        }
        admitted
    }

    /// Handles acknowledgements and validates LONG data. Returns the header to
    /// queue, if any.
    fn route(&self, frame: RxFrame) -> std::result::Result<Option<MessageHeader>, ProtocolErrorKind> {
        let (header, _) = frame.map_err(ProtocolErrorKind::Malformed)?;
        if header.is_ack {
            self.rdma.handle_ack(&header)?;
            return Ok(None);
        }
        if header.kind != MessageKind::LongData {
            return Err(ProtocolErrorKind::UnexpectedKind);
        }
        if header.port as usize >= PORT_COUNT {
            // The hardware already wrote the buffer; give it back.
            self.rearm(&header);
            return Err(ProtocolErrorKind::InvalidPort(header.port));
        }
        Ok(Some(header))
    }

    /// Wakes senders waiting for a TX buffer.
    pub fn notify_tx_available(&self) {
        let _arena = self.tx.arena.lock();
        self.tx.ready.notify_all();
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
