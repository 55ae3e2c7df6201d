//! Deterministic hardware ring and transport stack for transport tests.

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU16, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use crossbeam_channel::{unbounded, Receiver};
use nicwarp_core::{NodeId, Statistics};
use nicwarp_protocol::{
    EventSink, HwRing, MessageHeader, MessageKind, PortBindings, RdmaZone, RingEvent, RoutingTable, RxFrame, ZoneLayout,
};
use nicwarp_transport::{LongTransport, RawTransport, Reliability, TransportContext};
use parking_lot::Mutex;

pub const LOCAL: NodeId = 1;
pub const PEER: NodeId = 2;

/// Ring whose inbound side is fed by the test and whose outbound side is recorded.
///
/// With a responder set, every RDMA-ring push is answered with an ack from that
/// node, carrying the configured error flag.
#[derive(Default)]
pub struct MockRing {
    pub credit: AtomicUsize,
    pushed: Mutex<Vec<(MessageHeader, Vec<u8>)>>,
    inbound: Mutex<VecDeque<RxFrame>>,
    next_raw_id: AtomicU16,
    id_override: Mutex<Option<u16>>,
    responder: Mutex<Option<(NodeId, bool)>>,
}

impl MockRing {
    pub fn with_credit(credit: usize) -> Arc<Self> {
        let ring = MockRing::default();
        ring.credit.store(credit, Ordering::SeqCst);
        Arc::new(ring)
    }

    pub fn inject(&self, header: MessageHeader, payload: Vec<u8>) {
        self.inbound.lock().push_back(Ok((header, payload)));
    }

    pub fn inject_frame(&self, frame: RxFrame) {
        self.inbound.lock().push_back(frame);
    }

    pub fn pushed(&self) -> Vec<(MessageHeader, Vec<u8>)> {
        self.pushed.lock().clone()
    }

    pub fn push_count(&self) -> usize {
        self.pushed.lock().len()
    }

    pub fn override_id(&self, id: Option<u16>) {
        *self.id_override.lock() = id;
    }

    pub fn respond_as(&self, node: NodeId, error: bool) {
        *self.responder.lock() = Some((node, error));
    }
}

impl HwRing for MockRing {
    fn tx_credit(&self) -> usize {
        self.credit.load(Ordering::SeqCst)
    }

    fn tx_push(&self, header: &MessageHeader, payload: &[u8]) -> u16 {
        self.pushed.lock().push((*header, payload.to_vec()));
        if let Some(id) = *self.id_override.lock() {
            return id;
        }
        if header.kind == MessageKind::RawData {
            return self.next_raw_id.fetch_add(1, Ordering::SeqCst);
        }
        if let Some((node, error)) = *self.responder.lock() {
            self.inject(MessageHeader::ack_for(header, node, error), Vec::new());
        }
        header.msg_id
    }

    fn rx_credit(&self) -> usize {
        self.inbound.lock().len()
    }

    fn rx_pop(&self) -> Option<RxFrame> {
        self.inbound.lock().pop_front()
    }
}

/// Every transport of one node wired to mock rings.
pub struct Stack {
    pub ctx: Arc<TransportContext>,
    pub events: Receiver<RingEvent>,
    pub raw_ring: Arc<MockRing>,
    pub rdma_ring: Arc<MockRing>,
    pub zone: Arc<RdmaZone>,
    pub raw: RawTransport,
    pub rdma: Arc<Reliability>,
    pub long: LongTransport,
}

pub struct StackConfig {
    pub raw_rx_slots: usize,
    pub long_rx_slots: usize,
    pub long_buffers: usize,
    pub rdma_records: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            raw_rx_slots: 8,
            long_rx_slots: 8,
            long_buffers: 4,
            rdma_records: 4,
            max_retries: 100,
            retry_delay: Duration::ZERO,
        }
    }
}

pub fn stack(config: StackConfig) -> Stack {
    let (kick, events) = unbounded();
    let routes = Arc::new(RoutingTable::new(LOCAL));
    routes.add_neighbour(PEER);
    let ctx = Arc::new(TransportContext::new(
        LOCAL,
        routes,
        Arc::new(PortBindings::new()),
        Arc::new(Statistics::default()),
        EventSink::shared(kick),
    ));

    let raw_ring = MockRing::with_credit(16);
    let rdma_ring = MockRing::with_credit(16);
    let zone = Arc::new(RdmaZone::new(ZoneLayout {
        base: 0x1000_0000,
        rx_buffers: config.long_buffers,
        tx_buffers: config.long_buffers,
        user_bytes: 4096,
    }));

    let raw = RawTransport::new(Arc::clone(&ctx), raw_ring.clone(), config.raw_rx_slots);
    let rdma = Arc::new(Reliability::new(
        Arc::clone(&ctx),
        rdma_ring.clone(),
        config.rdma_records,
        config.max_retries,
        config.retry_delay,
    ));
    let long = LongTransport::new(
        Arc::clone(&ctx),
        rdma_ring.clone(),
        Arc::clone(&rdma),
        Arc::clone(&zone),
        config.long_rx_slots,
    );

    Stack { ctx, events, raw_ring, rdma_ring, zone, raw, rdma, long }
}

impl Stack {
    /// Drains the RDMA ring and sends due retries until neither makes progress,
    /// the way the RDMA worker would across several wakeups.
    pub fn pump(&self) -> usize {
        let mut passes = 0;
        loop {
            let handled = self.long.drain();
            let resent = self.rdma.resend_due();
            if handled == 0 && resent == 0 {
                return passes;
            }
            passes += 1;
        }
    }
}
