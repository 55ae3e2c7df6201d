//! In-process interconnect standing in for NIC hardware.
//!
//! Every attached node gets a RAW and an RDMA ring. Pushes are carried out
//! synchronously: RAW frames land in the destination's RAW receive queue;
//! RDMA-ring requests are executed against the destination's zone and
//! answered with an acknowledgement in the origin's RDMA receive queue. LONG
//! data goes to whichever receive buffer the destination has armed, and is
//! announced to the destination's software with that buffer's address.
//!
//! Frames are queued encoded, so every pop goes through the descriptor
//! decoder. Transmit credit is returned when the frame a push produced is
//! popped: the RAW frame at the destination, or the acknowledgement at the
//! origin.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
};

use crossbeam_channel::unbounded;
use nicwarp_core::{Config, ErrorKind, NodeId, ProtocolErrorKind, Result};
use nicwarp_protocol::{
    DescriptorDecoder, DescriptorEncoder, EventSink, HwRing, MessageHeader, MessageKind, RdmaZone, RingEvent,
    RingKind, RoutingTable, RxFrame, ZoneLayout,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::device::{Device, DeviceParts};

struct Frame {
    bytes: Vec<u8>,
    credit: Option<(NodeId, RingKind)>,
}

/// One hardware ring of an attached node.
pub struct LoopbackRing {
    node: NodeId,
    kind: RingKind,
    depth: usize,
    checksums: bool,
    in_flight: AtomicUsize,
    next_id: AtomicU16,
    rx: Mutex<VecDeque<Frame>>,
    zone: Arc<RdmaZone>,
    events: EventSink,
    fabric: Weak<FabricInner>,
}

impl fmt::Debug for LoopbackRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackRing")
            .field("node", &self.node)
            .field("kind", &self.kind)
            .field("depth", &self.depth)
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .field("queued", &self.rx.lock().len())
            .finish()
    }
}

impl LoopbackRing {
    /// Queues a frame for this ring's software and raises the interrupt if
    /// the ring was empty.
    fn post(&self, header: &MessageHeader, payload: &[u8], credit: Option<(NodeId, RingKind)>) {
        let bytes = DescriptorEncoder::encode_frame(header, payload, self.checksums);
        let was_empty = {
            let mut rx = self.rx.lock();
            rx.push_back(Frame { bytes, credit });
            rx.len() == 1
        };
        if was_empty {
            self.events.send(RingEvent::RxReady(self.kind));
        }
    }

    fn return_credit(&self) {
        let before = self.in_flight.fetch_sub(1, Ordering::AcqRel);
        if before >= self.depth {
            self.events.send(RingEvent::TxAvailable(self.kind));
        }
    }
}

impl HwRing for LoopbackRing {
    fn tx_credit(&self) -> usize {
        self.depth.saturating_sub(self.in_flight.load(Ordering::Acquire))
    }

    fn tx_push(&self, header: &MessageHeader, payload: &[u8]) -> u16 {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let msg_id = match self.kind {
            RingKind::Raw => self.next_id.fetch_add(1, Ordering::Relaxed),
            RingKind::Rdma => header.msg_id,
        };
        let header = MessageHeader { msg_id, ..*header };

        match self.fabric.upgrade() {
            Some(fabric) => match self.kind {
                RingKind::Raw => fabric.deliver_raw(self, &header, payload),
                RingKind::Rdma => fabric.execute(self, &header),
            },
            None => {
                warn!("fabric is gone, dropping frame from node {}", self.node);
                self.return_credit();
            }
        }
        msg_id
    }

    fn rx_credit(&self) -> usize {
        self.rx.lock().len()
    }

    fn rx_pop(&self) -> Option<RxFrame> {
        let frame = self.rx.lock().pop_front()?;
        if let Some((origin, ring)) = frame.credit {
            if let Some(fabric) = self.fabric.upgrade() {
                fabric.return_credit(origin, ring);
            }
        }
        Some(DescriptorDecoder::decode_frame(&frame.bytes, self.checksums))
    }
}

struct NodeHardware {
    zone: Arc<RdmaZone>,
    routes: Arc<RoutingTable>,
    raw: Arc<LoopbackRing>,
    rdma: Arc<LoopbackRing>,
}

impl NodeHardware {
    fn ring(&self, kind: RingKind) -> &LoopbackRing {
        match kind {
            RingKind::Raw => &self.raw,
            RingKind::Rdma => &self.rdma,
        }
    }
}

/// Why the remote side refused an RDMA-ring request.
#[derive(Debug)]
enum Rejection {
    Memory(ProtocolErrorKind),
    NoArmedBuffer,
}

impl From<ProtocolErrorKind> for Rejection {
    fn from(err: ProtocolErrorKind) -> Self {
        Rejection::Memory(err)
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Memory(err) => write!(f, "{}", err),
            Rejection::NoArmedBuffer => f.write_str("no armed LONG receive buffer"),
        }
    }
}

struct FabricInner {
    nodes: RwLock<HashMap<NodeId, Arc<NodeHardware>>>,
    ack_error_rate: Mutex<f64>,
    rdma_attempts: AtomicU64,
}

impl FabricInner {
    fn node(&self, id: NodeId) -> Option<Arc<NodeHardware>> {
        self.nodes.read().get(&id).cloned()
    }

    fn return_credit(&self, origin: NodeId, ring: RingKind) {
        if let Some(node) = self.node(origin) {
            node.ring(ring).return_credit();
        }
    }

    fn deliver_raw(&self, from: &LoopbackRing, header: &MessageHeader, payload: &[u8]) {
        match self.node(header.dst_node) {
            Some(target) => {
                trace!("RAW frame {} -> {} port {}", from.node, header.dst_node, header.port);
                target.raw.post(header, payload, Some((from.node, RingKind::Raw)));
            }
            None => {
                warn!("RAW frame from node {} to unknown node {} dropped", from.node, header.dst_node);
                from.return_credit();
            }
        }
    }

    /// Runs one RDMA-ring request and acknowledges it to the origin.
    fn execute(&self, from: &LoopbackRing, request: &MessageHeader) {
        self.rdma_attempts.fetch_add(1, Ordering::Relaxed);
        let error = match self.node(request.dst_node) {
            None => {
                warn!("RDMA {:?} id {} to unknown node {}", request.kind, request.msg_id, request.dst_node);
                true
            }
            Some(_) if self.inject_fault() => {
                trace!("injected remote error for RDMA id {}", request.msg_id);
                true
            }
            Some(target) => match Self::apply(from, &target, request) {
                Ok(()) => false,
                Err(err) => {
                    debug!(
                        "RDMA {:?} id {} rejected by node {}: {}",
                        request.kind, request.msg_id, request.dst_node, err
                    );
                    true
                }
            },
        };

        let ack = MessageHeader::ack_for(request, request.dst_node, error);
        from.post(&ack, &[], Some((from.node, RingKind::Rdma)));
    }

    fn apply(
        from: &LoopbackRing,
        target: &NodeHardware,
        request: &MessageHeader,
    ) -> std::result::Result<(), Rejection> {
        let rdma = request.rdma;
        let size = rdma.size as usize;
        match request.kind {
            MessageKind::LongData => {
                let data = from.zone.memory.read(rdma.local_addr, size)?;
                let buffer = target.zone.rx_buffers.claim_armed().ok_or(Rejection::NoArmedBuffer)?;
                if let Err(err) = target.zone.memory.write(buffer.hw_address, &data) {
                    target.zone.rx_buffers.arm(buffer.buf_id);
                    return Err(err.into());
                }
                let mut announce = *request;
                announce.rdma.remote_addr = buffer.hw_address;
                target.rdma.post(&announce, &[], None);
            }
            MessageKind::RdmaWrite => {
                target.zone.check_user_range(rdma.remote_addr, size)?;
                let data = from.zone.memory.read(rdma.local_addr, size)?;
                target.zone.memory.write(rdma.remote_addr, &data)?;
            }
            MessageKind::RdmaRead => {
                target.zone.check_user_range(rdma.remote_addr, size)?;
                let data = target.zone.memory.read(rdma.remote_addr, size)?;
                from.zone.memory.write(rdma.local_addr, &data)?;
            }
            MessageKind::RawData | MessageKind::Ack => return Err(ProtocolErrorKind::UnexpectedKind.into()),
        }
        Ok(())
    }

    fn inject_fault(&self) -> bool {
        let rate = *self.ack_error_rate.lock();
        rate > 0.0 && rand::random::<f64>() < rate
    }
}

/// An in-process interconnect connecting any number of devices.
///
/// Nodes are attached with [`LoopbackFabric::attach`] and made direct
/// neighbours with [`LoopbackFabric::link`]. Cloning yields another handle to
/// the same fabric.
#[derive(Clone)]
pub struct LoopbackFabric {
    inner: Arc<FabricInner>,
}

impl fmt::Debug for LoopbackFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut nodes: Vec<NodeId> = self.inner.nodes.read().keys().copied().collect();
        nodes.sort_unstable();
        f.debug_struct("LoopbackFabric").field("nodes", &nodes).finish()
    }
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackFabric {
    /// Creates an empty fabric.
    pub fn new() -> Self {
        LoopbackFabric {
            inner: Arc::new(FabricInner {
                nodes: RwLock::new(HashMap::new()),
                ack_error_rate: Mutex::new(0.0),
                rdma_attempts: AtomicU64::new(0),
            }),
        }
    }

    /// Attaches a node configured by `config` and starts its device.
    ///
    /// Fails if the configuration is invalid or the node id is taken.
    pub fn attach(&self, config: Config) -> Result<Device> {
        config.validate()?;
        let node_id = config.node_id;

        let (raw_tx, raw_events) = unbounded();
        let (rdma_tx, rdma_events) = unbounded();
        let events = EventSink::new(raw_tx, rdma_tx);
        let zone = Arc::new(RdmaZone::new(ZoneLayout::from_config(&config)));
        let routes = Arc::new(RoutingTable::new(node_id));

        let ring = |kind, depth| {
            Arc::new(LoopbackRing {
                node: node_id,
                kind,
                depth,
                checksums: config.use_checksums,
                in_flight: AtomicUsize::new(0),
                next_id: AtomicU16::new(0),
                rx: Mutex::new(VecDeque::new()),
                zone: Arc::clone(&zone),
                events: events.clone(),
                fabric: Arc::downgrade(&self.inner),
            })
        };
        let hardware = Arc::new(NodeHardware {
            zone: Arc::clone(&zone),
            routes: Arc::clone(&routes),
            raw: ring(RingKind::Raw, config.raw_ring_depth),
            rdma: ring(RingKind::Rdma, config.rdma_ring_depth),
        });

        {
            let mut nodes = self.inner.nodes.write();
            if nodes.contains_key(&node_id) {
                return Err(ErrorKind::InvalidConfig(format!("node {} is already attached", node_id)));
            }
            nodes.insert(node_id, Arc::clone(&hardware));
        }
        debug!("node {} attached to loopback fabric", node_id);

        let parts = DeviceParts {
            raw_ring: hardware.raw.clone(),
            rdma_ring: hardware.rdma.clone(),
            zone,
            routes,
            events,
            raw_events,
            rdma_events,
        };
        Device::start(config, parts).inspect_err(|_| {
            self.detach(node_id);
        })
    }

    /// Removes a node. Later traffic to it is answered as to an unknown node.
    pub fn detach(&self, node: NodeId) -> bool {
        let removed = self.inner.nodes.write().remove(&node).is_some();
        if removed {
            debug!("node {} detached from loopback fabric", node);
        }
        removed
    }

    /// Makes `a` and `b` direct neighbours of each other.
    pub fn link(&self, a: NodeId, b: NodeId) -> Result<()> {
        let nodes = self.inner.nodes.read();
        let (Some(left), Some(right)) = (nodes.get(&a), nodes.get(&b)) else {
            let missing = if nodes.contains_key(&a) { b } else { a };
            return Err(ErrorKind::Unreachable(missing));
        };
        left.routes.add_neighbour(b);
        right.routes.add_neighbour(a);
        Ok(())
    }

    /// Sets the probability in `[0, 1]` that an RDMA-ring request is answered
    /// with a remote error instead of being carried out.
    pub fn set_ack_error_rate(&self, rate: f64) {
        *self.inner.ack_error_rate.lock() = rate.clamp(0.0, 1.0);
    }

    /// RDMA-ring requests the fabric has executed or rejected, retries included.
    pub fn rdma_attempts(&self) -> u64 {
        self.inner.rdma_attempts.load(Ordering::Relaxed)
    }

    /// Ids of every attached node.
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.inner.nodes.read().keys().copied().collect();
        nodes.sort_unstable();
        nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(node: NodeId) -> Config {
        Config {
            long_tx_buffers: 2,
            long_rx_buffers: 2,
            user_rdma_bytes: 4096,
            ..Config::for_node(node)
        }
    }

    #[test]
    fn test_attach_rejects_duplicate_node() {
        let fabric = LoopbackFabric::new();
        let _device = fabric.attach(config(1)).unwrap();
        assert!(matches!(fabric.attach(config(1)), Err(ErrorKind::InvalidConfig(_))));
        assert_eq!(fabric.nodes(), vec![1]);
    }

    #[test]
    fn test_attach_rejects_invalid_config() {
        let fabric = LoopbackFabric::new();
        let bad = Config { raw_rx_slots: 0, ..config(1) };
        assert!(fabric.attach(bad).is_err());
        assert!(fabric.nodes().is_empty());
    }

    #[test]
    fn test_link_requires_both_nodes() {
        let fabric = LoopbackFabric::new();
        let a = fabric.attach(config(1)).unwrap();
        assert_eq!(fabric.link(1, 2), Err(ErrorKind::Unreachable(2)));

        let _b = fabric.attach(config(2)).unwrap();
        fabric.link(1, 2).unwrap();
        assert!(a.routes().is_neighbour(2));
    }

    #[test]
    fn test_detach() {
        let fabric = LoopbackFabric::new();
        let _device = fabric.attach(config(4)).unwrap();
        assert!(fabric.detach(4));
        assert!(!fabric.detach(4));
    }

    #[test]
    fn test_error_rate_is_clamped() {
        let fabric = LoopbackFabric::new();
        fabric.set_ack_error_rate(3.0);
        assert_eq!(*fabric.inner.ack_error_rate.lock(), 1.0);
    }
}
