//! Device context and consumer endpoints.
//!
//! A [`Device`] owns every table of one node: transports, port bindings,
//! routing, statistics and the worker threads draining the hardware rings.
//! Consumers talk to it through [`Endpoint`]s, which carry the identity the
//! port binding table records, a blocking mode and a cancel token.

use std::{
    fmt, mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use crossbeam_channel::{bounded, Receiver, Sender};
use nicwarp_core::{
    CancelToken, Config, ErrorKind, NodeId, Result, Statistics, StatisticsSnapshot, WaitMode, Waiter,
};
use nicwarp_protocol::{
    EventSink, HwRing, MessageHeader, MessageKind, OwnerId, Port, PortBindings, PortSelector, RdmaDescriptor,
    RdmaZone, RingEvent, RingKind, RoutingTable, Transport,
};
use nicwarp_transport::{
    Completion, LongTransport, RawTransport, RdmaCompletion, RdmaToken, Reliability, SendOutcome, TokenState,
    TransportContext,
};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::worker;

/// The hardware a device runs on.
pub struct DeviceParts {
    /// RAW message ring.
    pub raw_ring: Arc<dyn HwRing>,
    /// RDMA ring carrying LONG data, RDMA requests and acknowledgements.
    pub rdma_ring: Arc<dyn HwRing>,
    /// The node's RDMA memory zone.
    pub zone: Arc<RdmaZone>,
    /// Routing table shared with whoever maintains the topology.
    pub routes: Arc<RoutingTable>,
    /// Where software posts events for the workers.
    pub events: EventSink,
    /// Events for the RAW worker.
    pub raw_events: Receiver<RingEvent>,
    /// Events for the RDMA worker.
    pub rdma_events: Receiver<RingEvent>,
}

pub(crate) struct DeviceShared {
    pub(crate) config: Config,
    pub(crate) ctx: Arc<TransportContext>,
    pub(crate) zone: Arc<RdmaZone>,
    pub(crate) raw: RawTransport,
    pub(crate) rdma: Arc<Reliability>,
    pub(crate) long: LongTransport,
    next_owner: AtomicU64,
}

impl DeviceShared {
    fn ensure_open(&self) -> Result<()> {
        if self.ctx.is_closed() {
            return Err(ErrorKind::ShutDown);
        }
        Ok(())
    }

    fn wake_all(&self) {
        self.raw.wake_all();
        self.long.wake_all();
        self.rdma.wake_all();
    }
}

/// One node's NIC: transports, tables and worker threads.
///
/// Dropping the device shuts it down.
pub struct Device {
    shared: Arc<DeviceShared>,
    stop: Mutex<Option<Sender<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("node_id", &self.shared.ctx.node_id)
            .field("closed", &self.shared.ctx.is_closed())
            .field("workers", &self.workers.lock().len())
            .finish()
    }
}

impl Device {
    /// Builds the transports on `parts` and starts one worker per ring.
    pub fn start(config: Config, parts: DeviceParts) -> Result<Self> {
        config.validate()?;
        let ctx = Arc::new(TransportContext::new(
            config.node_id,
            parts.routes,
            Arc::new(PortBindings::new()),
            Arc::new(Statistics::default()),
            parts.events,
        ));

        let raw = RawTransport::new(Arc::clone(&ctx), parts.raw_ring, config.raw_rx_slots);
        let rdma = Arc::new(Reliability::new(
            Arc::clone(&ctx),
            Arc::clone(&parts.rdma_ring),
            config.rdma_records,
            config.rdma_max_retries,
            config.rdma_retry_delay,
        ));
        let long = LongTransport::new(
            Arc::clone(&ctx),
            parts.rdma_ring,
            Arc::clone(&rdma),
            Arc::clone(&parts.zone),
            config.long_rx_slots,
        );

        let node_id = config.node_id;
        let shared = Arc::new(DeviceShared {
            config,
            ctx,
            zone: parts.zone,
            raw,
            rdma,
            long,
            next_owner: AtomicU64::new(1),
        });

        let (stop, stopped) = bounded(0);
        let device = Device { shared, stop: Mutex::new(Some(stop)), workers: Mutex::new(Vec::new()) };
        for (kind, events) in [(RingKind::Raw, parts.raw_events), (RingKind::Rdma, parts.rdma_events)] {
            let handle = worker::spawn(kind, Arc::clone(&device.shared), events, stopped.clone())?;
            device.workers.lock().push(handle);
        }

        info!("device for node {} started", node_id);
        Ok(device)
    }

    /// Local node id.
    pub fn node_id(&self) -> NodeId {
        self.shared.ctx.node_id
    }

    /// Configuration the device was started with.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Opens a new endpoint in the configured default blocking mode.
    pub fn open(&self) -> Result<Endpoint> {
        self.shared.ensure_open()?;
        let owner = self.shared.next_owner.fetch_add(1, Ordering::Relaxed);
        Ok(Endpoint {
            shared: Arc::clone(&self.shared),
            owner,
            mode: WaitMode::from_blocking(self.shared.config.blocking_mode),
            cancel: CancelToken::new(),
        })
    }

    /// The routing table. Interface masks set here decide reachability of
    /// nodes that are not direct neighbours.
    pub fn routes(&self) -> &RoutingTable {
        &self.shared.ctx.routes
    }

    /// The local RDMA zone, for staging `rdma_write` sources and reading
    /// `rdma_read` results.
    pub fn zone(&self) -> &RdmaZone {
        &self.shared.zone
    }

    /// Current value of every counter.
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.shared.ctx.stats.snapshot()
    }

    /// Returns true once the device has been shut down.
    pub fn is_shut_down(&self) -> bool {
        self.shared.ctx.is_closed()
    }

    /// Stops the workers and wakes every blocked caller with `ShutDown`.
    ///
    /// Later operations on any endpoint of this device fail with `ShutDown`.
    pub fn shutdown(&self) {
        let Some(stop) = self.stop.lock().take() else {
            return;
        };
        self.shared.ctx.close();
        self.shared.wake_all();
        drop(stop);

        let workers = mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                error!("worker of node {} panicked", self.node_id());
            }
        }
        info!("device for node {} shut down", self.node_id());
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A consumer of one device.
///
/// Bindings made through an endpoint are released when it is dropped.
pub struct Endpoint {
    shared: Arc<DeviceShared>,
    owner: OwnerId,
    mode: WaitMode,
    cancel: CancelToken,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("node_id", &self.shared.ctx.node_id)
            .field("owner", &self.owner)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Endpoint {
    fn waiter(&self) -> Waiter<'_> {
        Waiter::new(self.mode).with_cancel(&self.cancel)
    }

    /// Identity recorded in the port binding table.
    pub fn id(&self) -> OwnerId {
        self.owner
    }

    /// Local node id.
    pub fn node_id(&self) -> NodeId {
        self.shared.ctx.node_id
    }

    /// Current blocking mode.
    pub fn mode(&self) -> WaitMode {
        self.mode
    }

    /// Switches between blocking and non-blocking operation.
    pub fn set_nonblocking(&mut self, nonblocking: bool) {
        self.mode = WaitMode::from_blocking(!nonblocking);
    }

    /// A handle another thread can use to interrupt this endpoint's current
    /// or next wait.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Binds `port` (or the lowest free one for [`PortSelector::Any`]) for
    /// `transport`, releasing this endpoint's previous binding on success.
    ///
    /// With `flush`, messages already queued on the port are discarded.
    pub fn bind(&self, transport: Transport, port: impl Into<PortSelector>, flush: bool) -> Result<Port> {
        self.shared.ensure_open()?;
        let port = self.shared.ctx.bindings.bind(transport, self.owner, port.into())?;
        if flush {
            let dropped = match transport {
                Transport::Raw => self.shared.raw.flush(port),
                Transport::Long => self.shared.long.flush(port),
            };
            debug!("flushed {} queued {:?} messages on port {}", dropped, transport, port);
        }
        Ok(port)
    }

    /// Releases this endpoint's binding for `transport`.
    pub fn unbind(&self, transport: Transport) -> Option<Port> {
        self.shared.ctx.bindings.unbind(transport, self.owner)
    }

    /// Port this endpoint holds for `transport`.
    pub fn bound_port(&self, transport: Transport) -> Option<Port> {
        self.shared.ctx.bindings.bound_port(transport, self.owner)
    }

    /// Sends `payload` to `port` on node `dst` and returns the hardware message id.
    pub fn send(&self, transport: Transport, dst: NodeId, port: u8, payload: &[u8]) -> Result<u16> {
        match transport {
            Transport::Raw => self.shared.raw.send(dst, port, payload, self.waiter()),
            Transport::Long => self.shared.long.send(dst, port, payload, self.waiter()),
        }
    }

    /// Receives the next message on a port this endpoint has bound.
    pub fn recv(&self, transport: Transport, port: u8) -> Result<(NodeId, Vec<u8>)> {
        match transport {
            Transport::Raw => self.shared.raw.recv(self.owner, port, self.waiter()),
            Transport::Long => self.shared.long.recv(self.owner, port, self.waiter()),
        }
    }

    /// Returns true if a send on `transport` would not have to wait.
    pub fn send_avail(&self, transport: Transport) -> bool {
        match transport {
            Transport::Raw => self.shared.raw.send_avail(),
            Transport::Long => self.shared.long.send_avail(),
        }
    }

    /// Returns true if a message is queued on `port`.
    pub fn recv_avail(&self, transport: Transport, port: u8) -> Result<bool> {
        let port = Port::new(port)?;
        Ok(match transport {
            Transport::Raw => self.shared.raw.recv_avail(port),
            Transport::Long => self.shared.long.recv_avail(port),
        })
    }

    /// Discards every queued message on a port this endpoint has bound.
    pub fn flush(&self, transport: Transport, port: u8) -> Result<usize> {
        let port = Port::new(port)?;
        if !self.shared.ctx.bindings.is_bound_by(transport, port, self.owner) {
            return Err(ErrorKind::NotBound(port.get()));
        }
        Ok(match transport {
            Transport::Raw => self.shared.raw.flush(port),
            Transport::Long => self.shared.long.flush(port),
        })
    }

    /// Writes `size` bytes at `local_addr` of this node's user region to
    /// `remote_addr` on node `dst`.
    pub fn rdma_write(
        &self,
        dst: NodeId,
        local_addr: u64,
        remote_addr: u64,
        size: u32,
        completion: Completion,
    ) -> Result<SendOutcome> {
        self.rdma(MessageKind::RdmaWrite, dst, local_addr, remote_addr, size, completion)
    }

    /// Reads `size` bytes at `remote_addr` on node `dst` into `local_addr` of
    /// this node's user region.
    pub fn rdma_read(
        &self,
        dst: NodeId,
        local_addr: u64,
        remote_addr: u64,
        size: u32,
        completion: Completion,
    ) -> Result<SendOutcome> {
        self.rdma(MessageKind::RdmaRead, dst, local_addr, remote_addr, size, completion)
    }

    fn rdma(
        &self,
        kind: MessageKind,
        dst: NodeId,
        local_addr: u64,
        remote_addr: u64,
        size: u32,
        completion: Completion,
    ) -> Result<SendOutcome> {
        self.shared.zone.check_user_range(local_addr, size as usize)?;
        let rdma = RdmaDescriptor { local_addr, remote_addr, size };
        let header = MessageHeader::rdma(kind, self.shared.ctx.node_id, dst, rdma);
        self.shared.rdma.send(header, completion, self.waiter())
    }

    /// State of the request `token` refers to.
    pub fn rdma_check(&self, token: &RdmaToken) -> TokenState {
        self.shared.rdma.check(token)
    }

    /// Waits until the request `token` refers to is acknowledged.
    pub fn rdma_wait(&self, token: &RdmaToken) -> Result<RdmaCompletion> {
        self.shared.rdma.wait(token, self.waiter())
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        for transport in [Transport::Raw, Transport::Long] {
            self.unbind(transport);
        }
    }
}
