#![warn(missing_docs)]

//! nicwarp-transport: the RAW, LONG and RDMA transports.
//!
//! - [`RawTransport`] sends small messages inline through the RAW ring and
//!   queues received ones per port.
//! - [`Reliability`] tracks in-flight RDMA requests, matches acknowledgements,
//!   retries remote errors and completes callers.
//! - [`LongTransport`] moves bulk messages as RDMA writes into pre-armed
//!   receive buffers on top of [`Reliability`].
//!
//! All three share a [`TransportContext`] holding the device-wide tables.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use nicwarp_core::{DiscardCause, NodeId, ProtocolErrorKind, Statistics};
use nicwarp_protocol::{EventSink, PortBindings, RingEvent, RoutingTable};
use tracing::warn;

/// Bulk message transport.
pub mod long;
/// Small inline message transport.
pub mod raw;
/// RDMA request tracking and completion.
pub mod reliability;

pub use long::LongTransport;
pub use raw::RawTransport;
pub use reliability::{Completion, RdmaCompletion, RdmaToken, Reliability, SendOutcome, TokenState};

/// Device-wide state every transport reads.
#[derive(Debug)]
pub struct TransportContext {
    /// Local node id, stamped as source on every outbound header.
    pub node_id: NodeId,
    /// Reachability decisions for sends.
    pub routes: Arc<RoutingTable>,
    /// Port ownership for receives.
    pub bindings: Arc<PortBindings>,
    /// Cumulative counters.
    pub stats: Arc<Statistics>,
    /// Set once the device is torn down.
    pub closed: AtomicBool,
    kick: EventSink,
}

impl TransportContext {
    /// Creates a context. `kick` reaches the worker loops.
    pub fn new(
        node_id: NodeId,
        routes: Arc<RoutingTable>,
        bindings: Arc<PortBindings>,
        stats: Arc<Statistics>,
        kick: EventSink,
    ) -> Self {
        TransportContext { node_id, routes, bindings, stats, closed: AtomicBool::new(false), kick }
    }

    /// Returns true once the device has been shut down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the device as shut down.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Counts and logs a dropped hardware message.
    pub fn discard(&self, err: &ProtocolErrorKind) {
        warn!("discarding hardware message: {}", err);
        self.stats.record_discard(DiscardCause::from(err));
    }

    /// Wakes the worker for `event`. A stopped worker is ignored.
    pub fn kick(&self, event: RingEvent) {
        self.kick.send(event);
    }
}
