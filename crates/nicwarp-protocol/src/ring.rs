//! Hardware ring adapter.

use crossbeam_channel::Sender;
use nicwarp_core::DecodingErrorKind;

use crate::header::MessageHeader;

/// One received hardware frame: the decoded header and its inline payload, or the
/// reason the descriptor could not be decoded.
pub type RxFrame = Result<(MessageHeader, Vec<u8>), DecodingErrorKind>;

/// Which of the two hardware rings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RingKind {
    /// RAW message ring.
    Raw,
    /// RDMA ring carrying LONG data, RDMA requests and acks.
    Rdma,
}

/// Interrupt-style notification raised by the hardware or by software for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingEvent {
    /// The ring's receive side is non-empty.
    RxReady(RingKind),
    /// Transmit credit was returned to the ring.
    TxAvailable(RingKind),
    /// A software queue fed by the ring regained free slots.
    SpaceAvailable(RingKind),
}

impl RingEvent {
    /// Ring the event refers to.
    pub fn ring(self) -> RingKind {
        match self {
            RingEvent::RxReady(ring) | RingEvent::TxAvailable(ring) | RingEvent::SpaceAvailable(ring) => ring,
        }
    }
}

/// Channel-backed sink delivering each event to the worker that owns its ring.
#[derive(Debug, Clone)]
pub struct EventSink {
    raw: Sender<RingEvent>,
    rdma: Sender<RingEvent>,
}

impl EventSink {
    /// Routes RAW events to `raw` and RDMA events to `rdma`.
    pub fn new(raw: Sender<RingEvent>, rdma: Sender<RingEvent>) -> Self {
        EventSink { raw, rdma }
    }

    /// Routes events for both rings into one channel.
    pub fn shared(sender: Sender<RingEvent>) -> Self {
        EventSink { raw: sender.clone(), rdma: sender }
    }

    /// Posts `event`. Returns false if the receiving worker is gone.
    pub fn send(&self, event: RingEvent) -> bool {
        let sender = match event.ring() {
            RingKind::Raw => &self.raw,
            RingKind::Rdma => &self.rdma,
        };
        sender.send(event).is_ok()
    }
}

/// The four primitives a hardware ring offers software.
///
/// Implementations are non-blocking, notify the hardware exactly once per push
/// or pop and report remote failures through header flags rather than errors.
/// Credit values are hints that may race with other producers; callers re-check
/// after taking whatever exclusivity they need.
pub trait HwRing: Send + Sync {
    /// Free transmit descriptors.
    fn tx_credit(&self) -> usize;

    /// Hands one message to hardware and returns the message id it was sent with.
    fn tx_push(&self, header: &MessageHeader, payload: &[u8]) -> u16;

    /// Received frames waiting to be popped.
    fn rx_credit(&self) -> usize;

    /// Pops the oldest received frame.
    fn rx_pop(&self) -> Option<RxFrame>;
}
