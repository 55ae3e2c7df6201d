//! Device-wide cumulative counters.
//!
//! Counters only ever increase and use relaxed atomics, so they can be sampled
//! from any thread while traffic is flowing. [`Statistics::snapshot`] copies them
//! into plain structs for reporting.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::ProtocolErrorKind;

/// Why a hardware message was dropped on the receive path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscardCause {
    /// Port number outside `0..=6`.
    InvalidPort,
    /// LONG destination address did not resolve to a receive buffer.
    AddressOutOfRange,
    /// LONG buffer header failed validation.
    BufferHeader,
    /// Ack id outside the reliability table.
    AckIdOutOfRange,
    /// Ack came from a node other than the request's destination.
    AckSourceMismatch,
    /// Ack for a record that was not pending.
    UnexpectedAck,
    /// Message kind the ring does not carry.
    UnexpectedKind,
    /// Descriptor failed to decode.
    Malformed,
}

impl DiscardCause {
    /// Number of causes.
    pub const COUNT: usize = 8;

    /// All causes in index order.
    pub const ALL: [DiscardCause; DiscardCause::COUNT] = [
        DiscardCause::InvalidPort,
        DiscardCause::AddressOutOfRange,
        DiscardCause::BufferHeader,
        DiscardCause::AckIdOutOfRange,
        DiscardCause::AckSourceMismatch,
        DiscardCause::UnexpectedAck,
        DiscardCause::UnexpectedKind,
        DiscardCause::Malformed,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl From<&ProtocolErrorKind> for DiscardCause {
    fn from(kind: &ProtocolErrorKind) -> Self {
        match kind {
            ProtocolErrorKind::InvalidPort(_) => DiscardCause::InvalidPort,
            ProtocolErrorKind::AddressOutOfRange(_) => DiscardCause::AddressOutOfRange,
            ProtocolErrorKind::BufferHeader => DiscardCause::BufferHeader,
            ProtocolErrorKind::AckIdOutOfRange(_) => DiscardCause::AckIdOutOfRange,
            ProtocolErrorKind::AckSourceMismatch { .. } => DiscardCause::AckSourceMismatch,
            ProtocolErrorKind::UnexpectedAck(_) => DiscardCause::UnexpectedAck,
            ProtocolErrorKind::UnexpectedKind => DiscardCause::UnexpectedKind,
            ProtocolErrorKind::Malformed(_) => DiscardCause::Malformed,
        }
    }
}

/// Live counters for one transport.
#[derive(Debug, Default)]
pub struct TransportStatistics {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    send_waits: AtomicU64,
    recv_waits: AtomicU64,
}

impl TransportStatistics {
    /// Counts one message of `bytes` handed to hardware.
    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Counts one message of `bytes` delivered to a consumer.
    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Counts a send that had to wait for capacity.
    pub fn record_send_wait(&self) {
        self.send_waits.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a receive that had to wait for data.
    pub fn record_recv_wait(&self) {
        self.recv_waits.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the current values.
    pub fn snapshot(&self) -> TransportCounters {
        TransportCounters {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            send_waits: self.send_waits.load(Ordering::Relaxed),
            recv_waits: self.recv_waits.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of one transport's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportCounters {
    /// Messages handed to hardware.
    pub packets_sent: u64,
    /// Payload bytes handed to hardware.
    pub bytes_sent: u64,
    /// Messages delivered to consumers.
    pub packets_received: u64,
    /// Payload bytes delivered to consumers.
    pub bytes_received: u64,
    /// Sends that blocked waiting for capacity.
    pub send_waits: u64,
    /// Receives that blocked waiting for data.
    pub recv_waits: u64,
}

/// Cumulative counters for a device.
#[derive(Debug, Default)]
pub struct Statistics {
    /// RAW transport.
    pub raw: TransportStatistics,
    /// LONG transport.
    pub long: TransportStatistics,
    /// RDMA requests (including the writes carrying LONG data).
    pub rdma: TransportStatistics,
    rdma_retries: AtomicU64,
    rdma_retries_exhausted: AtomicU64,
    rdma_completions: AtomicU64,
    discards: [AtomicU64; DiscardCause::COUNT],
    worker_interrupts: AtomicU64,
    watchdog_ticks: AtomicU64,
}

impl Statistics {
    /// Counts one resend after a remote error.
    pub fn record_retry(&self) {
        self.rdma_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a request completed with error after the last allowed retry.
    pub fn record_retries_exhausted(&self) {
        self.rdma_retries_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one finalized RDMA request.
    pub fn record_completion(&self) {
        self.rdma_completions.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one dropped hardware message.
    pub fn record_discard(&self, cause: DiscardCause) {
        self.discards[cause.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a worker wake-up caused by a ring event.
    pub fn record_interrupt(&self) {
        self.worker_interrupts.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a worker wake-up caused by the watchdog.
    pub fn record_watchdog_tick(&self) {
        self.watchdog_ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Discards recorded for `cause` so far.
    pub fn discards(&self, cause: DiscardCause) -> u64 {
        self.discards[cause.index()].load(Ordering::Relaxed)
    }

    /// Copies every counter.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        let mut discards = [0; DiscardCause::COUNT];
        for (slot, counter) in discards.iter_mut().zip(self.discards.iter()) {
            *slot = counter.load(Ordering::Relaxed);
        }
        StatisticsSnapshot {
            raw: self.raw.snapshot(),
            long: self.long.snapshot(),
            rdma: self.rdma.snapshot(),
            rdma_retries: self.rdma_retries.load(Ordering::Relaxed),
            rdma_retries_exhausted: self.rdma_retries_exhausted.load(Ordering::Relaxed),
            rdma_completions: self.rdma_completions.load(Ordering::Relaxed),
            discards,
            worker_interrupts: self.worker_interrupts.load(Ordering::Relaxed),
            watchdog_ticks: self.watchdog_ticks.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`Statistics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    /// RAW transport counters.
    pub raw: TransportCounters,
    /// LONG transport counters.
    pub long: TransportCounters,
    /// RDMA counters.
    pub rdma: TransportCounters,
    /// Resends after remote error.
    pub rdma_retries: u64,
    /// Requests completed with error after the last retry.
    pub rdma_retries_exhausted: u64,
    /// Finalized RDMA requests.
    pub rdma_completions: u64,
    /// Discards indexed by [`DiscardCause`].
    pub discards: [u64; DiscardCause::COUNT],
    /// Worker wake-ups from ring events.
    pub worker_interrupts: u64,
    /// Worker wake-ups from the watchdog.
    pub watchdog_ticks: u64,
}

impl StatisticsSnapshot {
    /// Discards for one cause.
    pub fn discarded(&self, cause: DiscardCause) -> u64 {
        self.discards[cause.index()]
    }

    /// All protocol discards together.
    pub fn protocol_errors(&self) -> u64 {
        self.discards.iter().sum()
    }
}
