//! RDMA reliability: in-flight request records, acknowledgement matching,
//! bounded retry and completion.
//!
//! Every request on the RDMA ring claims one record from a fixed table. The
//! record index doubles as the hardware message id, so an acknowledgement is
//! matched by id alone regardless of arrival order.
//!
//! A remote-error acknowledgement queues the request for a resend instead of
//! pushing it from the receive path. Queued resends go out from
//! [`Reliability::resend_due`] once their delay has passed and only while the
//! ring has credit.
//!
//! Lock order is table, then record, then retry queue. The ack path takes only
//! the record lock and drops it before touching the table; callbacks run with
//! no lock held.

use std::{
    collections::VecDeque,
    fmt, mem,
    sync::Arc,
    time::{Duration, Instant},
};

use nicwarp_core::{ErrorKind, NodeId, ProtocolErrorKind, Result, SlotArena, SlotId, Waiter};
use nicwarp_protocol::{HwRing, MessageHeader};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, trace};

use crate::TransportContext;

/// Outcome handed to a completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RdmaCompletion {
    /// Hardware message id of the request.
    pub msg_id: u16,
    /// The last acknowledgement carried the remote error flag.
    pub remote_error: bool,
    /// Resends performed before completion.
    pub retries: u32,
}

/// How the caller learns that a request completed.
pub enum Completion {
    /// `send` parks until the request is acknowledged.
    Blocking,
    /// Invoked once from the receive path when the request completes.
    Callback(Box<dyn FnOnce(RdmaCompletion) + Send>),
    /// Fire-and-forget.
    None,
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Blocking => write!(f, "Blocking"),
            Completion::Callback(_) => write!(f, "Callback(..)"),
            Completion::None => write!(f, "None"),
        }
    }
}

/// Caller-held handle to a request: its record index and the record's
/// generation when the request was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RdmaToken {
    /// Hardware message id (record index).
    pub msg_id: u16,
    /// Record generation at issue time.
    pub generation: u32,
}

/// Result of [`Reliability::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Blocking request, already acknowledged.
    Completed {
        /// Token of the finished request.
        token: RdmaToken,
        /// The acknowledgement carried the remote error flag.
        remote_error: bool,
    },
    /// Request is in flight and will be finalized by the receive path.
    Pending(RdmaToken),
}

impl SendOutcome {
    /// The request's token.
    pub fn token(&self) -> RdmaToken {
        match self {
            SendOutcome::Completed { token, .. } | SendOutcome::Pending(token) => *token,
        }
    }
}

/// State of the request a token refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// Completed, and the record has not been reused since.
    Acked,
    /// Still in flight.
    Pending,
    /// Unknown id, or the record has moved on to another request.
    Invalid,
}

struct Record {
    generation: u32,
    retries: u32,
    in_flight: bool,
    ack_received: bool,
    retry_queued: bool,
    remote_error: bool,
    completion: Completion,
    saved_header: Option<MessageHeader>,
    dest_node: Option<NodeId>,
}

impl Record {
    fn new() -> Self {
        Record {
            generation: 0,
            retries: 0,
            in_flight: false,
            ack_received: false,
            retry_queued: false,
            remote_error: false,
            completion: Completion::None,
            saved_header: None,
            dest_node: None,
        }
    }

    fn state_for(&self, token: &RdmaToken) -> TokenState {
        if self.generation == token.generation.wrapping_add(1) {
            TokenState::Acked
        } else if self.generation == token.generation && self.in_flight {
            TokenState::Pending
        } else {
            TokenState::Invalid
        }
    }

    fn clear(&mut self) {
        self.in_flight = false;
        self.ack_received = false;
        self.retry_queued = false;
        self.completion = Completion::None;
        self.saved_header = None;
        self.dest_node = None;
    }
}

struct RecordCell {
    state: Mutex<Record>,
    done: Condvar,
}

struct PendingRetry {
    msg_id: u16,
    due: Instant,
}

/// Table of in-flight RDMA requests for one RDMA ring.
pub struct Reliability {
    ctx: Arc<TransportContext>,
    ring: Arc<dyn HwRing>,
    table: Mutex<SlotArena>,
    capacity: Condvar,
    records: Box<[RecordCell]>,
    retries: Mutex<VecDeque<PendingRetry>>,
    max_retries: u32,
    retry_delay: Duration,
}

impl Reliability {
    /// Creates a table of `records` request records.
    ///
    /// A request failed remotely is resent at most `max_retries` times, each
    /// no sooner than `retry_delay` after its error acknowledgement.
    pub fn new(
        ctx: Arc<TransportContext>,
        ring: Arc<dyn HwRing>,
        records: usize,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Self {
        debug_assert!(records <= u16::MAX as usize + 1);
        Reliability {
            ctx,
            ring,
            table: Mutex::new(SlotArena::new(records, 0)),
            capacity: Condvar::new(),
            records: (0..records)
                .map(|_| RecordCell { state: Mutex::new(Record::new()), done: Condvar::new() })
                .collect(),
            retries: Mutex::new(VecDeque::new()),
            max_retries,
            retry_delay,
        }
    }

    /// Number of request records.
    pub fn capacity(&self) -> usize {
        self.records.len()
    }

    /// Records not currently claimed by a request.
    pub fn free_records(&self) -> usize {
        self.table.lock().free_len()
    }

    /// Returns true if a send would find both ring credit and a free record.
    pub fn send_avail(&self) -> bool {
        self.ring.tx_credit() > 0 && !self.table.lock().is_exhausted()
    }

    /// Issues `header` on the RDMA ring.
    ///
    /// `header.msg_id` is overwritten with the claimed record index. With
    /// [`Completion::Blocking`] this parks until the acknowledgement arrives;
    /// otherwise it returns as soon as the request is on the ring.
    pub fn send(&self, mut header: MessageHeader, completion: Completion, waiter: Waiter<'_>) -> Result<SendOutcome> {
        let waiter = waiter.with_teardown(&self.ctx.closed);
        self.ctx.routes.ensure_reachable(header.dst_node)?;

        let mut table = self.table.lock();
        let ring = &self.ring;
        if waiter.wait_until(&self.capacity, &mut table, |t| ring.tx_credit() > 0 && !t.is_exhausted())? {
            self.ctx.stats.rdma.record_send_wait();
        }
        let slot = table.alloc().ok_or(ErrorKind::Capacity)?;
        let msg_id = slot.raw() as u16;
        header.msg_id = msg_id;

        let blocking = matches!(completion, Completion::Blocking);
        let cell = &self.records[slot.index()];
        let token = {
            let mut record = cell.state.lock();
            record.retries = 0;
            record.in_flight = true;
            record.ack_received = false;
            record.retry_queued = false;
            record.remote_error = false;
            record.completion = completion;
            record.saved_header = Some(header);
            record.dest_node = Some(header.dst_node);
            RdmaToken { msg_id, generation: record.generation }
        };

        let assigned = self.ring.tx_push(&header, &[]);
        if assigned != msg_id {
            error!("RDMA ring assigned id {} to request sent as {}", assigned, msg_id);
            cell.state.lock().clear();
            table.release(slot);
            drop(table);
            self.capacity.notify_one();
            return Err(ErrorKind::HardwareIdMismatch { expected: msg_id, actual: assigned });
        }
        drop(table);

        self.ctx.stats.rdma.record_sent(header.rdma.size as usize);
        trace!("RDMA {:?} id {} to node {}", header.kind, msg_id, header.dst_node);

        if !blocking {
            return Ok(SendOutcome::Pending(token));
        }

        let mut record = cell.state.lock();
        let waited = waiter.wait_until(&cell.done, &mut record, |r| r.ack_received);
        match waited {
            Ok(parked) => {
                if parked {
                    self.ctx.stats.rdma.record_recv_wait();
                }
            }
            Err(err) if !record.ack_received => {
                // The receive path owns the record from here and releases it on ack.
                debug!("blocking RDMA id {} abandoned ({}), completing as fire-and-forget", msg_id, err);
                record.completion = Completion::None;
                return Err(err);
            }
            Err(_) => {}
        }

        let remote_error = record.remote_error;
        record.clear();
        drop(record);
        self.release(slot);
        Ok(SendOutcome::Completed { token, remote_error })
    }

    fn release(&self, slot: SlotId) {
        self.table.lock().release(slot);
        self.capacity.notify_one();
    }

    /// Processes an acknowledgement popped from the RDMA ring.
    ///
    /// Errors are protocol violations; the caller counts and drops the ack.
    pub fn handle_ack(&self, ack: &MessageHeader) -> std::result::Result<(), ProtocolErrorKind> {
        let index = ack.msg_id as usize;
        let cell = self.records.get(index).ok_or(ProtocolErrorKind::AckIdOutOfRange(ack.msg_id))?;

        let mut record = cell.state.lock();
        if !record.in_flight || record.ack_received || record.retry_queued {
            return Err(ProtocolErrorKind::UnexpectedAck(ack.msg_id));
        }
        let expected = record.dest_node.unwrap_or(NodeId::MAX);
        if expected != ack.src_node {
            return Err(ProtocolErrorKind::AckSourceMismatch { msg_id: ack.msg_id, from: ack.src_node, expected });
        }

        if ack.error && record.retries < self.max_retries && record.saved_header.is_some() {
            record.retries += 1;
            record.retry_queued = true;
            debug!("RDMA id {} failed remotely, retry {}/{} queued", ack.msg_id, record.retries, self.max_retries);
            let due = Instant::now() + self.retry_delay;
            self.retries.lock().push_back(PendingRetry { msg_id: ack.msg_id, due });
            return Ok(());
        }

        if ack.error {
            self.ctx.stats.record_retries_exhausted();
            debug!("RDMA id {} failed after {} retries, completing with error", ack.msg_id, record.retries);
        }
        self.finalize(cell, record, ack.msg_id, ack.error);
        Ok(())
    }

    /// Completes the request held in `record` and hands the outcome to its
    /// waiter or callback.
    fn finalize(&self, cell: &RecordCell, mut record: MutexGuard<'_, Record>, msg_id: u16, remote_error: bool) {
        record.generation = record.generation.wrapping_add(1);
        record.remote_error = remote_error;
        self.ctx.stats.record_completion();
        self.ctx.stats.rdma.record_received(record.saved_header.map_or(0, |h| h.rdma.size as usize));

        let outcome = RdmaCompletion { msg_id, remote_error, retries: record.retries };
        match mem::replace(&mut record.completion, Completion::None) {
            Completion::Blocking => {
                record.ack_received = true;
                drop(record);
                cell.done.notify_all();
            }
            completion => {
                record.clear();
                drop(record);
                cell.done.notify_all();
                self.release(SlotId::new(msg_id as u32));
                if let Completion::Callback(callback) = completion {
                    callback(outcome);
                }
            }
        }
    }

    /// Resends queued retries whose delay has passed, oldest first, for as
    /// long as the ring has credit. Returns the number of requests pushed.
    pub fn resend_due(&self) -> usize {
        let now = Instant::now();
        let mut resent = 0;
        loop {
            let next = {
                let mut pending = self.retries.lock();
                match pending.front() {
                    Some(retry) if retry.due <= now && self.ring.tx_credit() > 0 => pending.pop_front(),
                    _ => None,
                }
            };
            let Some(retry) = next else {
                break;
            };
            if self.resend(retry.msg_id) {
                resent += 1;
            }
        }
        resent
    }

    /// Returns true if resends are waiting for their delay or for ring credit.
    pub fn retries_pending(&self) -> bool {
        !self.retries.lock().is_empty()
    }

    fn resend(&self, msg_id: u16) -> bool {
        let Some(cell) = self.records.get(msg_id as usize) else {
            return false;
        };
        let mut record = cell.state.lock();
        let saved = match record.saved_header {
            Some(saved) if record.retry_queued => saved,
            _ => return false,
        };
        record.retry_queued = false;

        let assigned = self.ring.tx_push(&saved, &[]);
        if assigned != msg_id {
            error!("RDMA ring assigned id {} to retry of {}, completing with error", assigned, msg_id);
            self.finalize(cell, record, msg_id, true);
            return true;
        }
        self.ctx.stats.record_retry();
        trace!("RDMA id {} resent to node {}", msg_id, saved.dst_node);
        true
    }

    /// Reports the state of the request `token` refers to.
    pub fn check(&self, token: &RdmaToken) -> TokenState {
        match self.records.get(token.msg_id as usize) {
            Some(cell) => cell.state.lock().state_for(token),
            None => TokenState::Invalid,
        }
    }

    /// Parks until the request `token` refers to is no longer pending.
    pub fn wait(&self, token: &RdmaToken, waiter: Waiter<'_>) -> Result<RdmaCompletion> {
        let waiter = waiter.with_teardown(&self.ctx.closed);
        let cell = self.records.get(token.msg_id as usize).ok_or(ErrorKind::InvalidToken)?;

        let mut record = cell.state.lock();
        waiter.wait_until(&cell.done, &mut record, |r| r.state_for(token) != TokenState::Pending)?;
        match record.state_for(token) {
            TokenState::Acked => Ok(RdmaCompletion {
                msg_id: token.msg_id,
                remote_error: record.remote_error,
                retries: record.retries,
            }),
            _ => Err(ErrorKind::InvalidToken),
        }
    }

    /// Wakes senders waiting for ring credit or a free record.
    pub fn notify_capacity(&self) {
        let _table = self.table.lock();
        self.capacity.notify_all();
    }

    /// Wakes every parked sender and token waiter, e.g. on teardown.
    pub fn wake_all(&self) {
        self.notify_capacity();
        for cell in self.records.iter() {
            let _record = cell.state.lock();
            cell.done.notify_all();
        }
    }
}
