use std::result;

use thiserror::Error;

use crate::NodeId;

/// Convenience alias used throughout nicwarp.
pub type Result<T> = result::Result<T, ErrorKind>;

/// Errors surfaced to the caller of a nicwarp operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorKind {
    /// Payload exceeds the transport's maximum.
    #[error("payload of {size} bytes exceeds the transport maximum of {max}")]
    PayloadTooLarge {
        /// Size of the rejected payload.
        size: usize,
        /// Largest payload the transport accepts.
        max: usize,
    },
    /// No route to the destination node.
    #[error("node {0} is unreachable")]
    Unreachable(NodeId),
    /// Non-blocking mode and no data or space is available yet.
    #[error("operation would block")]
    WouldBlock,
    /// The wait was cancelled. No state was changed.
    #[error("wait interrupted")]
    Interrupted,
    /// No free slot or no ring credit.
    #[error("no capacity available")]
    Capacity,
    /// A malformed or mismatched hardware message.
    #[error("protocol error: {0}")]
    Protocol(ProtocolErrorKind),
    /// Port number outside `0..=6`.
    #[error("invalid port {0}")]
    InvalidPort(u8),
    /// Port already bound by another endpoint.
    #[error("port {0} is already bound")]
    PortInUse(u8),
    /// `ANY` was requested but every port is bound.
    #[error("no free port")]
    NoFreePort,
    /// The endpoint does not hold a binding on the port.
    #[error("port {0} is not bound by this endpoint")]
    NotBound(u8),
    /// The RDMA token does not refer to a request that can still be waited on.
    #[error("invalid RDMA token")]
    InvalidToken,
    /// Hardware assigned a different message id than the reliability table.
    #[error("hardware assigned message id {actual}, expected {expected}")]
    HardwareIdMismatch {
        /// Id assigned by the reliability table.
        expected: u16,
        /// Id returned by the ring.
        actual: u16,
    },
    /// The device has been shut down.
    #[error("device shut down")]
    ShutDown,
    /// A configuration value is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The operating system refused to start a worker thread.
    #[error("failed to start worker thread: {0}")]
    WorkerSpawn(String),
}

impl From<ProtocolErrorKind> for ErrorKind {
    fn from(inner: ProtocolErrorKind) -> Self {
        ErrorKind::Protocol(inner)
    }
}

/// Reasons a hardware descriptor failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodingErrorKind {
    /// Fewer bytes than a descriptor needs.
    #[error("descriptor truncated")]
    Truncated,
    /// Unknown message kind byte.
    #[error("unknown message kind {0}")]
    MessageKind(u8),
    /// Reserved flag bits are set.
    #[error("reserved flags set: {0:#04x}")]
    Flags(u8),
    /// Declared payload size does not match the bytes that follow.
    #[error("declared payload size {declared} but {actual} bytes follow")]
    PayloadLength {
        /// Size from the descriptor.
        declared: u32,
        /// Bytes actually present.
        actual: usize,
    },
    /// CRC-32 mismatch.
    #[error("checksum mismatch")]
    Checksum,
}

/// Protocol violations detected on the receive path. These are counted and the
/// offending message dropped; they never reach an unrelated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolErrorKind {
    /// Port number outside `0..=6` in an inbound header.
    #[error("port {0} out of range")]
    InvalidPort(u8),
    /// Destination address does not resolve to a LONG receive buffer.
    #[error("address {0:#x} out of range")]
    AddressOutOfRange(u64),
    /// LONG buffer header failed validation.
    #[error("corrupt LONG buffer header")]
    BufferHeader,
    /// Acknowledgement id outside the reliability table.
    #[error("ack id {0} out of range")]
    AckIdOutOfRange(u16),
    /// Acknowledgement from a node other than the request's destination.
    #[error("ack for id {msg_id} from node {from}, expected node {expected}")]
    AckSourceMismatch {
        /// Id carried by the ack.
        msg_id: u16,
        /// Node the ack came from.
        from: NodeId,
        /// Node the request was sent to.
        expected: NodeId,
    },
    /// Acknowledgement for a record that is not pending.
    #[error("unexpected ack for id {0}")]
    UnexpectedAck(u16),
    /// Inbound message of a kind the ring does not carry.
    #[error("unexpected message kind on ring")]
    UnexpectedKind,
    /// Descriptor could not be decoded.
    #[error("malformed descriptor: {0}")]
    Malformed(DecodingErrorKind),
}
