use std::convert::TryFrom;

use nicwarp_core::{DecodingErrorKind, NodeId};

/// Kind of message carried by a hardware descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Small message with its payload inline.
    RawData = 1,
    /// Notification that a LONG payload was written into a receive buffer.
    LongData = 2,
    /// RDMA write of local memory into remote memory.
    RdmaWrite = 3,
    /// RDMA read of remote memory into local memory.
    RdmaRead = 4,
    /// Hardware acknowledgement of an RDMA-ring request.
    Ack = 5,
}

impl MessageKind {
    /// Wire value of the kind.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Returns true for kinds carried on the RDMA ring.
    pub fn is_rdma_ring(self) -> bool {
        !matches!(self, MessageKind::RawData)
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = DecodingErrorKind;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageKind::RawData),
            2 => Ok(MessageKind::LongData),
            3 => Ok(MessageKind::RdmaWrite),
            4 => Ok(MessageKind::RdmaRead),
            5 => Ok(MessageKind::Ack),
            other => Err(DecodingErrorKind::MessageKind(other)),
        }
    }
}

/// Out-of-line payload of an RDMA-ring message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RdmaDescriptor {
    /// Address in the sender's RDMA zone.
    pub local_addr: u64,
    /// Address in the receiver's RDMA zone.
    pub remote_addr: u64,
    /// Bytes to transfer.
    pub size: u32,
}

/// Logical message header, independent of the descriptor layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Message kind.
    pub kind: MessageKind,
    /// Destination port. Not validated here; receivers check it.
    pub port: u8,
    /// Sending node.
    pub src_node: NodeId,
    /// Receiving node.
    pub dst_node: NodeId,
    /// Hardware message id. On the RDMA ring this is the reliability record index.
    pub msg_id: u16,
    /// User payload length.
    pub payload_size: u32,
    /// Remote side reported an error.
    pub error: bool,
    /// This descriptor acknowledges an earlier RDMA-ring request.
    pub is_ack: bool,
    /// Out-of-line transfer, unused for RAW.
    pub rdma: RdmaDescriptor,
}

impl MessageHeader {
    fn base(kind: MessageKind, src_node: NodeId, dst_node: NodeId) -> Self {
        MessageHeader {
            kind,
            port: 0,
            src_node,
            dst_node,
            msg_id: 0,
            payload_size: 0,
            error: false,
            is_ack: false,
            rdma: RdmaDescriptor::default(),
        }
    }

    /// Header for a RAW message with `len` inline bytes.
    pub fn raw(src_node: NodeId, dst_node: NodeId, port: u8, len: usize) -> Self {
        MessageHeader { port, payload_size: len as u32, ..Self::base(MessageKind::RawData, src_node, dst_node) }
    }

    /// Header for a LONG message whose buffer was copied from `local_addr` to `remote_addr`.
    ///
    /// `size` covers the buffer header plus `len` payload bytes. On the
    /// receiving side `remote_addr` names the receive buffer the hardware chose.
    pub fn long(src_node: NodeId, dst_node: NodeId, port: u8, len: usize, rdma: RdmaDescriptor) -> Self {
        MessageHeader { port, payload_size: len as u32, rdma, ..Self::base(MessageKind::LongData, src_node, dst_node) }
    }

    /// Header for a user RDMA write or read.
    pub fn rdma(kind: MessageKind, src_node: NodeId, dst_node: NodeId, rdma: RdmaDescriptor) -> Self {
        debug_assert!(matches!(kind, MessageKind::RdmaWrite | MessageKind::RdmaRead));
        MessageHeader { payload_size: rdma.size, rdma, ..Self::base(kind, src_node, dst_node) }
    }

    /// Acknowledgement of `request`, sent by `responder`.
    pub fn ack_for(request: &MessageHeader, responder: NodeId, error: bool) -> Self {
        MessageHeader {
            port: request.port,
            msg_id: request.msg_id,
            error,
            is_ack: true,
            rdma: request.rdma,
            ..Self::base(MessageKind::Ack, responder, request.src_node)
        }
    }

    /// Number of payload bytes carried inline after the descriptor.
    pub fn inline_len(&self) -> usize {
        match self.kind {
            MessageKind::RawData => self.payload_size as usize,
            _ => 0,
        }
    }
}
