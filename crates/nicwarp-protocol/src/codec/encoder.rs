//! Descriptor encoding.

use byteorder::{BigEndian, ByteOrder};

use super::{checksum::frame_checksum, CHECKSUM_SIZE, DESCRIPTOR_SIZE, FLAG_ACK, FLAG_ERROR};
use crate::header::MessageHeader;

/// Serializes headers into hardware descriptors.
pub struct DescriptorEncoder;

impl DescriptorEncoder {
    /// Encodes the fixed-size descriptor for `header`.
    pub fn encode_descriptor(header: &MessageHeader) -> [u8; DESCRIPTOR_SIZE] {
        let mut out = [0u8; DESCRIPTOR_SIZE];
        out[0] = header.kind.to_u8();
        out[1] = Self::flags(header);
        out[2] = header.port;
        BigEndian::write_u16(&mut out[4..6], header.src_node);
        BigEndian::write_u16(&mut out[6..8], header.dst_node);
        BigEndian::write_u16(&mut out[8..10], header.msg_id);
        BigEndian::write_u32(&mut out[12..16], header.payload_size);
        BigEndian::write_u64(&mut out[16..24], header.rdma.local_addr);
        BigEndian::write_u64(&mut out[24..32], header.rdma.remote_addr);
        BigEndian::write_u32(&mut out[32..36], header.rdma.size);
        out
    }

    /// Encodes a full frame: descriptor, optional checksum, then the inline payload.
    pub fn encode_frame(header: &MessageHeader, payload: &[u8], with_checksum: bool) -> Vec<u8> {
        let descriptor = Self::encode_descriptor(header);
        let extra = if with_checksum { CHECKSUM_SIZE } else { 0 };

        let mut frame = Vec::with_capacity(DESCRIPTOR_SIZE + extra + payload.len());
        frame.extend_from_slice(&descriptor);
        if with_checksum {
            frame.extend_from_slice(&frame_checksum(&descriptor, payload).to_be_bytes());
        }
        frame.extend_from_slice(payload);
        frame
    }

    fn flags(header: &MessageHeader) -> u8 {
        let mut flags = 0;
        if header.error {
            flags |= FLAG_ERROR;
        }
        if header.is_ack {
            flags |= FLAG_ACK;
        }
        flags
    }
}
