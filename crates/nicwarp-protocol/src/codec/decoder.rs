//! Validating descriptor decoding.
//!
//! A frame that fails any check is rejected as a whole. The receive path counts
//! it as a malformed discard; nothing in it is trusted.

use std::convert::TryFrom;

use byteorder::{BigEndian, ByteOrder};
use nicwarp_core::DecodingErrorKind;

use super::{checksum::frame_checksum, CHECKSUM_SIZE, DESCRIPTOR_SIZE, FLAG_ACK, FLAG_ERROR};
use crate::header::{MessageHeader, MessageKind, RdmaDescriptor};

/// Deserializes hardware frames.
pub struct DescriptorDecoder;

impl DescriptorDecoder {
    /// Decodes a fixed-size descriptor.
    pub fn decode_descriptor(bytes: &[u8]) -> Result<MessageHeader, DecodingErrorKind> {
        if bytes.len() < DESCRIPTOR_SIZE {
            return Err(DecodingErrorKind::Truncated);
        }
        let kind = MessageKind::try_from(bytes[0])?;
        let flags = bytes[1];
        if flags & !(FLAG_ERROR | FLAG_ACK) != 0 {
            return Err(DecodingErrorKind::Flags(flags));
        }

        Ok(MessageHeader {
            kind,
            port: bytes[2],
            src_node: BigEndian::read_u16(&bytes[4..6]),
            dst_node: BigEndian::read_u16(&bytes[6..8]),
            msg_id: BigEndian::read_u16(&bytes[8..10]),
            payload_size: BigEndian::read_u32(&bytes[12..16]),
            error: flags & FLAG_ERROR != 0,
            is_ack: flags & FLAG_ACK != 0,
            rdma: RdmaDescriptor {
                local_addr: BigEndian::read_u64(&bytes[16..24]),
                remote_addr: BigEndian::read_u64(&bytes[24..32]),
                size: BigEndian::read_u32(&bytes[32..36]),
            },
        })
    }

    /// Decodes a full frame produced by `DescriptorEncoder::encode_frame`.
    pub fn decode_frame(frame: &[u8], with_checksum: bool) -> Result<(MessageHeader, Vec<u8>), DecodingErrorKind> {
        let header = Self::decode_descriptor(frame)?;
        let (descriptor, rest) = frame.split_at(DESCRIPTOR_SIZE);

        let payload = if with_checksum {
            if rest.len() < CHECKSUM_SIZE {
                return Err(DecodingErrorKind::Truncated);
            }
            let (sum, payload) = rest.split_at(CHECKSUM_SIZE);
            if BigEndian::read_u32(sum) != frame_checksum(descriptor, payload) {
                return Err(DecodingErrorKind::Checksum);
            }
            payload
        } else {
            rest
        };

        if payload.len() != header.inline_len() {
            return Err(DecodingErrorKind::PayloadLength { declared: header.payload_size, actual: payload.len() });
        }
        Ok((header, payload.to_vec()))
    }
}
