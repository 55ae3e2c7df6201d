//! Hardware descriptor encoding and decoding.
//!
//! Every frame crossing a hardware ring is a fixed-size big-endian descriptor,
//! optionally followed by a CRC-32, then the inline payload:
//!
//! ```text
//! 0      1      2      3      4        6        8        10       12
//! +------+------+------+------+--------+--------+--------+--------+
//! | kind | flags| port | rsvd | src    | dst    | msg_id | rsvd   |
//! +------+------+------+------+--------+--------+--------+--------+
//! 12             16                      24                      32           36
//! | payload_size | local_addr            | remote_addr           | rdma_size  |
//! ```
//!
//! - [`encoder`] - descriptor and frame encoding
//! - [`decoder`] - validating frame decoding
//! - [`checksum`] - CRC-32 over descriptor and payload

pub mod checksum;
pub mod decoder;
pub mod encoder;


pub use decoder::DescriptorDecoder;
pub use encoder::DescriptorEncoder;

/// Size of an encoded descriptor.
pub const DESCRIPTOR_SIZE: usize = 36;
/// Size of the optional checksum.
pub const CHECKSUM_SIZE: usize = 4;

/// Flag bit: remote side reported an error.
pub(crate) const FLAG_ERROR: u8 = 0b01;
/// Flag bit: descriptor is an acknowledgement.
pub(crate) const FLAG_ACK: u8 = 0b10;
