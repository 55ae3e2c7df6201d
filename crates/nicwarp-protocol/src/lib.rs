#![warn(missing_docs)]

//! nicwarp-protocol: message headers, hardware descriptors and the hardware-facing
//! tables the transports sit on.

/// Descriptor encoding and decoding.
pub mod codec;
/// Logical message header.
pub mod header;
/// Logical ports and the port binding table.
pub mod port;
/// Hardware ring adapter interface.
pub mod ring;
/// Routing table consulted for reachability.
pub mod routing;
/// RDMA memory zone and LONG buffer table.
pub mod zone;

pub use codec::{DescriptorDecoder, DescriptorEncoder};
pub use header::{MessageHeader, MessageKind, RdmaDescriptor};
pub use port::{OwnerId, Port, PortBindings, PortSelector, Transport};
pub use ring::{EventSink, HwRing, RingEvent, RingKind, RxFrame};
pub use routing::RoutingTable;
pub use zone::{LongBufferDescriptor, LongBufferHeader, LongBufferTable, RdmaMemory, RdmaZone, ZoneLayout};
