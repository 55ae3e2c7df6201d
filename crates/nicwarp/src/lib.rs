#![warn(missing_docs)]

//! nicwarp: message queues and reliable RDMA delivery for a custom
//! interconnect NIC.
//!
//! This crate re-exports the surface most programs need:
//!
//! - Devices and endpoints (`Device`, `Endpoint`, `LoopbackFabric`)
//! - Ports and transports (`Transport`, `PortSelector`, `Port`)
//! - RDMA completion (`Completion`, `SendOutcome`, `RdmaToken`, `TokenState`)
//! - Core configuration and errors (`Config`, `ErrorKind`)
//!
//! Example
//! ```no_run
//! use nicwarp::prelude::*;
//!
//! let fabric = LoopbackFabric::new();
//! let device = fabric.attach(Config::for_node(1)).unwrap();
//! let endpoint = device.open().unwrap();
//! endpoint.bind(Transport::Raw, PortSelector::Exact(3), false).unwrap();
//!
//! // RAW message to ourselves
//! endpoint.send(Transport::Raw, 1, 3, b"hello").unwrap();
//! let (src, payload) = endpoint.recv(Transport::Raw, 3).unwrap();
//! assert_eq!((src, payload.as_slice()), (1, &b"hello"[..]));
//! ```

// Core config, errors and counters
pub use nicwarp_core::{
    CancelToken, Config, ErrorKind, NodeId, Result, StatisticsSnapshot, TransportCounters, WaitMode,
};
// Host: devices, endpoints and the loopback fabric
pub use nicwarp_host::{Device, DeviceParts, Endpoint, LoopbackFabric};
// Protocol: ports, transports and hardware rings
pub use nicwarp_protocol::{HwRing, Port, PortSelector, RoutingTable, Transport};
// Transport: RDMA completion
pub use nicwarp_transport::{Completion, RdmaCompletion, RdmaToken, SendOutcome, TokenState};

/// Convenience prelude with the most commonly used items.
pub mod prelude {
    pub use crate::{
        Completion, Config, Device, Endpoint, ErrorKind, LoopbackFabric, NodeId, PortSelector, SendOutcome,
        TokenState, Transport,
    };
}
