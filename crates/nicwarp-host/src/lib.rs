#![warn(missing_docs)]

//! nicwarp-host: the runtime around the transports.
//!
//! A [`Device`] is the explicit shared handle for one node: it builds the
//! transports on a pair of hardware rings, runs one worker thread per ring and
//! hands out [`Endpoint`]s to consumers. [`LoopbackFabric`] provides the rings
//! in-process, connecting any number of devices.

/// Device context and consumer endpoints.
pub mod device;
/// In-process interconnect fabric.
pub mod loopback;

mod worker;

pub use device::{Device, DeviceParts, Endpoint};
pub use loopback::{LoopbackFabric, LoopbackRing};
