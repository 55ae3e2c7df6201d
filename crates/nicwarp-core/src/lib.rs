#![warn(missing_docs)]

//! nicwarp-core: foundational types shared by every nicwarp layer.
//!
//! This crate provides the minimal set of building blocks the transports sit on:
//! - Configuration types
//! - Error handling
//! - Protocol constants
//! - The fixed-capacity slot arena behind every software queue
//! - Cumulative statistics counters
//! - Blocking, non-blocking and cancellable waits
//!
//! Wire and hardware concerns live in `nicwarp-protocol`, the transports in
//! `nicwarp-transport` and the device/worker runtime in `nicwarp-host`.

/// Protocol constants shared across layers.
pub mod constants {
    /// Number of logical ports per transport (ports `0..=6`).
    pub const PORT_COUNT: usize = 7;
    /// Largest RAW payload carried inline in a hardware descriptor.
    pub const RAW_MAX_PAYLOAD: usize = 248;
    /// Size of one LONG buffer in the RDMA zone.
    pub const LONG_BUFFER_SIZE: usize = 65536;
    /// Bytes at the start of every LONG buffer reserved for the buffer header.
    pub const LONG_BUFFER_HEADER_SIZE: usize = 8;
    /// Largest LONG payload.
    ///
    /// One LONG buffer minus its buffer header: 65528 = 65536 - 8.
    pub const LONG_MAX_PAYLOAD: usize = LONG_BUFFER_SIZE - LONG_BUFFER_HEADER_SIZE;
    /// Default number of in-flight RDMA request records (one per hardware message id).
    pub const DEFAULT_RDMA_RECORDS: usize = 256;
    /// Remote-error acknowledgements tolerated before a request is completed anyway.
    pub const RDMA_MAX_RETRIES: u32 = 100;
    /// Default number of LONG buffers on each side (TX and RX).
    pub const DEFAULT_LONG_BUFFERS: usize = 32;
}

/// Slot arena with one free list and named FIFO queues.
pub mod arena;
/// Configuration options for devices and transports.
pub mod config;
/// Error types and results.
pub mod error;
/// Cumulative, concurrently readable counters.
pub mod statistics;
/// Blocking waits with non-blocking and cancellation support.
pub mod wait;

pub use arena::{QueueId, SlotArena, SlotId};
pub use config::Config;
pub use error::{DecodingErrorKind, ErrorKind, ProtocolErrorKind, Result};
pub use statistics::{DiscardCause, Statistics, StatisticsSnapshot, TransportCounters, TransportStatistics};
pub use wait::{CancelToken, WaitMode, Waiter};

/// Identifier of a node on the interconnect.
pub type NodeId = u16;
