use std::{default::Default, time::Duration};

use crate::{
    constants::{DEFAULT_LONG_BUFFERS, DEFAULT_RDMA_RECORDS, LONG_BUFFER_SIZE, RDMA_MAX_RETRIES},
    error::{ErrorKind, Result},
    NodeId,
};

#[derive(Clone, Debug)]
/// Configuration options for a device and its transports.
pub struct Config {
    /// Identifier of the local node on the interconnect.
    pub node_id: NodeId,
    /// Default mode for new endpoints: block when true, return `WouldBlock` otherwise.
    pub blocking_mode: bool,
    /// Slots in the shared RAW receive arena (all ports together).
    pub raw_rx_slots: usize,
    /// Slots in the shared LONG receive arena (all ports together).
    pub long_rx_slots: usize,
    /// LONG transmit buffers in the local RDMA zone.
    pub long_tx_buffers: usize,
    /// LONG receive buffers in the local RDMA zone.
    pub long_rx_buffers: usize,
    /// In-flight RDMA request records. Also the size of the hardware message id space.
    pub rdma_records: usize,
    /// Remote-error acknowledgements retried before a request is completed with error.
    pub rdma_max_retries: u32,
    /// Minimum time between a remote-error acknowledgement and the resend it triggers.
    pub rdma_retry_delay: Duration,
    /// Descriptors the RAW hardware ring holds in flight.
    pub raw_ring_depth: usize,
    /// Descriptors the RDMA hardware ring holds in flight.
    pub rdma_ring_depth: usize,
    /// Hardware address of the first LONG receive buffer.
    pub rdma_zone_base: u64,
    /// Bytes of RDMA memory available to user `rdma_write`/`rdma_read` after the LONG buffers.
    pub user_rdma_bytes: usize,
    /// Period of the worker watchdog that covers missed or coalesced interrupts.
    pub watchdog_interval: Duration,
    /// Append a CRC-32 to every hardware descriptor and verify it on receipt.
    pub use_checksums: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: 0,
            blocking_mode: true,
            raw_rx_slots: 256,
            long_rx_slots: 64,
            long_tx_buffers: DEFAULT_LONG_BUFFERS,
            long_rx_buffers: DEFAULT_LONG_BUFFERS,
            rdma_records: DEFAULT_RDMA_RECORDS,
            rdma_max_retries: RDMA_MAX_RETRIES,
            rdma_retry_delay: Duration::from_millis(1),
            raw_ring_depth: 64,
            rdma_ring_depth: 64,
            rdma_zone_base: 0x1000_0000,
            user_rdma_bytes: 1024 * 1024, // 1 MiB
            watchdog_interval: Duration::from_millis(20),
            use_checksums: false,
        }
    }
}

impl Config {
    /// Returns a default configuration for `node_id`.
    pub fn for_node(node_id: NodeId) -> Self {
        Self { node_id, ..Self::default() }
    }

    /// Checks the configuration for values the transports cannot work with.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("raw_rx_slots", self.raw_rx_slots),
            ("long_rx_slots", self.long_rx_slots),
            ("long_tx_buffers", self.long_tx_buffers),
            ("long_rx_buffers", self.long_rx_buffers),
            ("rdma_records", self.rdma_records),
            ("raw_ring_depth", self.raw_ring_depth),
            ("rdma_ring_depth", self.rdma_ring_depth),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(ErrorKind::InvalidConfig(format!("{} must be non-zero", name)));
        }
        if self.rdma_records > u16::MAX as usize + 1 {
            return Err(ErrorKind::InvalidConfig(format!(
                "rdma_records {} exceeds the 16-bit message id space",
                self.rdma_records
            )));
        }
        if self.watchdog_interval.is_zero() {
            return Err(ErrorKind::InvalidConfig("watchdog_interval must be non-zero".into()));
        }
        Ok(())
    }

    /// Total bytes of RDMA memory a node with this configuration exposes.
    pub fn rdma_zone_len(&self) -> usize {
        (self.long_rx_buffers + self.long_tx_buffers) * LONG_BUFFER_SIZE + self.user_rdma_bytes
    }
}
