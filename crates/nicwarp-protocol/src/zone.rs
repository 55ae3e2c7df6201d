//! RDMA memory zone of one node.
//!
//! The zone is a single byte-addressable region starting at `rdma_zone_base`:
//!
//! ```text
//! [ LONG RX buffer 0 .. n ][ LONG TX buffer 0 .. n ][ user region ]
//! ```
//!
//! Every LONG buffer is `LONG_BUFFER_SIZE` bytes and starts with a
//! [`LongBufferHeader`]. Receive buffers are tracked by a [`LongBufferTable`]
//! that maps incoming destination addresses back to buffer ids and records
//! which buffers are armed (free for the hardware to write into).

use byteorder::{BigEndian, ByteOrder};
use nicwarp_core::{
    constants::{LONG_BUFFER_HEADER_SIZE, LONG_BUFFER_SIZE, LONG_MAX_PAYLOAD, PORT_COUNT},
    Config, ProtocolErrorKind,
};
use parking_lot::Mutex;

/// Addresses of the regions inside a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneLayout {
    /// First byte of the zone.
    pub base: u64,
    /// LONG receive buffers.
    pub rx_buffers: usize,
    /// LONG transmit buffers.
    pub tx_buffers: usize,
    /// Bytes in the user region.
    pub user_bytes: usize,
}

impl ZoneLayout {
    /// Layout described by a configuration.
    pub fn from_config(config: &Config) -> Self {
        ZoneLayout {
            base: config.rdma_zone_base,
            rx_buffers: config.long_rx_buffers,
            tx_buffers: config.long_tx_buffers,
            user_bytes: config.user_rdma_bytes,
        }
    }

    /// Address of LONG receive buffer `index`.
    pub fn rx_buffer_addr(&self, index: usize) -> u64 {
        self.base + (index * LONG_BUFFER_SIZE) as u64
    }

    /// Address of LONG transmit buffer `index`.
    pub fn tx_buffer_addr(&self, index: usize) -> u64 {
        self.base + ((self.rx_buffers + index) * LONG_BUFFER_SIZE) as u64
    }

    /// First address of the user region.
    pub fn user_base(&self) -> u64 {
        self.base + ((self.rx_buffers + self.tx_buffers) * LONG_BUFFER_SIZE) as u64
    }

    /// Total zone size in bytes.
    pub fn len(&self) -> usize {
        (self.rx_buffers + self.tx_buffers) * LONG_BUFFER_SIZE + self.user_bytes
    }

    /// Returns true if the zone has no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Byte-addressable memory backing a zone.
pub struct RdmaMemory {
    base: u64,
    bytes: Mutex<Box<[u8]>>,
}

impl RdmaMemory {
    /// Allocates zeroed memory for `layout`.
    pub fn new(layout: &ZoneLayout) -> Self {
        RdmaMemory { base: layout.base, bytes: Mutex::new(vec![0u8; layout.len()].into_boxed_slice()) }
    }

    fn offset(&self, addr: u64, len: usize, total: usize) -> Result<usize, ProtocolErrorKind> {
        let start = addr.checked_sub(self.base).ok_or(ProtocolErrorKind::AddressOutOfRange(addr))?;
        let end = start.checked_add(len as u64).ok_or(ProtocolErrorKind::AddressOutOfRange(addr))?;
        if end > total as u64 {
            return Err(ProtocolErrorKind::AddressOutOfRange(addr));
        }
        Ok(start as usize)
    }

    /// Copies `len` bytes starting at `addr`.
    pub fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>, ProtocolErrorKind> {
        let bytes = self.bytes.lock();
        let start = self.offset(addr, len, bytes.len())?;
        Ok(bytes[start..start + len].to_vec())
    }

    /// Copies `data` to `addr`.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), ProtocolErrorKind> {
        let mut bytes = self.bytes.lock();
        let start = self.offset(addr, data.len(), bytes.len())?;
        bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

const BUFFER_MAGIC: u16 = 0x4e57;

/// Header at the start of every LONG buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongBufferHeader {
    /// Destination port.
    pub port: u8,
    /// Payload bytes following the header.
    pub length: u32,
}

impl LongBufferHeader {
    /// Serializes the header.
    pub fn encode(&self) -> [u8; LONG_BUFFER_HEADER_SIZE] {
        let mut out = [0u8; LONG_BUFFER_HEADER_SIZE];
        BigEndian::write_u16(&mut out[0..2], BUFFER_MAGIC);
        out[2] = self.port;
        BigEndian::write_u32(&mut out[4..8], self.length);
        out
    }

    /// Parses and validates a header.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolErrorKind> {
        if bytes.len() < LONG_BUFFER_HEADER_SIZE || BigEndian::read_u16(&bytes[0..2]) != BUFFER_MAGIC {
            return Err(ProtocolErrorKind::BufferHeader);
        }
        let header = LongBufferHeader { port: bytes[2], length: BigEndian::read_u32(&bytes[4..8]) };
        if header.port as usize >= PORT_COUNT || header.length as usize > LONG_MAX_PAYLOAD {
            return Err(ProtocolErrorKind::BufferHeader);
        }
        Ok(header)
    }
}

/// Receive-side descriptor of one LONG buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongBufferDescriptor {
    /// Buffer index.
    pub buf_id: usize,
    /// Address of the buffer in the zone.
    pub hw_address: u64,
    /// Buffer size in bytes.
    pub size: usize,
    /// Armed: the hardware may write into it.
    pub free: bool,
}

/// Table of LONG receive buffers.
pub struct LongBufferTable {
    base: u64,
    entries: Mutex<Vec<LongBufferDescriptor>>,
}

impl LongBufferTable {
    /// Creates the table for `layout` with every buffer armed.
    pub fn new(layout: &ZoneLayout) -> Self {
        let entries = (0..layout.rx_buffers)
            .map(|buf_id| LongBufferDescriptor {
                buf_id,
                hw_address: layout.rx_buffer_addr(buf_id),
                size: LONG_BUFFER_SIZE,
                free: true,
            })
            .collect();
        LongBufferTable { base: layout.base, entries: Mutex::new(entries) }
    }

    fn index_of(&self, addr: u64, len: usize) -> Result<usize, ProtocolErrorKind> {
        let offset = addr.checked_sub(self.base).ok_or(ProtocolErrorKind::AddressOutOfRange(addr))?;
        if offset % LONG_BUFFER_SIZE as u64 != 0 {
            return Err(ProtocolErrorKind::AddressOutOfRange(addr));
        }
        let index = offset / LONG_BUFFER_SIZE as u64;
        if index >= len as u64 {
            return Err(ProtocolErrorKind::AddressOutOfRange(addr));
        }
        Ok(index as usize)
    }

    /// Maps an incoming destination address to its buffer descriptor.
    pub fn resolve(&self, addr: u64) -> Result<LongBufferDescriptor, ProtocolErrorKind> {
        let entries = self.entries.lock();
        let index = self.index_of(addr, entries.len())?;
        Ok(entries[index])
    }

    /// Hardware side: takes the lowest armed buffer for an incoming write.
    ///
    /// Returns `None` when every buffer still holds an unread message.
    pub fn claim_armed(&self) -> Option<LongBufferDescriptor> {
        let mut entries = self.entries.lock();
        let entry = entries.iter_mut().find(|e| e.free)?;
        entry.free = false;
        Some(*entry)
    }

    /// Re-arms buffer `buf_id` so the hardware may write into it again.
    pub fn arm(&self, buf_id: usize) {
        if let Some(entry) = self.entries.lock().get_mut(buf_id) {
            entry.free = true;
        }
    }

    /// Number of armed buffers.
    pub fn armed(&self) -> usize {
        self.entries.lock().iter().filter(|e| e.free).count()
    }

    /// Number of buffers.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if there are no receive buffers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A node's RDMA zone: layout, memory and LONG receive buffer table.
pub struct RdmaZone {
    /// Region addresses.
    pub layout: ZoneLayout,
    /// Backing memory.
    pub memory: RdmaMemory,
    /// LONG receive buffers.
    pub rx_buffers: LongBufferTable,
}

impl RdmaZone {
    /// Creates a zone with zeroed memory and every receive buffer armed.
    pub fn new(layout: ZoneLayout) -> Self {
        RdmaZone { memory: RdmaMemory::new(&layout), rx_buffers: LongBufferTable::new(&layout), layout }
    }

    /// Returns an error unless `[addr, addr + len)` lies in the user region.
    pub fn check_user_range(&self, addr: u64, len: usize) -> Result<(), ProtocolErrorKind> {
        let user = self.layout.user_base();
        let end = user + self.layout.user_bytes as u64;
        match addr.checked_add(len as u64) {
            Some(stop) if addr >= user && stop <= end => Ok(()),
            _ => Err(ProtocolErrorKind::AddressOutOfRange(addr)),
        }
    }
}
