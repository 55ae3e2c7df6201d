//! Logical ports and the port binding table.

use std::fmt;

use nicwarp_core::{constants::PORT_COUNT, ErrorKind, Result};
use parking_lot::Mutex;
use tracing::debug;

/// A validated port number in `0..=6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Port(u8);

impl Port {
    /// Validates a port number.
    pub fn new(port: u8) -> Result<Self> {
        if (port as usize) < PORT_COUNT {
            Ok(Port(port))
        } else {
            Err(ErrorKind::InvalidPort(port))
        }
    }

    /// Port number.
    pub fn get(self) -> u8 {
        self.0
    }

    /// Port number as an index into per-port tables.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Every port, lowest first.
    pub fn all() -> impl Iterator<Item = Port> {
        (0..PORT_COUNT as u8).map(Port)
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Port requested by `bind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSelector {
    /// Lowest free port.
    Any,
    /// A specific port number.
    Exact(u8),
}

impl From<u8> for PortSelector {
    fn from(port: u8) -> Self {
        PortSelector::Exact(port)
    }
}

/// Message transports that multiplex over ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Small inline messages.
    Raw,
    /// Bulk messages over RDMA.
    Long,
}

impl Transport {
    fn index(self) -> usize {
        match self {
            Transport::Raw => 0,
            Transport::Long => 1,
        }
    }
}

/// Identity of a port consumer.
pub type OwnerId = u64;

#[derive(Debug, Default, Clone, Copy)]
struct BindingSet {
    mask: u8,
    owners: [Option<OwnerId>; PORT_COUNT],
}

impl BindingSet {
    fn port_of(&self, owner: OwnerId) -> Option<Port> {
        self.owners.iter().position(|o| *o == Some(owner)).map(|i| Port(i as u8))
    }

    fn release(&mut self, port: Port) {
        self.owners[port.index()] = None;
        self.mask &= !(1 << port.get());
    }
}

/// Which consumer holds which port, per transport.
///
/// A port has at most one owner and an owner holds at most one port per
/// transport. Binding again moves the owner's binding.
#[derive(Debug, Default)]
pub struct PortBindings {
    sets: Mutex<[BindingSet; 2]>,
}

impl PortBindings {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `owner` to the selected port, releasing any port it held before.
    ///
    /// If the requested port is taken the previous binding is kept.
    pub fn bind(&self, transport: Transport, owner: OwnerId, selector: PortSelector) -> Result<Port> {
        let mut sets = self.sets.lock();
        let set = &mut sets[transport.index()];
        let previous = set.port_of(owner);

        let port = match selector {
            PortSelector::Exact(number) => {
                let port = Port::new(number)?;
                match set.owners[port.index()] {
                    Some(other) if other != owner => return Err(ErrorKind::PortInUse(number)),
                    _ => port,
                }
            }
            PortSelector::Any => Port::all()
                .find(|p| set.owners[p.index()].map_or(true, |o| o == owner))
                .ok_or(ErrorKind::NoFreePort)?,
        };

        if let Some(previous) = previous {
            set.release(previous);
        }
        set.owners[port.index()] = Some(owner);
        set.mask |= 1 << port.get();
        debug!("{:?} port {} bound by owner {} (previously {:?})", transport, port, owner, previous);
        Ok(port)
    }

    /// Releases the port `owner` holds, if any.
    pub fn unbind(&self, transport: Transport, owner: OwnerId) -> Option<Port> {
        let mut sets = self.sets.lock();
        let set = &mut sets[transport.index()];
        let port = set.port_of(owner)?;
        set.release(port);
        debug!("{:?} port {} released by owner {}", transport, port, owner);
        Some(port)
    }

    /// Port held by `owner`.
    pub fn bound_port(&self, transport: Transport, owner: OwnerId) -> Option<Port> {
        self.sets.lock()[transport.index()].port_of(owner)
    }

    /// Current owner of `port`.
    pub fn owner_of(&self, transport: Transport, port: Port) -> Option<OwnerId> {
        self.sets.lock()[transport.index()].owners[port.index()]
    }

    /// Returns true if `owner` holds `port`.
    pub fn is_bound_by(&self, transport: Transport, port: Port, owner: OwnerId) -> bool {
        self.owner_of(transport, port) == Some(owner)
    }

    /// Bitmask of bound ports.
    pub fn mask(&self, transport: Transport) -> u8 {
        self.sets.lock()[transport.index()].mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_validation() {
        assert_eq!(Port::new(6).map(Port::get), Ok(6));
        assert_eq!(Port::new(7), Err(ErrorKind::InvalidPort(7)));
        assert_eq!(Port::all().count(), PORT_COUNT);
    }

    #[test]
    fn test_bind_exclusive() {
        let table = PortBindings::new();
        assert_eq!(table.bind(Transport::Raw, 1, PortSelector::Exact(3)), Ok(Port(3)));
        assert_eq!(table.bind(Transport::Raw, 2, PortSelector::Exact(3)), Err(ErrorKind::PortInUse(3)));
        // Same port number, other transport.
        assert_eq!(table.bind(Transport::Long, 2, PortSelector::Exact(3)), Ok(Port(3)));
        assert_eq!(table.mask(Transport::Raw), 0b1000);
    }

    #[test]
    fn test_rebind_moves_binding() {
        let table = PortBindings::new();
        table.bind(Transport::Raw, 1, PortSelector::Exact(3)).unwrap();
        assert_eq!(table.bind(Transport::Raw, 1, PortSelector::Exact(5)), Ok(Port(5)));
        assert_eq!(table.owner_of(Transport::Raw, Port(3)), None);
        assert_eq!(table.mask(Transport::Raw), 0b10_0000);

        // Idempotent on the same port.
        assert_eq!(table.bind(Transport::Raw, 1, PortSelector::Exact(5)), Ok(Port(5)));
        assert!(table.is_bound_by(Transport::Raw, Port(5), 1));
    }

    #[test]
    fn test_failed_rebind_keeps_old_port() {
        let table = PortBindings::new();
        table.bind(Transport::Long, 1, PortSelector::Exact(0)).unwrap();
        table.bind(Transport::Long, 2, PortSelector::Exact(1)).unwrap();
        assert!(table.bind(Transport::Long, 1, PortSelector::Exact(1)).is_err());
        assert_eq!(table.bound_port(Transport::Long, 1), Some(Port(0)));
    }

    #[test]
    fn test_bind_any() {
        let table = PortBindings::new();
        for owner in 0..PORT_COUNT as u64 {
            assert_eq!(table.bind(Transport::Raw, owner, PortSelector::Any), Ok(Port(owner as u8)));
        }
        assert_eq!(table.bind(Transport::Raw, 99, PortSelector::Any), Err(ErrorKind::NoFreePort));

        assert_eq!(table.unbind(Transport::Raw, 2), Some(Port(2)));
        assert_eq!(table.unbind(Transport::Raw, 2), None);
        assert_eq!(table.bind(Transport::Raw, 99, PortSelector::Any), Ok(Port(2)));
    }
}
