//! Routing table consulted by senders.
//!
//! The table is populated from outside (topology discovery is not part of
//! nicwarp); transports only read it to decide reachability.

use std::collections::{HashMap, HashSet};

use nicwarp_core::{ErrorKind, NodeId, Result};
use parking_lot::RwLock;
use tracing::debug;

/// Interface mask per destination node plus the set of direct neighbours.
#[derive(Debug)]
pub struct RoutingTable {
    local: NodeId,
    routes: RwLock<HashMap<NodeId, u8>>,
    neighbours: RwLock<HashSet<NodeId>>,
}

impl RoutingTable {
    /// Creates an empty table for `local`.
    pub fn new(local: NodeId) -> Self {
        RoutingTable { local, routes: RwLock::new(HashMap::new()), neighbours: RwLock::new(HashSet::new()) }
    }

    /// Interface mask for `node`; zero means no route.
    pub fn get(&self, node: NodeId) -> u8 {
        self.routes.read().get(&node).copied().unwrap_or(0)
    }

    /// Sets the interface mask for `node`. A zero mask removes the route.
    pub fn set(&self, node: NodeId, mask: u8) {
        debug!("route to node {} set to {:#010b}", node, mask);
        let mut routes = self.routes.write();
        if mask == 0 {
            routes.remove(&node);
        } else {
            routes.insert(node, mask);
        }
    }

    /// Records `node` as a direct hardware neighbour.
    pub fn add_neighbour(&self, node: NodeId) {
        self.neighbours.write().insert(node);
    }

    /// Returns true if `node` is a direct neighbour.
    pub fn is_neighbour(&self, node: NodeId) -> bool {
        self.neighbours.read().contains(&node)
    }

    /// The local node, direct neighbours and nodes with a route are reachable.
    pub fn is_reachable(&self, node: NodeId) -> bool {
        node == self.local || self.is_neighbour(node) || self.get(node) != 0
    }

    /// Fails with `Unreachable` unless `node` is reachable.
    pub fn ensure_reachable(&self, node: NodeId) -> Result<()> {
        if self.is_reachable(node) {
            Ok(())
        } else {
            Err(ErrorKind::Unreachable(node))
        }
    }
}
