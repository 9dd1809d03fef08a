//! Struct and implementation of the Node handle exchanged between overlay peers
use std::{
    fmt::{self, Debug, Formatter},
    net::SocketAddr,
};

use crate::common::Id;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Overlay node handle: an overlay key and the transport address it is reachable at.
///
/// Two handles are equal only if both the key and the address are equal.
pub struct Node {
    id: Id,
    address: SocketAddr,
}

impl Node {
    /// Creates a new Node from an id and socket address.
    pub fn new(id: Id, address: SocketAddr) -> Node {
        Node { id, address }
    }

    /// Creates a node with a random Id, useful for testing.
    pub fn random() -> Node {
        Node {
            id: Id::random(),
            address: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }

    /// Creates a node with a random Id and a distinct loopback address derived from `i`.
    pub fn unique(i: usize) -> Node {
        Node::new(
            Id::random(),
            SocketAddr::from(([127, 0, (i >> 8) as u8, i as u8], (i as u16).wrapping_add(1))),
        )
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish()
    }
}
