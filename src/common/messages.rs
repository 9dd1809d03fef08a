//! Remote calls exchanged by overlay nodes, independent of any wire format.

use std::net::SocketAddr;

use crate::common::{Id, Node};

/// Identifies one outstanding remote call, assigned by the transport.
pub type RequestId = u32;

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum RequestSpecific {
    Ping,
    FindNode(FindNodeRequestArguments),
    /// Tell the receiver that a node it routed us to did not answer.
    FailedNode { failed: SocketAddr },
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ResponseSpecific {
    Ping,
    FindNode(FindNodeResponseArguments),
    FailedNode {
        /// The receiver still has siblings, and can be asked again.
        try_again: bool,
    },
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct FindNodeRequestArguments {
    pub target: Id,
    /// Number of next hop candidates wanted.
    pub num_redundant: usize,
    /// Number of siblings of `target` wanted, `0` asks for the node with the exact key.
    pub num_siblings: usize,
    /// Return the closest nodes only, without judging siblings.
    pub exhaustive: bool,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FindNodeResponseArguments {
    /// Closest known nodes to the target, closest first.
    pub closest_nodes: Vec<Node>,
    /// The responder is one of the requested siblings of the target, and so are
    /// the `closest_nodes` it returned.
    pub siblings: bool,
}
