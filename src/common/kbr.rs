//! The routing capability lookups depend on, implemented per overlay.

use std::net::SocketAddr;

use crate::common::{
    FindNodeRequestArguments, FindNodeResponseArguments, Id, Node, RoutingTable,
};

/// Key based routing: what an overlay exposes to drive an iterative lookup, and to
/// answer other nodes' lookups.
pub trait KeyBasedRouting {
    /// The local node.
    fn local_node(&self) -> Node;

    /// Largest number of siblings this overlay can answer for.
    fn max_siblings(&self) -> usize;

    /// Up to `want` known nodes closest to `target`, closest first.
    fn closest_nodes(&self, target: &Id, want: usize, exclude_self: bool) -> Vec<Node>;

    /// Whether `node` is among the `num_siblings` closest nodes to `target`,
    /// `None` if that can not be decided locally.
    fn is_sibling_for(&self, node: &Node, target: &Id, num_siblings: usize) -> Option<bool>;

    fn bucket_index(&self, key: &Id, first_on_layer: bool) -> Option<usize>;

    /// Forget the node at `failed`, returns `true` if routing through the local
    /// node is still worth trying.
    fn handle_failed_node(&mut self, _failed: SocketAddr) -> bool {
        true
    }

    /// Answer a find node request from another node.
    fn find_node(&self, request: &FindNodeRequestArguments) -> FindNodeResponseArguments {
        let local = self.local_node();

        let is_sibling = !request.exhaustive
            && self.is_sibling_for(&local, &request.target, request.num_siblings) == Some(true);

        let want = if is_sibling {
            request.num_siblings.max(1)
        } else {
            request.num_redundant
        };

        FindNodeResponseArguments {
            closest_nodes: self.closest_nodes(&request.target, want, false),
            siblings: is_sibling,
        }
    }
}

impl KeyBasedRouting for RoutingTable {
    fn local_node(&self) -> Node {
        *RoutingTable::local_node(self)
    }

    fn max_siblings(&self) -> usize {
        RoutingTable::max_siblings(self)
    }

    fn closest_nodes(&self, target: &Id, want: usize, exclude_self: bool) -> Vec<Node> {
        RoutingTable::closest_nodes(self, target, want, exclude_self)
    }

    fn is_sibling_for(&self, node: &Node, target: &Id, num_siblings: usize) -> Option<bool> {
        RoutingTable::is_sibling_for(self, node, target, num_siblings)
    }

    fn bucket_index(&self, key: &Id, first_on_layer: bool) -> Option<usize> {
        RoutingTable::bucket_index(self, key, first_on_layer)
    }

    fn handle_failed_node(&mut self, failed: SocketAddr) -> bool {
        RoutingTable::handle_failed_node(self, failed)
    }
}
