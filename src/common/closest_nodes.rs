use std::vec::IntoIter;

use crate::common::{Id, Node};

#[derive(Debug, Clone)]
/// Capacity bounded set of nodes, sorted by their distance to a target.
///
/// Nodes are unique by [Id]; once full, a node is only accepted if it is
/// at least as close to the target as the current farthest node, which is then dropped.
pub struct ClosestNodes {
    target: Id,
    capacity: usize,
    nodes: Vec<Node>,
}

impl ClosestNodes {
    pub fn new(target: Id, capacity: usize) -> Self {
        Self {
            target,
            capacity,
            nodes: Vec::with_capacity(capacity.min(64)),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.nodes.len() >= self.capacity
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.position(id).is_some()
    }

    /// Returns `true` if [Self::add] would not reject this node for being too far.
    pub fn is_addable(&self, node: &Node) -> bool {
        if self.capacity == 0 {
            return false;
        }

        match self.nodes.last() {
            Some(last) if self.is_full() => !self.target.closer(last.id(), node.id()),
            _ => true,
        }
    }

    // === Public Methods ===

    /// Insert a node at its sorted position, and return that position.
    ///
    /// Returns `None` if a node with the same [Id] is already present, or the set
    /// is full of closer nodes.
    pub fn add(&mut self, node: Node) -> Option<usize> {
        if !self.is_addable(&node) {
            return None;
        }

        let target = self.target;

        match self
            .nodes
            .binary_search_by(|probe| target.cmp_distance(probe.id(), node.id()))
        {
            Ok(_) => None,
            Err(pos) => {
                self.nodes.insert(pos, node);
                self.nodes.truncate(self.capacity);

                Some(pos)
            }
        }
    }

    pub fn remove(&mut self, id: &Id) -> Option<Node> {
        self.position(id).map(|pos| self.nodes.remove(pos))
    }

    pub fn clear(&mut self) {
        self.nodes.clear()
    }

    pub fn to_vec(&self) -> Vec<Node> {
        self.nodes.clone()
    }

    // === Private Methods ===

    fn position(&self, id: &Id) -> Option<usize> {
        let target = self.target;

        self.nodes
            .binary_search_by(|probe| target.cmp_distance(probe.id(), id))
            .ok()
    }
}

impl IntoIterator for ClosestNodes {
    type Item = Node;
    type IntoIter = IntoIter<Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.into_iter()
    }
}

impl<'a> IntoIterator for &'a ClosestNodes {
    type Item = &'a Node;
    type IntoIter = std::slice::Iter<'a, Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add() {
        let target = Id::random();

        let mut closest_nodes = ClosestNodes::new(target, 20);

        for _ in 0..10 {
            let node = Node::random();
            closest_nodes.add(node);
            assert_eq!(closest_nodes.add(node), None);
        }

        assert_eq!(closest_nodes.nodes().len(), 10);

        let distances = closest_nodes
            .nodes()
            .iter()
            .map(|n| n.id().xor(&target))
            .collect::<Vec<_>>();

        let mut sorted = distances.clone();
        sorted.sort();

        assert_eq!(sorted, distances);
    }

    #[test]
    fn keeps_only_the_closest() {
        let target = Id::random();
        let mut closest_nodes = ClosestNodes::new(target, 5);

        let mut all = (0..50).map(|_| Node::random()).collect::<Vec<_>>();

        for node in &all {
            closest_nodes.add(*node);
        }

        all.sort_by(|a, b| target.cmp_distance(a.id(), b.id()));

        assert!(closest_nodes.is_full());
        assert_eq!(closest_nodes.nodes(), &all[..5]);

        // The farthest of all can not get in anymore.
        assert!(!closest_nodes.is_addable(&all[49]));
        assert_eq!(closest_nodes.add(all[49]), None);
    }

    #[test]
    fn remove() {
        let target = Id::random();
        let mut closest_nodes = ClosestNodes::new(target, 5);

        let node = Node::random();
        closest_nodes.add(node);
        assert!(closest_nodes.contains(node.id()));

        assert_eq!(closest_nodes.remove(node.id()), Some(node));
        assert!(closest_nodes.is_empty());
    }
}
