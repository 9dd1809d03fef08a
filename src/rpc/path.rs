//! A single path of an iterative lookup.

use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::{debug, trace};

use crate::common::{FindNodeResponseArguments, Id, KeyBasedRouting, Node};

use super::iterative_query::LookupState;
use super::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Candidate {
    pub node: Node,
    /// The node that suggested this candidate, `None` for the local routing table.
    pub source: Option<Node>,
    pub already_used: bool,
}

/// Next hop candidates of a path, sorted by distance to the target.
#[derive(Debug, Clone)]
pub(crate) struct CandidateList {
    target: Id,
    capacity: usize,
    merge: bool,
    entries: Vec<Candidate>,
}

impl CandidateList {
    pub fn new(target: Id, capacity: usize, merge: bool) -> Self {
        Self {
            target,
            capacity,
            merge,
            entries: Vec::with_capacity(capacity.min(64)),
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Candidate> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Candidate> {
        self.entries.iter_mut()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.entries.iter().any(|c| c.node.id() == id)
    }

    /// Add a candidate at its sorted position and return that position.
    ///
    /// Without merging, candidates are appended in the order they were offered,
    /// until the list is full.
    pub fn add(&mut self, node: Node, source: Option<Node>) -> Option<usize> {
        if self.contains(node.id()) {
            return None;
        }

        let candidate = Candidate {
            node,
            source,
            already_used: false,
        };

        if !self.merge {
            if self.entries.len() >= self.capacity {
                return None;
            }

            self.entries.push(candidate);
            return Some(self.entries.len() - 1);
        }

        let target = self.target;
        let pos = self
            .entries
            .partition_point(|c| target.closer(c.node.id(), node.id()));

        if pos >= self.capacity {
            return None;
        }

        self.entries.insert(pos, candidate);
        self.entries.truncate(self.capacity);

        Some(pos)
    }

    /// Make a known candidate eligible for another request, or add it.
    pub fn retry(&mut self, node: Node, source: Option<Node>) {
        match self.entries.iter_mut().find(|c| c.node.id() == node.id()) {
            Some(candidate) => candidate.already_used = false,
            None => {
                self.add(node, source);
            }
        }
    }

    pub fn remove(&mut self, address: &SocketAddr) {
        self.entries.retain(|c| &c.node.address() != address);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// One independent sequence of requests, converging on the target.
#[derive(Debug)]
pub(crate) struct PathLookup {
    index: usize,
    candidates: CandidateList,
    /// Queried address => the node that suggested it.
    sources: HashMap<SocketAddr, Option<Node>>,
    pending: usize,
    hops: u32,
    step: u32,
    finished: bool,
    success: bool,
}

impl PathLookup {
    pub fn new(index: usize, state: &LookupState) -> Self {
        let config = state.config();

        let capacity = if config.exhaustive {
            config.redundancy * 2
        } else {
            config.redundancy
        };

        Self {
            index,
            candidates: CandidateList::new(state.target(), capacity, config.merge),
            sources: HashMap::new(),
            pending: 0,
            hops: 0,
            step: 0,
            finished: false,
            success: false,
        }
    }

    // === Getters ===

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn hops(&self) -> u32 {
        self.hops
    }

    /// Whether a response to a request sent at `step` should be handled by this path.
    pub fn accepts(&self, step: u32, state: &LookupState) -> bool {
        let config = state.config();

        !self.finished && ((config.use_all_parallel_responses && config.merge) || step == self.step)
    }

    // === Public Methods ===

    /// Seed with a node from the local routing table.
    pub fn add_seed(&mut self, node: Node) {
        self.candidates.add(node, None);
    }

    pub fn finish(&mut self, success: bool) {
        if !self.finished {
            trace!(path = self.index, success, hops = self.hops, "Path finished");
        }

        self.finished = true;
        self.success = success;
    }

    /// Send up to `num` find node requests to the closest unused candidates.
    pub fn send_rpcs(
        &mut self,
        state: &mut LookupState,
        transport: &mut dyn Transport,
        num: usize,
    ) {
        if self.finished {
            return;
        }

        let config = state.config().clone();

        if config.hop_count_max > 0 && self.hops >= config.hop_count_max {
            debug!(path = self.index, hops = self.hops, "Path reached the hop limit");
            self.finish(false);
            return;
        }

        let mut num = num;
        if config.strict_parallel_rpcs {
            num = num.min(config.parallel_rpcs.saturating_sub(self.pending));
        }
        if num == 0 && self.pending == 0 && !config.finish_on_first_unchanged {
            num = config.parallel_rpcs;
        }

        for candidate in self.candidates.iter_mut().take(config.redundancy) {
            if num == 0 {
                break;
            }

            let address = candidate.node.address();

            if candidate.already_used || state.is_dead(&address) {
                continue;
            }
            if config.visit_only_once && state.is_visited(&address) {
                continue;
            }

            state.find_node(transport, candidate.node, self.index, self.step);

            self.sources.insert(address, candidate.source);
            candidate.already_used = true;
            self.pending += 1;
            num -= 1;
        }

        if self.pending == 0 {
            if config.exhaustive {
                let closest: Vec<Node> = self
                    .candidates
                    .iter()
                    .take(config.redundancy)
                    .map(|c| c.node)
                    .collect();

                for node in closest {
                    state.add_sibling(transport, node, false, Some(self.index));
                }

                self.finish(true);
            } else {
                trace!(path = self.index, "Path ran out of candidates");
                self.finish(false);
            }
        }
    }

    pub fn handle_response(
        &mut self,
        state: &mut LookupState,
        transport: &mut dyn Transport,
        from: Node,
        response: &FindNodeResponseArguments,
    ) {
        if self.finished {
            return;
        }

        if state.is_expired() {
            debug!(path = self.index, "Path timed out");
            self.finish(false);
            return;
        }

        let config = state.config().clone();
        let target = state.target();
        let num_siblings = state.num_siblings();

        self.sources.remove(&from.address());
        if !state.is_local(&from) {
            self.hops += 1;
        }
        state.mark_visited(from.address());
        self.step += 1;
        self.pending = self.pending.saturating_sub(1);

        if !response.closest_nodes.is_empty() && !config.merge {
            self.candidates.clear();
        }

        let mut new_rpcs = 0;

        for node in &response.closest_nodes {
            if let Some(pos) = self.candidates.add(*node, Some(from)) {
                if pos < config.redundancy {
                    new_rpcs += 1;
                }
            }

            if num_siblings == 0 && node.id() == &target {
                if state.add_sibling(transport, *node, false, Some(self.index)) {
                    self.finish(true);
                    return;
                }
                // Waiting on the authentication ping, keep looking meanwhile.
            } else if num_siblings != 0 && !config.exhaustive && response.siblings {
                state.add_sibling(transport, *node, false, Some(self.index));
            }
        }

        if !config.exhaustive
            && response.siblings
            && !response.closest_nodes.is_empty()
            && num_siblings != 0
        {
            state.record_offer(&response.closest_nodes);
            self.finish(true);
            return;
        }

        if new_rpcs == 0 && config.new_rpc_on_every_response {
            new_rpcs = 1;
        }

        self.send_rpcs(state, transport, new_rpcs.min(config.parallel_rpcs));
    }

    /// A find node request to `to` timed out, or was answered too late for this path.
    pub fn handle_timeout(
        &mut self,
        state: &mut LookupState,
        overlay: &mut dyn KeyBasedRouting,
        transport: &mut dyn Transport,
        to: Node,
    ) {
        if self.finished {
            return;
        }

        let config = state.config().clone();

        if config.exhaustive && state.is_dead(&to.address()) {
            self.candidates.remove(&to.address());
        }

        self.pending = self.pending.saturating_sub(1);

        if state.is_expired() {
            debug!(path = self.index, "Path timed out");
            self.finish(false);
            return;
        }

        match self.sources.get(&to.address()).copied() {
            Some(None) if config.failed_node_rpcs => {
                self.sources.remove(&to.address());

                if overlay.handle_failed_node(to.address()) {
                    for node in overlay.closest_nodes(&state.target(), config.redundancy, true) {
                        self.candidates.add(node, None);
                    }
                }

                self.send_rpc_after_timeout(state, transport);
            }
            Some(Some(source)) if config.failed_node_rpcs => {
                trace!(path = self.index, ?source, failed = ?to, "Reporting failed node");
                state.failed_node(transport, source, to.address(), self.index);
            }
            _ => self.send_rpc_after_timeout(state, transport),
        }
    }

    /// `source` answered our report that `failed` did not respond.
    pub fn handle_failed_node_response(
        &mut self,
        state: &mut LookupState,
        transport: &mut dyn Transport,
        source: Node,
        failed: SocketAddr,
        try_again: bool,
    ) {
        if self.finished {
            return;
        }

        if self.sources.get(&failed) != Some(&Some(source)) {
            return;
        }

        if try_again {
            state.unmark_visited(&source.address());

            let suggested_by = self.sources.get(&source.address()).copied().flatten();
            self.candidates.retry(source, suggested_by);
        }

        self.sources.remove(&failed);
        self.send_rpc_after_timeout(state, transport);
    }

    /// The report of `failed` went unanswered.
    pub fn handle_failed_node_timeout(
        &mut self,
        state: &mut LookupState,
        transport: &mut dyn Transport,
        failed: SocketAddr,
    ) {
        if self.finished {
            return;
        }

        self.sources.remove(&failed);
        self.send_rpc_after_timeout(state, transport);
    }

    fn send_rpc_after_timeout(&mut self, state: &mut LookupState, transport: &mut dyn Transport) {
        let config = state.config();

        if config.new_rpc_on_every_timeout {
            self.send_rpcs(state, transport, 1);
        } else if self.pending == 0 {
            let num = config.parallel_rpcs;
            self.send_rpcs(state, transport, num);
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use super::*;
    use crate::common::ID_SIZE;

    fn key(nibble: u8) -> Id {
        let mut bytes = [0; ID_SIZE];
        bytes[0] = nibble << 4;

        Id::from(bytes)
    }

    fn node(nibble: u8) -> Node {
        Node::new(key(nibble), SocketAddr::from(([127, 0, 0, nibble], 6881)))
    }

    #[test]
    fn merged_candidates_are_sorted_and_bounded() {
        let mut candidates = CandidateList::new(key(0b0101), 2, true);

        assert_eq!(candidates.add(node(0b0111), None), Some(0));
        assert_eq!(candidates.add(node(0b0100), None), Some(0));
        assert_eq!(candidates.add(node(0b0100), None), None);
        // Farther than everything in a full list.
        assert_eq!(candidates.add(node(0b1111), None), None);
        assert_eq!(candidates.add(node(0b0101), Some(node(1))), Some(0));

        let ids: Vec<Id> = candidates.iter().map(|c| *c.node.id()).collect();
        assert_eq!(ids, vec![key(0b0101), key(0b0100)]);
        assert_eq!(candidates.iter().next().unwrap().source, Some(node(1)));
    }

    #[test]
    fn replaced_candidates_keep_offer_order() {
        let mut candidates = CandidateList::new(key(0b0101), 2, false);

        assert_eq!(candidates.add(node(0b1111), None), Some(0));
        assert_eq!(candidates.add(node(0b0101), None), Some(1));
        // Full, even for a closer node.
        assert_eq!(candidates.add(node(0b0100), None), None);
        assert_eq!(candidates.iter().count(), 2);
    }

    #[test]
    fn retry_resets_used_candidate() {
        let mut candidates = CandidateList::new(key(0b0101), 4, true);
        candidates.add(node(0b0100), None);

        candidates.iter_mut().for_each(|c| c.already_used = true);
        candidates.retry(node(0b0100), None);

        assert!(!candidates.iter().next().unwrap().already_used);

        candidates.retry(node(0b0111), None);
        assert_eq!(candidates.iter().count(), 2);

        candidates.remove(&node(0b0100).address());
        assert!(!candidates.contains(&key(0b0100)));
    }
}
