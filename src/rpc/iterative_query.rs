//! Manage iterative lookups and their corresponding request/response.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, trace};

use crate::common::{
    Clock, ClosestNodes, FindNodeRequestArguments, FindNodeResponseArguments, Id,
    KeyBasedRouting, Node, RequestId, ResponseSpecific, SystemClock,
};
use crate::{Error, Result};

use super::inflight::{InflightRequests, Purpose};
use super::path::PathLookup;
use super::{LookupConfig, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
/// Outcome of a finished lookup.
pub struct LookupResult {
    pub target: Id,
    pub success: bool,
    /// Closest nodes found, closest first.
    ///
    /// For a lookup of `0` siblings, the node with the exact target key.
    pub siblings: Vec<Node>,
    /// Hops taken by the paths that finished.
    pub hops: u32,
}

/// Notified exactly once, when a lookup finishes.
pub trait LookupListener: Send {
    fn lookup_finished(&mut self, result: &LookupResult);
}

impl LookupListener for flume::Sender<LookupResult> {
    fn lookup_finished(&mut self, result: &LookupResult) {
        // Receiver might have been dropped, nothing to do about it.
        let _ = self.send(result.clone());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Idle,
    Running,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Continue,
    Retry,
    Finished,
}

/// State shared by all paths of a lookup.
#[derive(Debug)]
pub(crate) struct LookupState {
    target: Id,
    num_siblings: usize,
    config: LookupConfig,
    local: Option<Node>,
    /// Paths actually running, at most `config.parallel_paths`.
    parallel_paths: usize,

    siblings: ClosestNodes,
    /// Sibling sets offered by finished paths, and how many paths offered each.
    offers: Vec<(Vec<Node>, usize)>,

    visited: HashSet<SocketAddr>,
    dead: HashSet<SocketAddr>,
    pinged: HashSet<SocketAddr>,
    inflight: InflightRequests,

    clock: Box<dyn Clock>,
    started_at: Instant,
}

impl LookupState {
    fn new(target: Id, num_siblings: usize, config: LookupConfig) -> Self {
        let clock: Box<dyn Clock> = Box::new(SystemClock);
        let started_at = clock.now();

        Self {
            target,
            num_siblings,
            parallel_paths: config.parallel_paths,
            config,
            local: None,

            siblings: ClosestNodes::new(target, num_siblings.max(1)),
            offers: Vec::new(),

            visited: HashSet::new(),
            dead: HashSet::new(),
            pinged: HashSet::new(),
            inflight: InflightRequests::new(),

            clock,
            started_at,
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn num_siblings(&self) -> usize {
        self.num_siblings
    }

    pub fn config(&self) -> &LookupConfig {
        &self.config
    }

    pub fn is_local(&self, node: &Node) -> bool {
        self.local.is_some_and(|local| local.id() == node.id())
    }

    pub fn is_visited(&self, address: &SocketAddr) -> bool {
        self.visited.contains(address)
    }

    pub fn is_dead(&self, address: &SocketAddr) -> bool {
        self.dead.contains(address)
    }

    pub fn is_expired(&self) -> bool {
        self.clock.now().saturating_duration_since(self.started_at) > self.config.lookup_timeout
    }

    // === Public Methods ===

    pub fn mark_visited(&mut self, address: SocketAddr) {
        self.visited.insert(address);
    }

    pub fn unmark_visited(&mut self, address: &SocketAddr) {
        self.visited.remove(address);
    }

    pub fn find_node(&mut self, transport: &mut dyn Transport, to: Node, path: usize, step: u32) {
        let request = FindNodeRequestArguments {
            target: self.target,
            num_redundant: self.config.redundancy,
            num_siblings: self.num_siblings,
            exhaustive: self.config.exhaustive,
        };

        self.inflight.find_node(transport, to, path, step, request);
    }

    pub fn failed_node(
        &mut self,
        transport: &mut dyn Transport,
        to: Node,
        failed: SocketAddr,
        path: usize,
    ) {
        self.inflight.failed_node(transport, to, failed, path);
    }

    /// Offer a node for the result.
    ///
    /// Unless `assured`, a node we had no round trip with is only accepted after it
    /// answers a ping, and `false` is returned meanwhile.
    pub fn add_sibling(
        &mut self,
        transport: &mut dyn Transport,
        node: Node,
        assured: bool,
        path: Option<usize>,
    ) -> bool {
        let address = node.address();

        if self.config.verify_siblings && !assured && !self.visited.contains(&address) {
            if self.siblings.is_addable(&node)
                && !self.siblings.contains(node.id())
                && self.pinged.insert(address)
            {
                trace!(?node, "Authenticating sibling");
                self.inflight.ping(transport, node, path);
            }

            return false;
        }

        if self.num_siblings == 0 {
            if node.id() == &self.target {
                self.siblings.clear();
                self.siblings.add(node);

                return true;
            }

            return false;
        }

        let added = self.siblings.add(node).is_some();

        if self.parallel_paths == 1 && !self.config.verify_siblings {
            true
        } else {
            added
        }
    }

    /// Remember the sibling set a path finished with.
    pub fn record_offer(&mut self, nodes: &[Node]) {
        if self.config.majority_threshold.is_none() {
            return;
        }

        let mut offer = ClosestNodes::new(self.target, self.num_siblings.max(1));
        for node in nodes {
            offer.add(*node);
        }
        let offer = offer.to_vec();

        match self
            .offers
            .iter_mut()
            .find(|(set, _)| set.iter().map(Node::id).eq(offer.iter().map(Node::id)))
        {
            Some((_, votes)) => *votes += 1,
            None => self.offers.push((offer, 1)),
        }
    }

    /// The most offered sibling set, if enough paths agreed on it.
    ///
    /// Ties go to the set with the closest member.
    fn majority(&self) -> Option<Vec<Node>> {
        let threshold = self.config.majority_threshold?;
        let target = self.target;

        self.offers
            .iter()
            .filter(|(_, votes)| *votes >= threshold)
            .max_by(|(a, a_votes), (b, b_votes)| {
                a_votes
                    .cmp(b_votes)
                    .then_with(|| match (a.first(), b.first()) {
                        (Some(a), Some(b)) => target.cmp_distance(b.id(), a.id()),
                        _ => Ordering::Equal,
                    })
            })
            .map(|(set, _)| set.clone())
    }

    fn reset(&mut self) {
        self.siblings.clear();
        self.offers.clear();
        self.visited.clear();
        self.dead.clear();
        self.pinged.clear();
        self.parallel_paths = self.config.parallel_paths;
    }
}

/// A lookup for the siblings of a target key, running several independent
/// [paths](PathLookup) that share one result.
///
/// The lookup sends requests through a [Transport], and is driven by feeding it
/// responses and timeouts of those requests.
#[derive(Debug)]
pub struct IterativeQuery {
    state: LookupState,
    paths: Vec<PathLookup>,
    status: Status,
    success: bool,
    retries: u32,
    listener: Option<Box<dyn LookupListener>>,
    result: Option<LookupResult>,
}

impl std::fmt::Debug for dyn LookupListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LookupListener")
    }
}

impl IterativeQuery {
    /// Create a lookup for the `num_siblings` closest nodes to `target`, or the node
    /// with exactly that key if `num_siblings` is `0`.
    pub fn new(target: Id, num_siblings: usize, config: LookupConfig) -> Self {
        trace!(?target, num_siblings, "New Query");

        Self {
            retries: config.retries,
            state: LookupState::new(target, num_siblings, config),
            paths: Vec::new(),
            status: Status::Idle,
            success: false,
            listener: None,
            result: None,
        }
    }

    // === Options ===

    pub fn with_listener(mut self, listener: impl LookupListener + 'static) -> Self {
        self.listener = Some(Box::new(listener));
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.state.clock = Box::new(clock);
        self
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.state.target
    }

    pub fn num_siblings(&self) -> usize {
        self.state.num_siblings
    }

    pub fn config(&self) -> &LookupConfig {
        &self.state.config
    }

    pub fn is_running(&self) -> bool {
        self.status == Status::Running
    }

    pub fn is_finished(&self) -> bool {
        self.status == Status::Finished
    }

    /// Siblings found so far.
    pub fn siblings(&self) -> &[Node] {
        self.state.siblings.nodes()
    }

    /// Available once the lookup finished.
    pub fn result(&self) -> Option<&LookupResult> {
        self.result.as_ref()
    }

    /// Return true if a response (by request id) is expected by this lookup.
    pub fn is_inflight(&self, request_id: RequestId) -> bool {
        self.state.inflight.contains(request_id)
    }

    // === Public Methods ===

    /// Start the lookup from the closest nodes the overlay knows.
    ///
    /// The lookup might finish right away, see [Self::is_finished].
    pub fn start(
        &mut self,
        overlay: &mut dyn KeyBasedRouting,
        transport: &mut dyn Transport,
    ) -> Result<()> {
        if self.status != Status::Idle {
            return Err(Error::LookupAlreadyStarted);
        }

        self.state
            .config
            .validate_lookup(self.state.num_siblings, overlay.max_siblings())?;

        self.state.local = Some(overlay.local_node());
        self.state.started_at = self.state.clock.now();
        self.status = Status::Running;

        debug!(
            target = ?self.state.target,
            num_siblings = self.state.num_siblings,
            "Starting lookup"
        );

        self.run(overlay, transport);

        Ok(())
    }

    /// Handle the response to one of this lookup's requests.
    ///
    /// Returns `false` if the request was not sent by this lookup, or the lookup
    /// is no longer running.
    pub fn handle_response(
        &mut self,
        overlay: &mut dyn KeyBasedRouting,
        transport: &mut dyn Transport,
        request_id: RequestId,
        response: ResponseSpecific,
    ) -> bool {
        if self.status != Status::Running {
            return false;
        }

        let Some(request) = self.state.inflight.remove(request_id) else {
            return false;
        };

        match (request.purpose, response) {
            (Purpose::FindNode { paths }, ResponseSpecific::FindNode(response)) => {
                self.handle_find_node_response(overlay, transport, request.to, paths, &response);
            }
            (Purpose::Ping { path }, ResponseSpecific::Ping) => {
                if self.state.add_sibling(transport, request.to, true, path)
                    && self.state.num_siblings == 0
                {
                    if let Some(path) = path.and_then(|index| self.paths.get_mut(index)) {
                        path.finish(true);
                    }
                }
            }
            (Purpose::FailedNode { path, failed }, ResponseSpecific::FailedNode { try_again }) => {
                if let Some(path) = self.paths.get_mut(path) {
                    path.handle_failed_node_response(
                        &mut self.state,
                        transport,
                        request.to,
                        failed,
                        try_again,
                    );
                }
            }
            (purpose, response) => {
                debug!(from = ?request.to, ?response, "Unexpected response type");
                self.handle_lost_request(overlay, transport, request.to, purpose);
            }
        }

        self.after_event(overlay, transport);

        true
    }

    /// Handle a request of this lookup that went unanswered, and return the
    /// node that did not respond.
    pub fn handle_timeout(
        &mut self,
        overlay: &mut dyn KeyBasedRouting,
        transport: &mut dyn Transport,
        request_id: RequestId,
    ) -> Option<Node> {
        if self.status != Status::Running {
            return None;
        }

        let request = self.state.inflight.remove(request_id)?;

        self.handle_lost_request(overlay, transport, request.to, request.purpose);
        self.after_event(overlay, transport);

        Some(request.to)
    }

    /// Abandon a running lookup, cancelling everything in flight.
    pub fn stop(&mut self, transport: &mut dyn Transport) {
        if self.status == Status::Running {
            self.finish(transport);
        }
    }

    // === Private Methods ===

    fn run(&mut self, overlay: &mut dyn KeyBasedRouting, transport: &mut dyn Transport) {
        loop {
            if let Some(success) = self.seed(overlay, transport) {
                self.success = success;
                self.finish(transport);
                return;
            }

            if self.check_stop(transport) != Stop::Retry {
                return;
            }
        }
    }

    fn after_event(&mut self, overlay: &mut dyn KeyBasedRouting, transport: &mut dyn Transport) {
        if self.check_stop(transport) == Stop::Retry {
            self.run(overlay, transport);
        }
    }

    /// Spread the closest known nodes over the paths and send the first requests.
    ///
    /// Returns the outcome if the lookup can be answered without any requests.
    fn seed(
        &mut self,
        overlay: &mut dyn KeyBasedRouting,
        transport: &mut dyn Transport,
    ) -> Option<bool> {
        self.state.reset();
        self.paths.clear();
        self.success = false;

        let local = overlay.local_node();
        let target = self.state.target;
        let num_siblings = self.state.num_siblings;
        let config = self.state.config.clone();

        self.state.mark_visited(local.address());

        let seeds = overlay.closest_nodes(&target, config.redundancy, true);

        if seeds.is_empty() {
            debug!(?target, "No known nodes to start the lookup from");
            return Some(false);
        }

        if overlay.is_sibling_for(&local, &target, num_siblings) == Some(true) {
            if num_siblings == 0 {
                self.state.siblings.add(local);
                return Some(true);
            }

            if !config.exhaustive {
                trace!(?target, "Local node is a sibling, answering locally");

                self.state.add_sibling(transport, local, true, None);
                for node in seeds {
                    self.state.add_sibling(transport, node, true, None);
                }

                return Some(true);
            }
        }

        let num_paths = config.parallel_paths.min(seeds.len());
        self.state.parallel_paths = num_paths;
        self.paths = (0..num_paths)
            .map(|index| PathLookup::new(index, &self.state))
            .collect();

        for (i, node) in seeds.into_iter().enumerate() {
            self.paths[i % num_paths].add_seed(node);
        }

        for path in self.paths.iter_mut() {
            path.send_rpcs(&mut self.state, transport, config.parallel_rpcs);
        }

        None
    }

    fn handle_find_node_response(
        &mut self,
        overlay: &mut dyn KeyBasedRouting,
        transport: &mut dyn Transport,
        from: Node,
        paths: Vec<(usize, u32)>,
        response: &FindNodeResponseArguments,
    ) {
        let exhaustive = self.state.config.exhaustive;
        let late_siblings = response.siblings && self.state.config.accept_late_siblings;

        let mut handled = false;

        for (index, step) in paths {
            let Some(path) = self.paths.get_mut(index) else {
                continue;
            };
            if path.is_finished() {
                continue;
            }

            if !handled && (path.accepts(step, &self.state) || exhaustive || late_siblings) {
                path.handle_response(&mut self.state, transport, from, response);
                handled = true;
            } else {
                // Only one path uses a response, the rest moves on without it.
                path.handle_timeout(&mut self.state, overlay, transport, from);
            }
        }
    }

    fn handle_lost_request(
        &mut self,
        overlay: &mut dyn KeyBasedRouting,
        transport: &mut dyn Transport,
        to: Node,
        purpose: Purpose,
    ) {
        match purpose {
            Purpose::FindNode { paths } => {
                self.state.dead.insert(to.address());

                for (index, _) in paths {
                    if let Some(path) = self.paths.get_mut(index) {
                        path.handle_timeout(&mut self.state, overlay, transport, to);
                    }
                }
            }
            Purpose::Ping { .. } => {
                trace!(node = ?to, "Sibling failed authentication");
            }
            Purpose::FailedNode { path, failed } => {
                if let Some(path) = self.paths.get_mut(path) {
                    path.handle_failed_node_timeout(&mut self.state, transport, failed);
                }
            }
        }
    }

    fn check_stop(&mut self, transport: &mut dyn Transport) -> Stop {
        let num_siblings = self.state.num_siblings;
        let all_finished = self.paths.iter().all(PathLookup::is_finished);
        let successful_paths = self.paths.iter().filter(|p| p.is_success()).count();
        let pending_pings = self.state.inflight.pending_pings();

        let mut done = false;

        if num_siblings > 0 && all_finished {
            if let Some(siblings) = self.state.majority() {
                debug!(target = ?self.state.target, "Paths agreed on siblings");

                self.state.siblings.clear();
                for node in siblings {
                    self.state.siblings.add(node);
                }
                self.success = true;
                done = true;
            }
        }

        if (successful_paths >= 1 && num_siblings == 0 && !self.state.siblings.is_empty())
            || (all_finished && num_siblings > 0 && pending_pings == 0)
            || self.state.inflight.is_empty()
        {
            done = true;
        }

        if !done {
            return Stop::Continue;
        }

        if successful_paths >= 1 {
            self.success = true;
        }
        if self.state.siblings.is_empty() {
            self.success = false;
        }

        if !self.success && self.retries > 0 {
            self.retries -= 1;
            debug!(
                target = ?self.state.target,
                retries_left = self.retries,
                "Lookup failed, retrying"
            );

            self.state.inflight.cancel_all(transport);

            return Stop::Retry;
        }

        self.finish(transport);

        Stop::Finished
    }

    fn finish(&mut self, transport: &mut dyn Transport) {
        self.state.inflight.cancel_all(transport);

        let hops = self
            .paths
            .iter()
            .filter(|p| p.is_finished())
            .map(PathLookup::hops)
            .sum();

        self.paths.clear();
        self.status = Status::Finished;

        let result = LookupResult {
            target: self.state.target,
            success: self.success,
            siblings: self.state.siblings.to_vec(),
            hops,
        };

        debug!(
            target = ?result.target,
            success = result.success,
            siblings = result.siblings.len(),
            hops,
            "Lookup finished"
        );

        if let Some(listener) = self.listener.as_mut() {
            listener.lookup_finished(&result);
        }

        self.result = Some(result);
    }
}
