//! Actor implementation, one local node driving its routing table and lookups.

mod handle_request;
mod handle_response;

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::common::{
    FindNodeRequestArguments, Id, Node, RequestId, RoutingAction, RoutingTable,
    RoutingTableConfig,
};
use crate::rpc::{IterativeQuery, LookupConfig, LookupResult, Transport};
use crate::Result;

#[derive(Debug)]
/// A local node: owns the [RoutingTable], the lookups running on top of it, and
/// the [Transport] they send requests through.
///
/// Every response and timeout handed to the actor is routed to the lookup that
/// sent the request, and fed into the routing table maintenance.
pub struct Actor<T: Transport> {
    transport: T,

    routing_table: RoutingTable,
    lookup_config: LookupConfig,

    // Active lookups
    iterative_queries: Vec<IterativeQuery>,
    /// Pings the routing table asked for, by request id.
    maintenance_pings: HashMap<RequestId, Node>,

    /// Find node request to the bootstrap node, answers to it are trusted.
    join_request: Option<RequestId>,
    needs_rejoin: bool,
}

impl<T: Transport> Actor<T> {
    pub fn new(
        local: Node,
        config: RoutingTableConfig,
        lookup_config: LookupConfig,
        transport: T,
    ) -> Result<Self> {
        lookup_config.validate()?;

        Ok(Actor {
            transport,
            routing_table: RoutingTable::new(local, config)?,
            lookup_config,

            iterative_queries: Vec::new(),
            maintenance_pings: HashMap::new(),

            join_request: None,
            needs_rejoin: false,
        })
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        self.routing_table.id()
    }

    pub fn local_node(&self) -> &Node {
        self.routing_table.local_node()
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn routing_table_mut(&mut self) -> &mut RoutingTable {
        &mut self.routing_table
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn lookup_config(&self) -> &LookupConfig {
        &self.lookup_config
    }

    /// Number of lookups still running.
    pub fn active_lookups(&self) -> usize {
        self.iterative_queries.len()
    }

    /// Returns `true` if this node lost all of its siblings, or its last join
    /// attempt failed, and it should [join](Self::join) again.
    pub fn needs_rejoin(&self) -> bool {
        self.needs_rejoin
    }

    // === Public Methods ===

    /// Join the overlay through a known node, starting over with an empty
    /// routing table.
    ///
    /// Nodes learned from the bootstrap node's answer are trusted, then a lookup
    /// for the local key fills the sibling set.
    pub fn join(&mut self, bootstrap: Node) {
        self.stop_lookups();
        self.routing_table.clear();
        self.maintenance_pings.clear();

        let request = FindNodeRequestArguments {
            target: *self.id(),
            num_redundant: self.lookup_config.redundancy,
            num_siblings: self.join_siblings(),
            exhaustive: false,
        };

        debug!(?bootstrap, "Joining");

        self.join_request = Some(self.transport.send_find_node(bootstrap, request));
        self.needs_rejoin = false;
    }

    /// Start a lookup for the `num_siblings` closest nodes to `target`, or for the node
    /// with exactly that key if `num_siblings` is `0`.
    ///
    /// The result is sent to `sender` once the lookup finishes, which might be
    /// before this method returns.
    pub fn lookup(
        &mut self,
        target: Id,
        num_siblings: usize,
        sender: Option<flume::Sender<LookupResult>>,
    ) -> Result<()> {
        self.start_lookup(target, num_siblings, self.lookup_config.clone(), sender)
    }

    /// Stop all running lookups, cancelling their requests.
    pub fn stop_lookups(&mut self) {
        for query in self.iterative_queries.iter_mut() {
            query.stop(&mut self.transport);
        }

        self.iterative_queries.clear();
    }

    // === Private Methods ===

    fn start_lookup(
        &mut self,
        target: Id,
        num_siblings: usize,
        config: LookupConfig,
        sender: Option<flume::Sender<LookupResult>>,
    ) -> Result<()> {
        self.routing_table.mark_bucket_usage(&target);

        let mut query = IterativeQuery::new(target, num_siblings, config);
        if let Some(sender) = sender {
            query = query.with_listener(sender);
        }

        query.start(&mut self.routing_table, &mut self.transport)?;

        if !query.is_finished() {
            self.iterative_queries.push(query);
        }

        self.flush_routing_actions();

        Ok(())
    }

    /// Look for the nodes closest to the local key, without stopping at the
    /// local node itself.
    fn join_lookup(&mut self) -> Result<()> {
        let config = LookupConfig {
            exhaustive: true,
            ..self.lookup_config.clone()
        };

        self.start_lookup(*self.id(), self.join_siblings(), config, None)
    }

    fn join_siblings(&self) -> usize {
        self.routing_table
            .max_siblings()
            .min(self.lookup_config.redundancy)
    }

    /// Send the pings the routing table asked for.
    fn flush_routing_actions(&mut self) {
        for action in self.routing_table.drain_actions() {
            match action {
                RoutingAction::Ping(node) | RoutingAction::ProximityProbe(node) => {
                    if self.maintenance_pings.values().any(|n| n.id() == node.id()) {
                        continue;
                    }

                    let request_id = self.transport.send_ping(node);
                    self.maintenance_pings.insert(request_id, node);
                }
                RoutingAction::Rejoin => {
                    warn!(id = ?self.routing_table.id(), "Lost all siblings, rejoin required");
                    self.needs_rejoin = true;
                }
            }
        }
    }

    fn cleanup_done_queries(&mut self) {
        self.iterative_queries.retain(|query| !query.is_finished());
    }
}
