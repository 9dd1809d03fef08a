use std::time::Duration;

use tracing::{debug, warn};

use crate::common::{Node, RequestId, ResponseSpecific};
use crate::rpc::Transport;

use super::Actor;

impl<T: Transport> Actor<T> {
    /// Handle the response to a request sent by this actor, `rtt` being the measured
    /// round trip time if the transport knows it.
    pub fn handle_response(
        &mut self,
        request_id: RequestId,
        from: Node,
        response: ResponseSpecific,
        rtt: Option<Duration>,
    ) {
        if self.join_request == Some(request_id) {
            self.join_request = None;
            self.handle_join_response(from, response, rtt);
            self.flush_routing_actions();

            return;
        }

        if let ResponseSpecific::FindNode(arguments) = &response {
            self.routing_table.mark_bucket_usage(from.id());

            // Add inactive nodes
            for node in &arguments.closest_nodes {
                self.routing_table.add(*node, false, None, false);
            }
        }

        let answered_ping = matches!(response, ResponseSpecific::Ping);

        let expected = if self.maintenance_pings.remove(&request_id).is_some() {
            true
        } else {
            match self
                .iterative_queries
                .iter_mut()
                .find(|query| query.is_inflight(request_id))
            {
                Some(query) => query.handle_response(
                    &mut self.routing_table,
                    &mut self.transport,
                    request_id,
                    response,
                ),
                None => {
                    debug!(request_id, ?from, "Response to an unknown request");
                    false
                }
            }
        };

        // Add the node that responded
        if expected && answered_ping {
            self.routing_table.authenticate(from, rtt);
        } else {
            self.routing_table.add(from, true, rtt, false);
        }

        self.cleanup_done_queries();
        self.flush_routing_actions();
    }

    /// Handle a request sent by this actor that will never be answered.
    pub fn handle_timeout(&mut self, request_id: RequestId) {
        if self.join_request == Some(request_id) {
            self.join_request = None;
            self.needs_rejoin = true;

            warn!(id = ?self.id(), "Bootstrap node did not respond");
            return;
        }

        let node = match self.maintenance_pings.remove(&request_id) {
            Some(node) => Some(node),
            None => self
                .iterative_queries
                .iter_mut()
                .find(|query| query.is_inflight(request_id))
                .and_then(|query| {
                    query.handle_timeout(&mut self.routing_table, &mut self.transport, request_id)
                }),
        };

        match node {
            Some(node) => {
                self.routing_table.timeout(node.id(), false);
            }
            None => debug!(request_id, "Timeout of an unknown request"),
        }

        self.cleanup_done_queries();
        self.flush_routing_actions();
    }

    fn handle_join_response(
        &mut self,
        from: Node,
        response: ResponseSpecific,
        rtt: Option<Duration>,
    ) {
        self.routing_table.add(from, true, rtt, false);

        let ResponseSpecific::FindNode(arguments) = response else {
            warn!(?from, "Unexpected answer from the bootstrap node");
            self.needs_rejoin = true;
            return;
        };

        // The bootstrap node is trusted, add all of its nodes right away.
        for node in arguments.closest_nodes {
            self.routing_table.add(node, true, None, false);
        }

        if let Err(error) = self.join_lookup() {
            warn!(?error, "Could not start the join lookup");
            self.needs_rejoin = true;
        }
    }
}
