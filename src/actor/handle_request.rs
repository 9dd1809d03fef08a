use tracing::trace;

use crate::common::{KeyBasedRouting, Node, RequestSpecific, ResponseSpecific};
use crate::rpc::Transport;

use super::Actor;

impl<T: Transport> Actor<T> {
    /// Answer a request from another node, and add it to the routing table as alive.
    pub fn handle_request(&mut self, from: Node, request: &RequestSpecific) -> ResponseSpecific {
        // Add active node
        self.routing_table.add(from, true, None, false);

        let response = match request {
            RequestSpecific::Ping => ResponseSpecific::Ping,
            RequestSpecific::FindNode(arguments) => {
                ResponseSpecific::FindNode(self.routing_table.find_node(arguments))
            }
            RequestSpecific::FailedNode { failed } => {
                trace!(?from, ?failed, "Failed node reported");

                ResponseSpecific::FailedNode {
                    try_again: self.routing_table.handle_failed_node(*failed),
                }
            }
        };

        self.flush_routing_actions();

        response
    }
}
