use std::collections::HashMap;
use std::net::SocketAddr;

use crate::common::{FindNodeRequestArguments, Node, RequestId};

use super::Transport;

/// What a lookup expects from an outstanding request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Purpose {
    /// Paths waiting for this find node response, with the step each of them
    /// was at when it asked.
    FindNode { paths: Vec<(usize, u32)> },
    /// Sibling authentication, on behalf of a path if it was learned from a response.
    Ping { path: Option<usize> },
    /// Report of `failed` to the node that suggested it to `path`.
    FailedNode { path: usize, failed: SocketAddr },
}

#[derive(Debug, Clone)]
pub(crate) struct InflightRequest {
    pub request_id: RequestId,
    pub to: Node,
    pub purpose: Purpose,
}

/// Requests of a single lookup, at most one find node request per destination.
#[derive(Debug, Default)]
pub(crate) struct InflightRequests {
    requests: Vec<InflightRequest>,
    // request_id => position in `requests`
    index: HashMap<RequestId, usize>,
    // destination => outstanding find node request
    find_node: HashMap<SocketAddr, RequestId>,
}

impl InflightRequests {
    pub fn new() -> Self {
        Self::default()
    }

    // === Getters ===

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn contains(&self, request_id: RequestId) -> bool {
        self.index.contains_key(&request_id)
    }

    pub fn pending_pings(&self) -> usize {
        self.requests
            .iter()
            .filter(|r| matches!(r.purpose, Purpose::Ping { .. }))
            .count()
    }

    // === Public Methods ===

    /// Send a find node request to `to` for `path`, or join the one already in flight.
    pub fn find_node(
        &mut self,
        transport: &mut dyn Transport,
        to: Node,
        path: usize,
        step: u32,
        request: FindNodeRequestArguments,
    ) -> RequestId {
        if let Some(&request_id) = self.find_node.get(&to.address()) {
            if let Some(&pos) = self.index.get(&request_id) {
                if let Purpose::FindNode { paths } = &mut self.requests[pos].purpose {
                    paths.push((path, step));
                }
            }

            return request_id;
        }

        let request_id = transport.send_find_node(to, request);
        self.find_node.insert(to.address(), request_id);
        self.add(
            request_id,
            to,
            Purpose::FindNode {
                paths: vec![(path, step)],
            },
        );

        request_id
    }

    pub fn ping(&mut self, transport: &mut dyn Transport, to: Node, path: Option<usize>) {
        let request_id = transport.send_ping(to);
        self.add(request_id, to, Purpose::Ping { path });
    }

    pub fn failed_node(
        &mut self,
        transport: &mut dyn Transport,
        to: Node,
        failed: SocketAddr,
        path: usize,
    ) {
        let request_id = transport.send_failed_node(to, failed);
        self.add(request_id, to, Purpose::FailedNode { path, failed });
    }

    /// Remove a request, once it was answered or timed out.
    pub fn remove(&mut self, request_id: RequestId) -> Option<InflightRequest> {
        let pos = self.index.remove(&request_id)?;

        let request = self.requests.swap_remove(pos);
        if let Some(moved) = self.requests.get(pos) {
            self.index.insert(moved.request_id, pos);
        }

        if matches!(request.purpose, Purpose::FindNode { .. }) {
            self.find_node.remove(&request.to.address());
        }

        Some(request)
    }

    /// Cancel everything still in flight.
    pub fn cancel_all(&mut self, transport: &mut dyn Transport) {
        for request in self.requests.drain(..) {
            transport.cancel(request.request_id);
        }

        self.index.clear();
        self.find_node.clear();
    }

    fn add(&mut self, request_id: RequestId, to: Node, purpose: Purpose) {
        self.index.insert(request_id, self.requests.len());
        self.requests.push(InflightRequest {
            request_id,
            to,
            purpose,
        });
    }
}
