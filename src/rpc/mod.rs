//! Iterative lookups, independent of how requests are delivered.

mod config;
mod inflight;
mod iterative_query;
mod path;

use std::net::SocketAddr;
use std::time::Duration;

use crate::common::{FindNodeRequestArguments, Node, RequestId};

pub use config::LookupConfig;
pub use iterative_query::{IterativeQuery, LookupListener, LookupResult};

/// Default number of candidates kept and queried per path.
pub const DEFAULT_REDUNDANCY: usize = 8;
/// Default number of independent paths per lookup.
pub const DEFAULT_PARALLEL_PATHS: usize = 1;
/// Default number of concurrent requests per path.
pub const DEFAULT_PARALLEL_RPCS: usize = 3;
/// Default duration after which running paths give up.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Delivers requests to other nodes.
///
/// Every request gets an id, and the caller is expected to eventually hand its
/// response or timeout back to the lookup that sent it, unless it was cancelled.
pub trait Transport {
    fn send_find_node(&mut self, to: Node, request: FindNodeRequestArguments) -> RequestId;

    fn send_ping(&mut self, to: Node) -> RequestId;

    /// Tell `to` that `failed`, a node it suggested, did not answer.
    fn send_failed_node(&mut self, to: Node, failed: SocketAddr) -> RequestId;

    /// The response to this request is no longer expected.
    fn cancel(&mut self, request_id: RequestId);
}
