#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
mod actor;
mod common;
mod error;

pub mod rpc;

pub use crate::actor::Actor;
pub use crate::common::{
    BucketEntry, Clock, ClosestNodes, FindNodeRequestArguments, FindNodeResponseArguments, Id,
    KBucket, KeyBasedRouting, Node, RequestId, RequestSpecific, ResponseSpecific, RoutingAction,
    RoutingTable, RoutingTableConfig, SiblingSet, SystemClock, DEFAULT_BUCKET_SIZE_K,
    DEFAULT_REPLACEMENT_CANDIDATES, DEFAULT_SIBLINGS_S, ID_BITS, ID_SIZE,
};
pub use crate::rpc::{IterativeQuery, LookupConfig, LookupListener, LookupResult, Transport};

pub use error::{Error, Result};
