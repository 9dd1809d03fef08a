//! Miscellaneous common structs used throughout the library.

mod clock;
mod closest_nodes;
mod id;
mod kbr;
mod kbucket;
mod messages;
mod node;
mod routing_table;

pub use clock::*;
pub use closest_nodes::*;
pub use id::*;
pub use kbr::*;
pub use kbucket::*;
pub use messages::*;
pub use node::*;
pub use routing_table::*;
