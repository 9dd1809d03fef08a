//! Main Crate Error

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Kbr crate error enum.
pub enum Error {
    /// Id bytes were not exactly [ID_SIZE](crate::common::ID_SIZE) long.
    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    /// Id string was not 40 hex characters.
    #[error("Invalid Id encoding: {0}")]
    InvalidIdEncoding(String),

    /// Bucket group width must divide the key length and fit in a byte.
    #[error("Invalid bucket group width b = {0}")]
    InvalidBucketWidth(u8),

    /// A capacity that must be at least one was configured as zero.
    #[error("{0} must be greater than zero")]
    ZeroCapacity(&'static str),

    /// Parallel paths, verified siblings and majority decisions all need merged
    /// candidate lists.
    #[error("{0} requires merge to be enabled")]
    MergeRequired(&'static str),

    /// Majority threshold can not be met by the configured number of paths.
    #[error("Majority threshold {threshold} out of range for {paths} parallel paths")]
    InvalidMajorityThreshold {
        /// Configured threshold
        threshold: usize,
        /// Configured parallel paths
        paths: usize,
    },

    /// Lookup asked for more siblings than the routing table can answer for.
    #[error("Requested {requested} siblings, but the routing table only tracks {max}")]
    TooManySiblings {
        /// Requested number of siblings
        requested: usize,
        /// Sibling capacity of the routing table
        max: usize,
    },

    /// Every path must be able to hold at least the requested siblings.
    #[error("Redundancy {redundancy} is smaller than the requested {siblings} siblings")]
    RedundancyBelowSiblings {
        /// Configured redundancy
        redundancy: usize,
        /// Requested number of siblings
        siblings: usize,
    },

    /// A lookup can only be started once.
    #[error("Lookup already started")]
    LookupAlreadyStarted,
}

/// Alias for `Result<T, kbr::Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;
