use std::time::Duration;

use crate::{Error, Result};

use super::{
    DEFAULT_LOOKUP_TIMEOUT, DEFAULT_PARALLEL_PATHS, DEFAULT_PARALLEL_RPCS, DEFAULT_REDUNDANCY,
};

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Iterative lookup configurations
pub struct LookupConfig {
    /// Number of next hop candidates kept and queried per path.
    ///
    /// Defaults to [DEFAULT_REDUNDANCY]
    pub redundancy: usize,
    /// Number of independent paths each lookup runs, capped by the number of
    /// known nodes it starts with.
    ///
    /// Defaults to [DEFAULT_PARALLEL_PATHS]
    pub parallel_paths: usize,
    /// Number of requests a path sends at once.
    ///
    /// Defaults to [DEFAULT_PARALLEL_RPCS]
    pub parallel_rpcs: usize,
    /// Merge the nodes of each response into the candidates of a path, instead of
    /// replacing them.
    ///
    /// Required by parallel paths, sibling verification, majority decisions and
    /// [Self::use_all_parallel_responses].
    ///
    /// Defaults to `true`
    pub merge: bool,
    /// Ping every sibling learned from a third party before accepting it.
    ///
    /// Defaults to `false`
    pub verify_siblings: bool,
    /// Accept a sibling set as soon as this many paths offered it.
    ///
    /// Defaults to `None`
    pub majority_threshold: Option<usize>,
    /// Accept responses marked as siblings even if they arrive after the path
    /// moved on to the next step.
    ///
    /// Defaults to `true`
    pub accept_late_siblings: bool,
    /// Never exceed [Self::parallel_rpcs] requests in flight per path.
    ///
    /// Defaults to `false`
    pub strict_parallel_rpcs: bool,
    /// Report unresponsive next hops to the node that suggested them.
    ///
    /// Defaults to `false`
    pub failed_node_rpcs: bool,
    /// Ignore sibling claims, and keep querying until no closer nodes are found.
    ///
    /// Defaults to `false`
    pub exhaustive: bool,
    /// Let a path use responses to requests from any of its previous steps.
    ///
    /// Defaults to `true`
    pub use_all_parallel_responses: bool,
    /// Send a new request on every timeout, instead of waiting until a path has
    /// nothing left in flight.
    ///
    /// Defaults to `false`
    pub new_rpc_on_every_timeout: bool,
    /// Send at least one new request on every response, even if it offered no
    /// closer nodes.
    ///
    /// Defaults to `false`
    pub new_rpc_on_every_response: bool,
    /// Finish a path on the first response that offered no new candidates.
    ///
    /// Defaults to `false`
    pub finish_on_first_unchanged: bool,
    /// Never query the same node twice within a lookup.
    ///
    /// Defaults to `true`
    pub visit_only_once: bool,
    /// Paths still running after this duration are finished as failed.
    ///
    /// Defaults to [DEFAULT_LOOKUP_TIMEOUT]
    pub lookup_timeout: Duration,
    /// Maximum responses counted by a path, `0` for no limit.
    ///
    /// Defaults to `0`
    pub hop_count_max: u32,
    /// Number of times a failed lookup starts over.
    ///
    /// Defaults to `0`
    pub retries: u32,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            redundancy: DEFAULT_REDUNDANCY,
            parallel_paths: DEFAULT_PARALLEL_PATHS,
            parallel_rpcs: DEFAULT_PARALLEL_RPCS,
            merge: true,
            verify_siblings: false,
            majority_threshold: None,
            accept_late_siblings: true,
            strict_parallel_rpcs: false,
            failed_node_rpcs: false,
            exhaustive: false,
            use_all_parallel_responses: true,
            new_rpc_on_every_timeout: false,
            new_rpc_on_every_response: false,
            finish_on_first_unchanged: false,
            visit_only_once: true,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            hop_count_max: 0,
            retries: 0,
        }
    }
}

impl LookupConfig {
    /// Check combinations that can not work together.
    pub fn validate(&self) -> Result<()> {
        if self.redundancy == 0 {
            return Err(Error::ZeroCapacity("redundancy"));
        }
        if self.parallel_paths == 0 {
            return Err(Error::ZeroCapacity("parallel_paths"));
        }
        if self.parallel_rpcs == 0 {
            return Err(Error::ZeroCapacity("parallel_rpcs"));
        }

        if !self.merge {
            if self.parallel_paths > 1 {
                return Err(Error::MergeRequired("parallel_paths"));
            }
            if self.verify_siblings {
                return Err(Error::MergeRequired("verify_siblings"));
            }
            if self.majority_threshold.is_some() {
                return Err(Error::MergeRequired("majority_threshold"));
            }
            if self.use_all_parallel_responses {
                return Err(Error::MergeRequired("use_all_parallel_responses"));
            }
        }

        if let Some(threshold) = self.majority_threshold {
            if threshold == 0 || threshold > self.parallel_paths {
                return Err(Error::InvalidMajorityThreshold {
                    threshold,
                    paths: self.parallel_paths,
                });
            }
        }

        Ok(())
    }

    /// Check a lookup for `num_siblings` against this configuration and an
    /// overlay answering for at most `max_siblings`.
    pub fn validate_lookup(&self, num_siblings: usize, max_siblings: usize) -> Result<()> {
        self.validate()?;

        if num_siblings > max_siblings {
            return Err(Error::TooManySiblings {
                requested: num_siblings,
                max: max_siblings,
            });
        }

        if num_siblings > 0 && self.redundancy < num_siblings {
            return Err(Error::RedundancyBelowSiblings {
                redundancy: self.redundancy,
                siblings: num_siblings,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(LookupConfig::default().validate().is_ok());
        assert!(LookupConfig::default().validate_lookup(8, 8).is_ok());
    }

    #[test]
    fn merge_required() {
        let replace = LookupConfig {
            merge: false,
            use_all_parallel_responses: false,
            ..Default::default()
        };

        assert!(replace.validate().is_ok());

        for (config, field) in [
            (
                LookupConfig {
                    parallel_paths: 2,
                    ..replace.clone()
                },
                "parallel_paths",
            ),
            (
                LookupConfig {
                    verify_siblings: true,
                    ..replace.clone()
                },
                "verify_siblings",
            ),
            (
                LookupConfig {
                    majority_threshold: Some(1),
                    ..replace.clone()
                },
                "majority_threshold",
            ),
            (
                LookupConfig {
                    use_all_parallel_responses: true,
                    ..replace.clone()
                },
                "use_all_parallel_responses",
            ),
        ] {
            assert_eq!(config.validate(), Err(Error::MergeRequired(field)));
        }
    }

    #[test]
    fn majority_threshold_bounds() {
        let config = LookupConfig {
            parallel_paths: 3,
            majority_threshold: Some(4),
            ..Default::default()
        };

        assert_eq!(
            config.validate(),
            Err(Error::InvalidMajorityThreshold {
                threshold: 4,
                paths: 3
            })
        );

        let config = LookupConfig {
            majority_threshold: Some(0),
            ..config
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn sibling_bounds() {
        let config = LookupConfig {
            redundancy: 4,
            ..Default::default()
        };

        assert_eq!(
            config.validate_lookup(9, 8),
            Err(Error::TooManySiblings {
                requested: 9,
                max: 8
            })
        );
        assert_eq!(
            config.validate_lookup(5, 8),
            Err(Error::RedundancyBelowSiblings {
                redundancy: 4,
                siblings: 5
            })
        );
        assert!(config.validate_lookup(0, 8).is_ok());
    }
}
