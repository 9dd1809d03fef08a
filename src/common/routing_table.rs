//! Kademlia routing table: k-buckets, replacement caches and the sibling set

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, error, trace};

use crate::common::{
    BucketEntry, Clock, ClosestNodes, Id, KBucket, Node, SiblingSet, SystemClock, ID_BITS,
};
use crate::{Error, Result};

/// K = the default maximum size of a k-bucket.
pub const DEFAULT_BUCKET_SIZE_K: usize = 8;
/// S = the default size of the sibling set.
pub const DEFAULT_SIBLINGS_S: usize = 8;
/// Default number of replacement candidates kept per bucket.
pub const DEFAULT_REPLACEMENT_CANDIDATES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Routing table configurations, fixed at construction.
pub struct RoutingTableConfig {
    /// Maximum number of entries in a bucket.
    ///
    /// Defaults to [DEFAULT_BUCKET_SIZE_K]
    pub k: usize,
    /// Maximum number of siblings, the nodes closest to the local node.
    ///
    /// Defaults to [DEFAULT_SIBLINGS_S]
    pub s: usize,
    /// Number of key bits grouped per bucket layer, must divide the key length.
    ///
    /// `1` gives classic single bit Kademlia buckets, while `b` bits give
    /// `2^b - 1` buckets per layer.
    ///
    /// Defaults to `1`
    pub b: u8,
    /// Number of timeouts tolerated before an entry is evicted.
    ///
    /// Defaults to `0`, evicting on the first timeout.
    pub max_stale: u8,
    /// Capacity of each bucket's replacement cache.
    ///
    /// Defaults to [DEFAULT_REPLACEMENT_CANDIDATES]
    pub replacement_candidates: usize,
    /// Keep live nodes seen while their bucket is full, to fill the next vacancy.
    ///
    /// Defaults to `true`
    pub enable_replacement_cache: bool,
    /// Ping the first not yet pinged bucket entry whenever a candidate is
    /// cached, so stale entries make room sooner.
    ///
    /// Defaults to `true`
    pub replacement_cache_ping: bool,
    /// Only trust routing information from nodes confirmed by a direct round trip.
    ///
    /// Defaults to `false`
    pub secure_maintenance: bool,
    /// Ping new siblings learned from third parties.
    ///
    /// Defaults to `false`
    pub ping_new_siblings: bool,
    /// Prefer low latency entries in full buckets, and probe the round trip time
    /// of entries without one.
    ///
    /// Defaults to `false`
    pub proximity_neighbor_selection: bool,
}

impl RoutingTableConfig {
    /// Check that the configured widths and capacities are usable.
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(Error::ZeroCapacity("k"));
        }

        if self.s == 0 {
            return Err(Error::ZeroCapacity("s"));
        }

        if self.b == 0 || self.b > 8 || ID_BITS % self.b as usize != 0 {
            return Err(Error::InvalidBucketWidth(self.b));
        }

        Ok(())
    }

    /// Number of buckets: `(2^b - 1) * (L / b)`.
    pub fn num_buckets(&self) -> usize {
        let b = self.b as usize;

        ((1 << b) - 1) * (ID_BITS / b)
    }

    fn replacement_capacity(&self) -> usize {
        if self.enable_replacement_cache {
            self.replacement_candidates
        } else {
            0
        }
    }
}

impl Default for RoutingTableConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_BUCKET_SIZE_K,
            s: DEFAULT_SIBLINGS_S,
            b: 1,
            max_stale: 0,
            replacement_candidates: DEFAULT_REPLACEMENT_CANDIDATES,
            enable_replacement_cache: true,
            replacement_cache_ping: true,
            secure_maintenance: false,
            ping_new_siblings: false,
            proximity_neighbor_selection: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Network work the routing table wants done, collected by [RoutingTable::drain_actions].
pub enum RoutingAction {
    /// Confirm liveness (and authenticate) a node with a direct round trip.
    Ping(Node),
    /// Measure the round trip time of a node.
    ProximityProbe(Node),
    /// The sibling set is empty, the local node has to join the overlay again.
    Rejoin,
}

#[derive(Debug)]
enum Readmission {
    /// Pushed out of the sibling set by a closer node.
    Evicted(BucketEntry),
    /// Taken out of a replacement cache to fill a vacancy.
    Promoted(BucketEntry),
}

#[derive(Debug, Clone, Copy)]
struct Claim {
    node: Node,
    is_alive: bool,
    rtt: Option<Duration>,
    authenticated: bool,
    maintenance: bool,
}

#[derive(Debug)]
/// Kademlia routing table of one local node.
pub struct RoutingTable {
    local: Node,
    config: RoutingTableConfig,
    /// Lazily allocated, indexed by [RoutingTable::bucket_index].
    buckets: Vec<Option<KBucket>>,
    siblings: SiblingSet,
    siblings_last_usage: Option<Instant>,
    readmissions: VecDeque<Readmission>,
    actions: Vec<RoutingAction>,
    clock: Box<dyn Clock>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] for the local node.
    pub fn new(local: Node, config: RoutingTableConfig) -> Result<Self> {
        Self::with_clock(local, config, SystemClock)
    }

    /// Create a new [RoutingTable] reading `last_seen` timestamps from `clock`.
    pub fn with_clock(
        local: Node,
        config: RoutingTableConfig,
        clock: impl Clock + 'static,
    ) -> Result<Self> {
        config.validate()?;

        let mut buckets = Vec::new();
        buckets.resize_with(config.num_buckets(), || None);

        Ok(RoutingTable {
            siblings: SiblingSet::new(*local.id(), config.s),
            local,
            config,
            buckets,
            siblings_last_usage: None,
            readmissions: VecDeque::new(),
            actions: Vec::new(),
            clock: Box::new(clock),
        })
    }

    // === Getters ===

    pub fn local_node(&self) -> &Node {
        &self.local
    }

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        self.local.id()
    }

    pub fn config(&self) -> &RoutingTableConfig {
        &self.config
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Returns the bucket at `index`, if it was ever allocated.
    pub fn bucket(&self, index: usize) -> Option<&KBucket> {
        self.buckets.get(index).and_then(Option::as_ref)
    }

    /// Siblings, closest to the local node first.
    pub fn siblings(&self) -> impl Iterator<Item = &BucketEntry> {
        self.siblings.iter()
    }

    /// Bucket entries, in bucket index order.
    pub fn bucket_entries(&self) -> impl Iterator<Item = &BucketEntry> {
        self.buckets.iter().flatten().flat_map(KBucket::iter)
    }

    /// All tracked nodes, siblings first.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.siblings()
            .chain(self.bucket_entries())
            .map(BucketEntry::node)
    }

    pub fn get(&self, id: &Id) -> Option<&BucketEntry> {
        if let Some(entry) = self.siblings.get(id) {
            return Some(entry);
        }

        self.bucket_index(id, false)
            .and_then(|index| self.bucket(index))
            .and_then(|bucket| bucket.get(id))
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.get(id).is_some()
    }

    /// Return the number of nodes in this routing table.
    pub fn size(&self) -> usize {
        self.siblings.len()
            + self
                .buckets
                .iter()
                .flatten()
                .map(KBucket::len)
                .sum::<usize>()
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn max_siblings(&self) -> usize {
        self.config.s
    }

    pub fn siblings_last_usage(&self) -> Option<Instant> {
        self.siblings_last_usage
    }

    // === Public Methods ===

    /// Index of the bucket responsible for `key`, from the most significant
    /// `b` bit group in which `key` differs from the local [Id].
    ///
    /// With `first_on_layer` the first index of that group's layer is returned instead.
    /// Returns `None` for the local [Id].
    pub fn bucket_index(&self, key: &Id, first_on_layer: bool) -> Option<usize> {
        let b = self.config.b as usize;
        let per_layer = (1 << b) - 1;
        let delta = key.xor(self.local.id());

        let mut offset = ID_BITS - b;

        loop {
            let group = delta.bit_group(offset, b) as usize;

            if group != 0 {
                let layer = (offset / b) * per_layer;

                return Some(if first_on_layer {
                    layer + per_layer - 1
                } else {
                    layer + group - 1
                });
            }

            if offset < b {
                return None;
            }

            offset -= b;
        }
    }

    /// Admit a node, and return `true` if it is tracked as a sibling or bucket entry.
    ///
    /// `is_alive` means the node contacted us (or answered) directly, and `rtt` is
    /// the measured round trip if any; both together authenticate the node.
    /// `maintenance` marks claims learned during routing table maintenance, which are
    /// dropped instead of pinged when they can not be trusted.
    ///
    /// Returns `false` when the node is rejected, cached as a replacement, or
    /// deferred behind an authentication ping, see [Self::drain_actions].
    pub fn add(
        &mut self,
        node: Node,
        is_alive: bool,
        rtt: Option<Duration>,
        maintenance: bool,
    ) -> bool {
        let accepted = self.admit(Claim {
            node,
            is_alive,
            rtt,
            authenticated: is_alive && rtt.is_some(),
            maintenance,
        });

        self.process_readmissions();
        self.check_consistency("add");

        accepted
    }

    /// Admit a node that answered one of our pings, which proves it owns its
    /// address whether or not a round trip time was measured.
    pub fn authenticate(&mut self, node: Node, rtt: Option<Duration>) -> bool {
        let accepted = self.admit(Claim {
            node,
            is_alive: true,
            rtt,
            authenticated: true,
            maintenance: false,
        });

        self.process_readmissions();
        self.check_consistency("authenticate");

        accepted
    }

    /// Forget every node, and any work queued for them.
    pub fn clear(&mut self) {
        debug!(local = ?self.local.id(), size = self.size(), "Clearing routing table");

        self.buckets.iter_mut().for_each(|bucket| *bucket = None);
        self.siblings = SiblingSet::new(*self.local.id(), self.config.s);
        self.siblings_last_usage = None;
        self.readmissions.clear();
        self.actions.clear();
    }

    /// Count a timeout for `id`, evicting it once it exceeds `max_stale` timeouts
    /// or right away if `immediate`.
    ///
    /// Returns `true` if the node was tracked when called.
    pub fn timeout(&mut self, id: &Id, immediate: bool) -> bool {
        let max_stale = self.config.max_stale;

        if let Some(entry) = self.siblings.get_mut(id) {
            let stale_count = entry.mark_stale();

            if stale_count > max_stale || immediate {
                if let Some(removed) = self.siblings.remove(id) {
                    debug!(sibling = ?removed.node(), stale_count, "Evicting stale sibling");
                }

                self.after_sibling_loss();
            }

            self.check_consistency("timeout");
            return true;
        }

        let Some(index) = self.bucket_index(id, false) else {
            return false;
        };
        let Some(bucket) = self.buckets[index].as_mut() else {
            return false;
        };
        let Some(entry) = bucket.get_mut(id) else {
            return false;
        };

        let stale_count = entry.mark_stale();

        if stale_count > max_stale || immediate {
            if let Some(removed) = bucket.remove(id) {
                debug!(node = ?removed.node(), bucket = index, stale_count, "Evicting stale node");
            }

            if let Some(promoted) = bucket.pop_replacement() {
                self.readmissions
                    .push_back(Readmission::Promoted(promoted));
            }

            self.process_readmissions();
        }

        self.check_consistency("timeout");
        true
    }

    /// Remove a node from this routing table.
    pub fn remove(&mut self, id: &Id) -> Option<Node> {
        if let Some(removed) = self.siblings.remove(id) {
            self.after_sibling_loss();
            self.check_consistency("remove");

            return Some(*removed.node());
        }

        let index = self.bucket_index(id, false)?;
        let removed = self.buckets[index].as_mut()?.remove(id);

        self.check_consistency("remove");
        removed.map(|entry| *entry.node())
    }

    /// Drop the node reachable at `address`, reported dead by another node.
    ///
    /// Returns `true` if the sibling set is still non empty, meaning the
    /// reporter may try routing through us again.
    pub fn handle_failed_node(&mut self, address: SocketAddr) -> bool {
        if let Some(removed) = self.siblings.remove_by_address(address) {
            debug!(sibling = ?removed.node(), "Removing failed sibling");
            self.after_sibling_loss();
        } else {
            for bucket in self.buckets.iter_mut().flatten() {
                if let Some(removed) = bucket.remove_by_address(address) {
                    debug!(node = ?removed.node(), "Removing failed node");
                    break;
                }
            }
        }

        self.check_consistency("handle_failed_node");
        !self.siblings.is_empty()
    }

    /// Up to `want` known nodes closest to `target`, sorted by distance to it.
    ///
    /// The local node is a candidate too, unless `exclude_self`.
    pub fn closest_nodes(&self, target: &Id, want: usize, exclude_self: bool) -> Vec<Node> {
        let mut closest = ClosestNodes::new(*target, want);

        let Some(farthest_sibling) = self.siblings.last() else {
            if !exclude_self {
                closest.add(self.local);
            }

            return closest.into_iter().collect();
        };

        let main = self.bucket_index(target, false);
        let first_on_layer = self.bucket_index(target, true);
        let sibling_bucket = self.bucket_index(farthest_sibling.id(), false);

        if let Some(main) = main {
            self.collect_bucket(main, &mut closest);
        }

        // Buckets between the target's layer and the farthest sibling's bucket
        let layer_reaches_siblings = matches!(
            (first_on_layer, sibling_bucket),
            (Some(start), Some(end)) if start >= end
        );

        if layer_reaches_siblings || !closest.is_full() {
            if let (Some(start), Some(end)) = (first_on_layer, sibling_bucket) {
                for index in (end..=start).rev() {
                    if Some(index) != main {
                        self.collect_bucket(index, &mut closest);
                    }
                }
            }

            for sibling in self.siblings.iter() {
                closest.add(*sibling.node());
            }

            if !exclude_self {
                closest.add(self.local);
            }
        }

        let farther = main.map_or(0, |main| main + 1);

        for index in farther..self.buckets.len() {
            if closest.is_full() {
                break;
            }

            self.collect_bucket(index, &mut closest);
        }

        closest.into_iter().collect()
    }

    /// Whether `node` is among the `num_siblings` closest nodes to `target`.
    ///
    /// Returns `None` when this table can not tell: it has no siblings yet, or
    /// `target` is farther from the local node than all of its siblings.
    pub fn is_sibling_for(&self, node: &Node, target: &Id, num_siblings: usize) -> Option<bool> {
        let farthest = self.siblings.last()?;
        let num_siblings = num_siblings.min(self.config.s);

        if num_siblings == 0 {
            return Some(node.id() == target);
        }

        if self.siblings.len() < num_siblings {
            return Some(true);
        }

        let local = self.local.id();

        if self.siblings.is_full() && target.xor(local) > farthest.id().xor(local) {
            trace!(?target, "Not sure if the local node is a sibling");
            return None;
        }

        let mut closest = ClosestNodes::new(*target, num_siblings);

        for sibling in self.siblings.iter() {
            closest.add(*sibling.node());
        }
        closest.add(self.local);

        Some(closest.contains(node.id()))
    }

    /// Record that a lookup for `key` went through the bucket responsible for it,
    /// and through the sibling set if `key` falls within its range.
    pub fn mark_bucket_usage(&mut self, key: &Id) {
        let now = self.clock.now();

        if let Some(index) = self.bucket_index(key, false) {
            let (k, candidates) = (self.config.k, self.config.replacement_capacity());

            self.buckets[index]
                .get_or_insert_with(|| KBucket::new(k, candidates))
                .set_last_usage(now);
        }

        let local = *self.local.id();
        let in_sibling_range = self.siblings.len() < self.config.s
            || self
                .siblings
                .iter()
                .nth(self.config.s - 1)
                .map_or(true, |farthest| !local.closer(farthest.id(), key));

        if in_sibling_range {
            self.siblings_last_usage = Some(now);
        }
    }

    /// Take the pings, probes and rejoin requests queued by previous calls.
    pub fn drain_actions(&mut self) -> Vec<RoutingAction> {
        std::mem::take(&mut self.actions)
    }

    // === Private Methods ===

    fn admit(&mut self, claim: Claim) -> bool {
        let id = *claim.node.id();

        if id == *self.local.id() {
            // Do not add self to the routing_table
            return false;
        }

        let now = self.clock.now();
        let trusted = !self.config.secure_maintenance || claim.authenticated;
        let proximity = self.config.proximity_neighbor_selection;

        // Already a sibling
        if let Some(entry) = self.siblings.get_mut(&id) {
            if claim.is_alive {
                if trusted {
                    entry.refresh(claim.node, claim.rtt, claim.authenticated, now);
                } else {
                    if !claim.maintenance
                        && (entry.node().address() != claim.node.address() || !entry.ping_sent())
                    {
                        entry.set_ping_sent();
                        self.actions.push(RoutingAction::Ping(claim.node));
                    }

                    return false;
                }
            }

            return true;
        }

        let Some(index) = self.bucket_index(&id, false) else {
            return false;
        };

        // Already in its bucket
        if let Some(bucket) = self.buckets[index].as_mut() {
            if let Some(entry) = bucket.get_mut(&id) {
                if claim.is_alive {
                    if trusted {
                        let rtt_unknown = claim.rtt.or(entry.rtt()).is_none();

                        bucket.refresh(claim.node, claim.rtt, claim.authenticated, now);

                        if proximity && rtt_unknown {
                            self.actions.push(RoutingAction::ProximityProbe(claim.node));
                        }
                    } else {
                        if !claim.maintenance
                            && (entry.node().address() != claim.node.address()
                                || !entry.ping_sent())
                        {
                            entry.set_ping_sent();
                            self.actions.push(RoutingAction::Ping(claim.node));
                        }

                        return false;
                    }
                }

                return true;
            }
        }

        // Closer than the farthest sibling
        if self.siblings.is_addable(&id) {
            if !trusted {
                if !claim.maintenance || (claim.is_alive && claim.rtt.is_none()) {
                    self.actions.push(RoutingAction::Ping(claim.node));
                }

                return false;
            }

            if self.config.ping_new_siblings && !claim.is_alive {
                self.actions.push(RoutingAction::Ping(claim.node));
            } else if proximity && claim.rtt.is_none() {
                self.actions.push(RoutingAction::ProximityProbe(claim.node));
            }

            let entry = BucketEntry::new(claim.node, claim.rtt, claim.authenticated, now);

            trace!(node = ?claim.node, "Adding new sibling");

            if let Some(evicted) = self.siblings.insert(entry) {
                debug!(sibling = ?evicted.node(), "Sibling pushed out by a closer node");
                self.readmissions.push_back(Readmission::Evicted(evicted));
            }

            return true;
        }

        let (k, candidates) = (self.config.k, self.config.replacement_capacity());
        let bucket = self.buckets[index].get_or_insert_with(|| KBucket::new(k, candidates));
        let entry = BucketEntry::new(claim.node, claim.rtt, claim.authenticated, now);

        if !bucket.is_full() {
            if !trusted {
                if claim.is_alive && claim.rtt.is_none() {
                    self.actions.push(RoutingAction::Ping(claim.node));
                }

                return false;
            }

            if proximity && claim.rtt.is_none() {
                self.actions.push(RoutingAction::ProximityProbe(claim.node));
            }

            trace!(node = ?claim.node, bucket = index, "Adding new node");

            return bucket.push(entry).is_ok();
        }

        if !claim.is_alive {
            if proximity {
                self.actions.push(RoutingAction::ProximityProbe(claim.node));
            }

            return false;
        }

        let (candidate, swapped) = if proximity {
            bucket.swap_slowest(entry)
        } else {
            (entry, false)
        };

        if self.config.enable_replacement_cache && trusted {
            trace!(node = ?candidate.node(), bucket = index, "Caching replacement candidate");
            bucket.push_replacement(candidate);

            if self.config.replacement_cache_ping {
                if let Some(node) = bucket.next_unpinged() {
                    self.actions.push(RoutingAction::Ping(node));
                }
            }
        }

        swapped
    }

    fn process_readmissions(&mut self) {
        while let Some(readmission) = self.readmissions.pop_front() {
            match readmission {
                Readmission::Evicted(entry) => self.place_evicted_sibling(entry),
                Readmission::Promoted(entry) => {
                    let node = *entry.node();

                    let accepted = self.admit(Claim {
                        node,
                        is_alive: true,
                        rtt: entry.rtt(),
                        authenticated: entry.is_authenticated(),
                        maintenance: false,
                    });

                    debug!(?node, accepted, "Promoted replacement candidate");
                }
            }
        }
    }

    /// Former siblings were already trusted, they go straight into their bucket,
    /// or its replacement cache if the bucket is full.
    fn place_evicted_sibling(&mut self, entry: BucketEntry) {
        let Some(index) = self.bucket_index(entry.id(), false) else {
            return;
        };

        let (k, candidates) = (self.config.k, self.config.replacement_capacity());
        let bucket = self.buckets[index].get_or_insert_with(|| KBucket::new(k, candidates));

        if let Err(entry) = bucket.push(entry) {
            bucket.push_replacement(entry);
        }
    }

    fn after_sibling_loss(&mut self) {
        if self.siblings.is_empty() {
            error!(local = ?self.local.id(), "Lost the last sibling, the local node must rejoin");
            self.actions.push(RoutingAction::Rejoin);
        } else {
            self.refill_siblings();
        }
    }

    /// Promote the closest entry of the closest non empty bucket to sibling.
    fn refill_siblings(&mut self) {
        if self.siblings.is_empty() || self.siblings.is_full() {
            return;
        }

        let local = *self.local.id();

        for bucket in self.buckets.iter_mut().flatten() {
            let Some(closest) = bucket
                .iter()
                .min_by(|a, b| local.cmp_distance(a.id(), b.id()))
                .map(|entry| *entry.id())
            else {
                continue;
            };

            if let Some(entry) = bucket.remove(&closest) {
                debug!(sibling = ?entry.node(), "Refilled sibling set");

                if let Some(evicted) = self.siblings.insert(entry) {
                    self.readmissions.push_back(Readmission::Evicted(evicted));
                }
            }

            break;
        }

        self.process_readmissions();
    }

    fn collect_bucket(&self, index: usize, closest: &mut ClosestNodes) {
        if let Some(bucket) = self.bucket(index) {
            for entry in bucket.iter() {
                closest.add(*entry.node());
            }
        }
    }

    fn check_consistency(&self, context: &'static str) {
        if let Err(violation) = self.verify() {
            error!(context, %violation, "Routing table invariant violated");
            debug_assert!(
                false,
                "Routing table invariant violated after {context}: {violation}"
            );
        }
    }

    /// Capacity bounds, sibling ordering, disjointness, and the absence of self.
    pub(crate) fn verify(&self) -> std::result::Result<(), String> {
        let local = self.local.id();

        if self.siblings.len() > self.config.s {
            return Err(format!("{} siblings, capacity {}", self.siblings.len(), self.config.s));
        }

        let siblings = self.siblings.iter().collect::<Vec<_>>();

        for pair in siblings.windows(2) {
            if !local.closer(pair[0].id(), pair[1].id()) {
                return Err(format!("siblings out of order at {:?}", pair[1].id()));
            }
        }

        let mut seen = HashSet::with_capacity(self.size());

        for sibling in &siblings {
            if sibling.id() == local {
                return Err("local node in the sibling set".to_string());
            }

            seen.insert(*sibling.id());
        }

        for (index, bucket) in self.buckets.iter().enumerate() {
            let Some(bucket) = bucket else {
                continue;
            };

            if bucket.len() > self.config.k {
                return Err(format!("bucket {index} holds {} entries", bucket.len()));
            }

            if bucket.replacement_len() > self.config.replacement_capacity() {
                return Err(format!(
                    "bucket {index} caches {} candidates",
                    bucket.replacement_len()
                ));
            }

            for entry in bucket.iter() {
                if entry.id() == local {
                    return Err(format!("local node in bucket {index}"));
                }

                if self.bucket_index(entry.id(), false) != Some(index) {
                    return Err(format!("{:?} in the wrong bucket {index}", entry.id()));
                }

                if !seen.insert(*entry.id()) {
                    return Err(format!("{:?} tracked twice", entry.id()));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::{ManualClock, ID_SIZE};

    /// 4 bit keys, embedded in the most significant nibble.
    fn key(nibble: u8) -> Id {
        let mut bytes = [0; ID_SIZE];
        bytes[0] = nibble << 4;

        Id::from(bytes)
    }

    fn node(nibble: u8) -> Node {
        Node::new(key(nibble), SocketAddr::from(([127, 0, 0, nibble], 6881)))
    }

    fn rtt() -> Option<Duration> {
        Some(Duration::from_millis(20))
    }

    fn table(local: Node, config: RoutingTableConfig) -> RoutingTable {
        RoutingTable::new(local, config).unwrap()
    }

    fn small_config() -> RoutingTableConfig {
        RoutingTableConfig {
            k: 2,
            s: 1,
            ..Default::default()
        }
    }

    #[test]
    fn invalid_config() {
        let local = Node::random();

        for (config, expected) in [
            (
                RoutingTableConfig {
                    k: 0,
                    ..Default::default()
                },
                Error::ZeroCapacity("k"),
            ),
            (
                RoutingTableConfig {
                    s: 0,
                    ..Default::default()
                },
                Error::ZeroCapacity("s"),
            ),
            (
                RoutingTableConfig {
                    b: 3,
                    ..Default::default()
                },
                Error::InvalidBucketWidth(3),
            ),
        ] {
            assert_eq!(RoutingTable::new(local, config).unwrap_err(), expected);
        }
    }

    #[test]
    fn num_buckets() {
        for (b, expected) in [(1, 160), (2, 240), (4, 600), (8, 5100)] {
            let config = RoutingTableConfig {
                b,
                ..Default::default()
            };

            assert_eq!(config.num_buckets(), expected);
        }
    }

    #[test]
    fn bucket_index_single_bit() {
        let table = table(node(0b0110), Default::default());

        assert_eq!(table.bucket_index(&key(0b0110), false), None);
        assert_eq!(table.bucket_index(&key(0b1110), false), Some(159));
        assert_eq!(table.bucket_index(&key(0b0010), false), Some(158));
        assert_eq!(table.bucket_index(&key(0b0100), false), Some(157));
        assert_eq!(table.bucket_index(&key(0b0111), false), Some(156));

        for _ in 0..20 {
            let id = Id::random();

            assert_eq!(
                table.bucket_index(&id, false),
                Some(ID_BITS - 1 - id.shared_prefix_length(table.id()))
            );
        }
    }

    #[test]
    fn bucket_index_groups() {
        let config = RoutingTableConfig {
            b: 2,
            ..Default::default()
        };
        let table = table(node(0b0000), config);

        // Top layer (offset 158) starts at 79 * 3
        assert_eq!(table.bucket_index(&key(0b0100), false), Some(237));
        assert_eq!(table.bucket_index(&key(0b1000), false), Some(238));
        assert_eq!(table.bucket_index(&key(0b1100), false), Some(239));
        assert_eq!(table.bucket_index(&key(0b0100), true), Some(239));

        // Next layer down
        assert_eq!(table.bucket_index(&key(0b0001), false), Some(234));
        assert_eq!(table.bucket_index(&key(0b0011), false), Some(236));

        let mut last = [0; ID_SIZE];
        last[ID_SIZE - 1] = 0b11;
        assert_eq!(table.bucket_index(&Id::from(last), false), Some(2));
        assert_eq!(table.bucket_index(&Id::from(last), true), Some(2));
    }

    #[test]
    fn table_is_empty() {
        let mut table = table(Node::random(), Default::default());
        assert!(table.is_empty());

        table.add(Node::random(), true, rtt(), false);
        assert!(!table.is_empty());
    }

    #[test]
    fn should_not_add_self() {
        let local = Node::random();
        let mut table = table(local, Default::default());

        assert!(!table.add(local, true, rtt(), false));
        assert!(table.is_empty())
    }

    #[test]
    fn buckets_are_sets() {
        let mut table = table(Node::random(), Default::default());

        let node1 = Node::random();
        let node2 = Node::new(*node1.id(), node1.address());

        assert!(table.add(node1, true, rtt(), false));
        assert!(table.add(node2, true, rtt(), false));

        assert_eq!(table.size(), 1);
    }

    #[test]
    fn four_bit_keyspace() {
        let mut table = table(node(0b0110), small_config());

        for nibble in [0b0111, 0b0100, 0b1110, 0b0010] {
            assert!(table.add(node(nibble), true, rtt(), false));
        }

        let siblings = table.siblings().map(|e| *e.id()).collect::<Vec<_>>();
        assert_eq!(siblings, vec![key(0b0111)]);

        assert!(table.bucket(157).unwrap().contains(&key(0b0100)));
        assert!(table.bucket(158).unwrap().contains(&key(0b0010)));
        assert!(table.bucket(159).unwrap().contains(&key(0b1110)));

        assert_eq!(table.size(), 4);
        assert!(table.verify().is_ok());
    }

    #[test]
    fn closer_node_evicts_farthest_sibling_into_bucket() {
        let mut table = table(node(0b0110), small_config());

        assert!(table.add(node(0b0100), true, rtt(), false));
        assert!(table.siblings().any(|e| e.id() == &key(0b0100)));

        assert!(table.add(node(0b0111), true, rtt(), false));

        let siblings = table.siblings().map(|e| *e.id()).collect::<Vec<_>>();
        assert_eq!(siblings, vec![key(0b0111)]);
        assert!(table.bucket(157).unwrap().contains(&key(0b0100)));
    }

    #[test]
    fn refresh_moves_entry_to_tail() {
        let clock = ManualClock::default();
        let mut table =
            RoutingTable::with_clock(node(0b0110), small_config(), clock.clone()).unwrap();

        // 0111 is the sibling, 1110 and 1111 share bucket 159
        table.add(node(0b0111), true, rtt(), false);
        table.add(node(0b1110), true, rtt(), false);
        table.add(node(0b1111), true, None, false);

        let before = table.get(&key(0b1110)).unwrap().last_seen();
        clock.advance(Duration::from_secs(10));

        assert!(table.add(node(0b1110), true, None, false));

        let bucket = table.bucket(159).unwrap();
        let order = bucket.iter().map(|e| *e.id()).collect::<Vec<_>>();
        assert_eq!(order, vec![key(0b1111), key(0b1110)]);

        let refreshed = table.get(&key(0b1110)).unwrap();
        assert_eq!(refreshed.last_seen(), before + Duration::from_secs(10));
        assert_eq!(refreshed.rtt(), rtt());
    }

    #[test]
    fn not_alive_claims_do_not_refresh() {
        let config = RoutingTableConfig {
            max_stale: 3,
            ..small_config()
        };
        let mut table = table(node(0b0110), config);

        table.add(node(0b0111), true, rtt(), false);
        table.add(node(0b1110), true, rtt(), false);
        table.timeout(&key(0b1110), false);

        assert!(table.add(node(0b1110), false, None, false));
        assert_eq!(table.get(&key(0b1110)).unwrap().stale_count(), 1);

        assert!(table.add(node(0b1110), true, None, false));
        assert_eq!(table.get(&key(0b1110)).unwrap().stale_count(), 0);
    }

    #[test]
    fn full_bucket_caches_replacements() {
        let mut table = table(node(0b0110), small_config());

        table.add(node(0b0111), true, rtt(), false);

        // Bucket 159 holds keys starting with 1
        assert!(table.add(node(0b1000), true, rtt(), false));
        assert!(table.add(node(0b1001), true, rtt(), false));
        assert!(!table.add(node(0b1010), true, rtt(), false));
        assert!(!table.add(node(0b1011), true, rtt(), false));

        // Not alive nodes are not cached
        assert!(!table.add(node(0b1100), false, None, false));

        let bucket = table.bucket(159).unwrap();
        assert_eq!(bucket.len(), 2);

        let cached = bucket.replacements().map(|e| *e.id()).collect::<Vec<_>>();
        assert_eq!(cached, vec![key(0b1011), key(0b1010)]);

        // Each caching pings one bucket entry that was not pinged yet
        assert_eq!(
            table.drain_actions(),
            vec![
                RoutingAction::Ping(node(0b1000)),
                RoutingAction::Ping(node(0b1001)),
            ]
        );
        assert!(table.drain_actions().is_empty());
    }

    #[test]
    fn eviction_promotes_newest_replacement() {
        let mut table = table(node(0b0110), small_config());

        table.add(node(0b0111), true, rtt(), false);
        table.add(node(0b1000), true, rtt(), false);
        table.add(node(0b1001), true, rtt(), false);
        table.add(node(0b1010), true, rtt(), false);
        table.add(node(0b1011), true, rtt(), false);

        assert!(table.timeout(&key(0b1000), false));

        let bucket = table.bucket(159).unwrap();
        let entries = bucket.iter().map(|e| *e.id()).collect::<Vec<_>>();
        assert_eq!(entries, vec![key(0b1001), key(0b1011)]);

        let cached = bucket.replacements().map(|e| *e.id()).collect::<Vec<_>>();
        assert_eq!(cached, vec![key(0b1010)]);

        assert!(table.verify().is_ok());
    }

    #[test]
    fn stale_count_tolerance() {
        let config = RoutingTableConfig {
            max_stale: 1,
            ..small_config()
        };
        let mut table = table(node(0b0110), config);

        table.add(node(0b0111), true, rtt(), false);
        table.add(node(0b1000), true, rtt(), false);

        assert!(table.timeout(&key(0b1000), false));
        assert!(table.contains(&key(0b1000)));

        assert!(table.timeout(&key(0b1000), false));
        assert!(!table.contains(&key(0b1000)));

        assert!(!table.timeout(&key(0b1000), false));

        table.add(node(0b1000), true, rtt(), false);
        assert!(table.timeout(&key(0b1000), true));
        assert!(!table.contains(&key(0b1000)));
    }

    #[test]
    fn sibling_timeout_refills_from_buckets() {
        let config = RoutingTableConfig {
            k: 2,
            s: 2,
            ..Default::default()
        };
        let mut table = table(node(0b0110), config);

        for nibble in [0b0111, 0b0100, 0b0010, 0b1110] {
            table.add(node(nibble), true, rtt(), false);
        }

        let siblings = table.siblings().map(|e| *e.id()).collect::<Vec<_>>();
        assert_eq!(siblings, vec![key(0b0111), key(0b0100)]);

        assert!(table.timeout(&key(0b0111), false));

        let siblings = table.siblings().map(|e| *e.id()).collect::<Vec<_>>();
        assert_eq!(siblings, vec![key(0b0100), key(0b0010)]);
        assert!(!table.bucket(158).unwrap().contains(&key(0b0010)));

        assert!(table.verify().is_ok());
    }

    #[test]
    fn losing_last_sibling_requests_rejoin() {
        let mut table = table(node(0b0110), small_config());

        table.add(node(0b0111), true, rtt(), false);
        table.drain_actions();

        assert!(table.timeout(&key(0b0111), false));

        assert_eq!(table.siblings().count(), 0);
        assert_eq!(table.drain_actions(), vec![RoutingAction::Rejoin]);
    }

    #[test]
    fn secure_maintenance_requires_authentication() {
        let config = RoutingTableConfig {
            secure_maintenance: true,
            ..small_config()
        };
        let mut table = table(node(0b0110), config);

        // Learned from a third party: pinged, not trusted yet.
        assert!(!table.add(node(0b0111), false, None, false));
        assert_eq!(table.drain_actions(), vec![RoutingAction::Ping(node(0b0111))]);
        assert!(table.is_empty());

        // Maintenance claims are dropped without a ping.
        assert!(!table.add(node(0b0111), false, None, true));
        assert!(table.drain_actions().is_empty());

        // The ping response authenticates it.
        assert!(table.add(node(0b0111), true, rtt(), false));
        assert!(table.get(&key(0b0111)).unwrap().is_authenticated());

        // A known sibling claimed from a new address is pinged there, once.
        let moved = Node::new(key(0b0111), SocketAddr::from(([127, 0, 0, 99], 6881)));
        assert!(!table.add(moved, true, None, false));
        assert_eq!(table.drain_actions(), vec![RoutingAction::Ping(moved)]);
        assert_eq!(
            table.get(&key(0b0111)).unwrap().node().address(),
            node(0b0111).address()
        );
    }

    #[test]
    fn answered_ping_authenticates_without_rtt() {
        let config = RoutingTableConfig {
            secure_maintenance: true,
            ..small_config()
        };
        let mut table = table(node(0b0110), config);

        assert!(!table.add(node(0b0111), true, None, false));
        assert_eq!(table.drain_actions(), vec![RoutingAction::Ping(node(0b0111))]);

        assert!(table.authenticate(node(0b0111), None));
        assert!(table.get(&key(0b0111)).unwrap().is_authenticated());
        assert!(table.drain_actions().is_empty());

        // Later unmeasured contact refreshes without another ping.
        assert!(table.add(node(0b0100), true, rtt(), false));
        assert!(table.authenticate(node(0b0100), None));
        assert!(table.drain_actions().is_empty());
    }

    #[test]
    fn clear() {
        let mut table = table(node(0b0110), small_config());

        for nibble in [0b0111, 0b0100, 0b1110] {
            table.add(node(nibble), true, rtt(), false);
        }
        table.timeout(&key(0b0111), true);
        assert!(!table.is_empty());

        table.clear();

        assert!(table.is_empty());
        assert_eq!(table.siblings().count(), 0);
        assert!(table.drain_actions().is_empty());
        assert!(table.closest_nodes(&key(0b1110), 8, true).is_empty());

        // Back in business once a node shows up again.
        assert!(table.add(node(0b1110), true, rtt(), false));
        assert_eq!(table.siblings().count(), 1);
    }

    #[test]
    fn ping_new_siblings() {
        let config = RoutingTableConfig {
            ping_new_siblings: true,
            ..small_config()
        };
        let mut table = table(node(0b0110), config);

        assert!(table.add(node(0b0111), false, None, false));
        assert_eq!(table.drain_actions(), vec![RoutingAction::Ping(node(0b0111))]);
    }

    #[test]
    fn handle_failed_node() {
        let config = RoutingTableConfig {
            k: 2,
            s: 2,
            ..Default::default()
        };
        let mut table = table(node(0b0110), config);

        for nibble in [0b0111, 0b0100, 0b0010, 0b1110] {
            table.add(node(nibble), true, rtt(), false);
        }

        assert!(table.handle_failed_node(node(0b1110).address()));
        assert!(!table.contains(&key(0b1110)));

        assert!(table.handle_failed_node(node(0b0111).address()));
        assert!(!table.contains(&key(0b0111)));
        assert_eq!(table.siblings().count(), 2);

        assert!(table.handle_failed_node(node(0b0100).address()));
        assert!(!table.handle_failed_node(node(0b0010).address()));
        assert!(table.is_empty());
    }

    #[test]
    fn remove() {
        let mut table = table(Node::random(), Default::default());

        let node = Node::random();

        table.add(node, true, rtt(), false);
        assert!(table.contains(node.id()));

        assert_eq!(table.remove(node.id()), Some(node));
        assert!(!table.contains(node.id()));
        assert_eq!(table.remove(node.id()), None);
    }

    #[test]
    fn closest_nodes_sorted_bounded_deterministic() {
        let mut table = table(Node::random(), Default::default());

        for i in 0..200 {
            table.add(Node::unique(i), true, rtt(), false);
        }

        for _ in 0..10 {
            let target = Id::random();
            let closest = table.closest_nodes(&target, 8, false);

            assert!(closest.len() <= 8);
            assert!(closest
                .windows(2)
                .all(|pair| target.closer(pair[0].id(), pair[1].id())));

            assert_eq!(closest, table.closest_nodes(&target, 8, false));
        }
    }

    #[test]
    fn closest_nodes_exhausts_small_table() {
        let config = RoutingTableConfig {
            k: 20,
            ..Default::default()
        };
        let local = Node::random();
        let mut table = table(local, config);

        let mut all = (0..30).map(Node::unique).collect::<Vec<_>>();

        for node in &all {
            table.add(*node, true, rtt(), false);
        }

        let tracked = table.nodes().copied().collect::<Vec<_>>();
        all.retain(|node| tracked.contains(node));

        let target = Id::random();

        let mut expected = all.clone();
        expected.sort_by(|a, b| target.cmp_distance(a.id(), b.id()));
        assert_eq!(table.closest_nodes(&target, 100, true), expected);

        expected.push(local);
        expected.sort_by(|a, b| target.cmp_distance(a.id(), b.id()));
        assert_eq!(table.closest_nodes(&target, 100, false), expected);
    }

    #[test]
    fn closest_nodes_of_empty_table() {
        let local = Node::random();
        let table = table(local, Default::default());

        assert_eq!(table.closest_nodes(&Id::random(), 8, false), vec![local]);
        assert!(table.closest_nodes(&Id::random(), 8, true).is_empty());
    }

    #[test]
    fn is_sibling_for() {
        let local = node(0b0110);
        let config = RoutingTableConfig {
            k: 2,
            s: 2,
            ..Default::default()
        };
        let mut table = table(local, config);

        // Not ready
        assert_eq!(table.is_sibling_for(&local, &key(0b0110), 1), None);

        table.add(node(0b0111), true, rtt(), false);

        // Zero siblings: only the exact key
        assert_eq!(table.is_sibling_for(&local, &key(0b0110), 0), Some(true));
        assert_eq!(table.is_sibling_for(&local, &key(0b0111), 0), Some(false));

        // Fewer siblings known than asked for
        assert_eq!(table.is_sibling_for(&local, &key(0b1111), 2), Some(true));

        table.add(node(0b0100), true, rtt(), false);

        // Farther than the farthest sibling: uncertain
        assert_eq!(table.is_sibling_for(&local, &key(0b1111), 2), None);

        // Among siblings and self, 0110 and 0111 are the closest to 0111
        assert_eq!(table.is_sibling_for(&local, &key(0b0111), 2), Some(true));
        assert_eq!(table.is_sibling_for(&local, &key(0b0111), 1), Some(false));
        assert_eq!(table.is_sibling_for(&node(0b0100), &key(0b0111), 2), Some(false));
    }

    #[test]
    fn mark_bucket_usage() {
        let mut table = table(node(0b0110), small_config());
        table.add(node(0b0111), true, rtt(), false);

        table.mark_bucket_usage(&key(0b1110));

        assert!(table.bucket(159).unwrap().last_usage().is_some());
        assert!(table.siblings_last_usage().is_none());

        table.mark_bucket_usage(&key(0b0111));
        assert!(table.siblings_last_usage().is_some());
    }

    #[test]
    fn bounds_hold_under_churn() {
        let config = RoutingTableConfig {
            k: 4,
            s: 4,
            replacement_candidates: 2,
            ..Default::default()
        };
        let mut table = table(Node::random(), config);

        let nodes = (0..300).map(Node::unique).collect::<Vec<_>>();

        for (i, node) in nodes.iter().enumerate() {
            table.add(*node, i % 3 != 0, rtt(), false);

            if i % 5 == 0 {
                table.timeout(nodes[i / 2].id(), i % 10 == 0);
            }

            assert!(table.verify().is_ok());
        }

        assert!(table.siblings().count() <= 4);
        assert!((0..table.num_buckets())
            .filter_map(|index| table.bucket(index))
            .all(|bucket| bucket.len() <= 4 && bucket.replacement_len() <= 2));
    }
}
