//! K-buckets, their replacement caches, and the sibling set

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::slice::Iter;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::common::{Id, Node};

#[derive(Debug, Clone, PartialEq, Eq)]
/// A [Node] tracked by the routing table, with its liveness bookkeeping.
pub struct BucketEntry {
    node: Node,
    stale_count: u8,
    last_seen: Instant,
    rtt: Option<Duration>,
    ping_sent: bool,
    authenticated: bool,
}

impl BucketEntry {
    pub fn new(node: Node, rtt: Option<Duration>, authenticated: bool, now: Instant) -> Self {
        Self {
            node,
            stale_count: 0,
            last_seen: now,
            rtt,
            ping_sent: false,
            authenticated,
        }
    }

    // === Getters ===

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn id(&self) -> &Id {
        self.node.id()
    }

    /// Number of timeouts since the last confirmed contact.
    pub fn stale_count(&self) -> u8 {
        self.stale_count
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Last measured round trip time, if any.
    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    /// Whether a liveness ping was sent to this entry and is not answered yet.
    pub fn ping_sent(&self) -> bool {
        self.ping_sent
    }

    /// Whether this entry was confirmed by a direct round trip.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    // === Public Methods ===

    /// Fresh confirmed contact: reset staleness and take the incoming address.
    ///
    /// A missing `rtt` keeps the previously measured one.
    pub(crate) fn refresh(
        &mut self,
        node: Node,
        rtt: Option<Duration>,
        authenticated: bool,
        now: Instant,
    ) {
        self.node = node;
        self.stale_count = 0;
        self.last_seen = now;
        self.rtt = rtt.or(self.rtt);
        self.ping_sent = false;
        self.authenticated |= authenticated;
    }

    /// Increments the stale counter, and returns the new count.
    pub(crate) fn mark_stale(&mut self) -> u8 {
        self.stale_count = self.stale_count.saturating_add(1);
        self.ping_sent = false;

        self.stale_count
    }

    pub(crate) fn set_ping_sent(&mut self) {
        self.ping_sent = true;
    }
}

/// Kbuckets are similar to LRU caches that checks and evicts unresponsive nodes,
/// without dropping any responsive nodes in the process.
///
/// Live nodes seen while the bucket is full wait in a bounded replacement cache,
/// newest first, to fill the next vacancy.
#[derive(Debug)]
pub struct KBucket {
    capacity: usize,
    /// Entries in the k-bucket, sorted by the least recently seen.
    entries: Vec<BucketEntry>,
    replacement_cache: Option<LruCache<Id, BucketEntry>>,
    last_usage: Option<Instant>,
}

impl KBucket {
    /// Create an empty bucket holding up to `capacity` entries, and up to
    /// `replacement_candidates` waiting candidates (zero disables the cache).
    pub fn new(capacity: usize, replacement_candidates: usize) -> Self {
        KBucket {
            capacity,
            entries: Vec::with_capacity(capacity),
            replacement_cache: NonZeroUsize::new(replacement_candidates).map(LruCache::new),
            last_usage: None,
        }
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn iter(&self) -> Iter<'_, BucketEntry> {
        self.entries.iter()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.position(id).is_some()
    }

    pub fn get(&self, id: &Id) -> Option<&BucketEntry> {
        self.entries.iter().find(|entry| entry.id() == id)
    }

    /// Number of candidates waiting in the replacement cache.
    pub fn replacement_len(&self) -> usize {
        self.replacement_cache.as_ref().map_or(0, |cache| cache.len())
    }

    /// Replacement candidates, newest first.
    pub fn replacements(&self) -> impl Iterator<Item = &BucketEntry> {
        self.replacement_cache
            .iter()
            .flat_map(|cache| cache.iter().map(|(_, entry)| entry))
    }

    pub fn last_usage(&self) -> Option<Instant> {
        self.last_usage
    }

    // === Public Methods ===

    /// Append an entry as the most recently seen one.
    ///
    /// Returns the entry back if the bucket is full.
    pub(crate) fn push(&mut self, entry: BucketEntry) -> Result<(), BucketEntry> {
        if self.is_full() {
            return Err(entry);
        }

        self.remove_replacement(entry.id());
        self.entries.push(entry);

        Ok(())
    }

    /// Refresh an existing entry and move it to the tail, returns `false` if
    /// it is not in this bucket.
    pub(crate) fn refresh(
        &mut self,
        node: Node,
        rtt: Option<Duration>,
        authenticated: bool,
        now: Instant,
    ) -> bool {
        let Some(index) = self.position(node.id()) else {
            return false;
        };

        let mut entry = self.entries.remove(index);
        entry.refresh(node, rtt, authenticated, now);
        self.entries.push(entry);

        true
    }

    pub(crate) fn position(&self, id: &Id) -> Option<usize> {
        self.entries.iter().position(|entry| entry.id() == id)
    }

    pub(crate) fn get_mut(&mut self, id: &Id) -> Option<&mut BucketEntry> {
        self.entries.iter_mut().find(|entry| entry.id() == id)
    }

    pub(crate) fn remove(&mut self, id: &Id) -> Option<BucketEntry> {
        self.position(id).map(|index| self.entries.remove(index))
    }

    pub(crate) fn remove_by_address(&mut self, address: SocketAddr) -> Option<BucketEntry> {
        self.entries
            .iter()
            .position(|entry| entry.node().address() == address)
            .map(|index| self.entries.remove(index))
    }

    /// The first entry that was not pinged yet, marked as pinged.
    pub(crate) fn next_unpinged(&mut self) -> Option<Node> {
        let entry = self.entries.iter_mut().find(|entry| !entry.ping_sent())?;
        entry.set_ping_sent();

        Some(*entry.node())
    }

    /// Swap the entry with the worst round trip time for `incoming` if the incoming
    /// one is faster, returning whichever entry ends up outside of the bucket.
    pub(crate) fn swap_slowest(&mut self, incoming: BucketEntry) -> (BucketEntry, bool) {
        let Some(incoming_rtt) = incoming.rtt() else {
            return (incoming, false);
        };

        let slowest = self
            .entries
            .iter()
            .enumerate()
            .max_by_key(|(_, entry)| entry.rtt().unwrap_or(Duration::MAX))
            .map(|(index, entry)| (index, entry.rtt().unwrap_or(Duration::MAX)));

        match slowest {
            Some((index, rtt)) if rtt > incoming_rtt => {
                let kicked = self.entries.remove(index);
                self.entries.push(incoming);

                (kicked, true)
            }
            _ => (incoming, false),
        }
    }

    /// Remember a live candidate, dropping the oldest one past capacity.
    pub(crate) fn push_replacement(&mut self, entry: BucketEntry) {
        if let Some(cache) = self.replacement_cache.as_mut() {
            cache.push(*entry.id(), entry);
        }
    }

    /// Take the newest replacement candidate out of the cache.
    pub(crate) fn pop_replacement(&mut self) -> Option<BucketEntry> {
        let cache = self.replacement_cache.as_mut()?;
        let newest = *cache.iter().next()?.0;

        cache.pop(&newest)
    }

    pub(crate) fn set_last_usage(&mut self, now: Instant) {
        self.last_usage = Some(now);
    }

    // === Private Methods ===

    fn remove_replacement(&mut self, id: &Id) {
        if let Some(cache) = self.replacement_cache.as_mut() {
            cache.pop(id);
        }
    }
}

/// The nodes closest to the local node, sorted by their distance to it.
#[derive(Debug)]
pub struct SiblingSet {
    local: Id,
    capacity: usize,
    entries: Vec<BucketEntry>,
}

impl SiblingSet {
    pub fn new(local: Id, capacity: usize) -> Self {
        SiblingSet {
            local,
            capacity,
            entries: Vec::with_capacity(capacity),
        }
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> Iter<'_, BucketEntry> {
        self.entries.iter()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.position(id).is_some()
    }

    pub fn get(&self, id: &Id) -> Option<&BucketEntry> {
        self.position(id).map(|index| &self.entries[index])
    }

    /// The farthest sibling.
    pub fn last(&self) -> Option<&BucketEntry> {
        self.entries.last()
    }

    /// Returns `true` if the set has room, or `id` is closer than the farthest sibling.
    pub fn is_addable(&self, id: &Id) -> bool {
        if self.capacity == 0 {
            return false;
        }

        match self.entries.last() {
            Some(last) if self.is_full() => self.local.closer(id, last.id()),
            _ => true,
        }
    }

    // === Public Methods ===

    /// Insert at the sorted position, returning the farthest sibling if it got
    /// pushed out of a full set.
    pub(crate) fn insert(&mut self, entry: BucketEntry) -> Option<BucketEntry> {
        let local = self.local;

        let index = self
            .entries
            .binary_search_by(|probe| local.cmp_distance(probe.id(), entry.id()))
            .unwrap_or_else(|index| index);

        self.entries.insert(index, entry);

        if self.entries.len() > self.capacity {
            return self.entries.pop();
        }

        None
    }

    pub(crate) fn get_mut(&mut self, id: &Id) -> Option<&mut BucketEntry> {
        self.position(id).map(|index| &mut self.entries[index])
    }

    pub(crate) fn remove(&mut self, id: &Id) -> Option<BucketEntry> {
        self.position(id).map(|index| self.entries.remove(index))
    }

    pub(crate) fn remove_by_address(&mut self, address: SocketAddr) -> Option<BucketEntry> {
        self.entries
            .iter()
            .position(|entry| entry.node().address() == address)
            .map(|index| self.entries.remove(index))
    }

    // === Private Methods ===

    fn position(&self, id: &Id) -> Option<usize> {
        let local = self.local;

        self.entries
            .binary_search_by(|probe| local.cmp_distance(probe.id(), id))
            .ok()
    }
}
