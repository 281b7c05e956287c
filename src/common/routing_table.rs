//! Simplified Kademlia routing table

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::common::{ClosestNodes, Id, Node, NodeState, NodeStatus, MAX_DISTANCE};

/// K = the default maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 8;

#[derive(Debug, Clone)]
/// Simplified Kademlia routing table.
///
/// Instead of splitting buckets, nodes are grouped by their [Id::distance]
/// to this node's id, giving one bucket per shared prefix length.
pub struct RoutingTable {
    id: Id,
    buckets: BTreeMap<u8, KBucket>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id.
    pub fn new(id: Id) -> Self {
        let buckets = BTreeMap::new();

        RoutingTable { id, buckets }
    }

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    // === Public Methods ===

    /// Attempts to add a node to this routing table.
    ///
    /// Returns the node as it is stored in the table, which may be the
    /// pre-existing entry, or `None` if the node was rejected.
    pub fn add(&mut self, node: Node) -> Option<&Node> {
        self.add_at(node, Instant::now())
    }

    pub(crate) fn add_at(&mut self, node: Node, now: Instant) -> Option<&Node> {
        let distance = self.id.distance(node.id());

        if distance == 0 {
            // Do not add self to the routing_table
            return None;
        }

        let bucket = self
            .buckets
            .entry(distance)
            .or_insert_with(|| KBucket::new(now));

        bucket.add(node, now)
    }

    /// Remove a node from this routing table.
    pub fn remove(&mut self, node_id: &Id) -> Option<Node> {
        let distance = self.id.distance(node_id);

        self.buckets
            .get_mut(&distance)
            .and_then(|bucket| bucket.remove(node_id))
    }

    pub fn has(&self, node_id: &Id) -> bool {
        self.get(node_id).is_some()
    }

    pub fn get(&self, node_id: &Id) -> Option<&Node> {
        self.entry(node_id).map(|entry| &entry.node)
    }

    /// Bookkeeping of a known node.
    pub fn state(&self, node_id: &Id) -> Option<&NodeState> {
        self.entry(node_id).map(|entry| &entry.state)
    }

    pub fn state_mut(&mut self, node_id: &Id) -> Option<&mut NodeState> {
        let distance = self.id.distance(node_id);

        self.buckets
            .get_mut(&distance)
            .and_then(|bucket| bucket.entries.iter_mut().find(|e| e.node.id() == node_id))
            .map(|entry| &mut entry.state)
    }

    /// Return up to `max_nodes` known nodes sorted by ascending XOR distance to `target`,
    /// skipping `exclude` if given.
    pub fn closest_nodes(&self, target: &Id, max_nodes: usize, exclude: Option<&Id>) -> Vec<Node> {
        let mut closest = ClosestNodes::new(*target);

        for node in self.nodes() {
            if Some(node.id()) != exclude {
                closest.add(node.clone());
            }
        }

        closest.truncate(max_nodes);
        closest.into_iter().collect()
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|bucket| bucket.is_empty())
    }

    /// Return the number of nodes in this routing table.
    pub fn size(&self) -> usize {
        self.buckets
            .values()
            .fold(0, |acc, bucket| acc + bucket.entries.len())
    }

    /// Returns an iterator over the nodes in this routing table.
    pub fn nodes(&self) -> RoutingTableIterator<'_> {
        RoutingTableIterator {
            bucket_index: 1,
            node_index: 0,
            table: self,
        }
    }

    /// Returns an iterator over the nodes and their bookkeeping.
    pub fn entries(&self) -> impl Iterator<Item = (&Node, &NodeState)> {
        self.buckets
            .values()
            .flat_map(|bucket| bucket.entries.iter().map(|e| (&e.node, &e.state)))
    }

    /// Distances of buckets that did not change for longer than `max_age`.
    pub fn stale_buckets(&self, now: Instant, max_age: Duration) -> Vec<u8> {
        self.buckets
            .iter()
            .filter(|(_, bucket)| now.duration_since(bucket.last_changed) > max_age)
            .map(|(distance, _)| *distance)
            .collect()
    }

    /// Mark a bucket as recently refreshed.
    pub fn touch_bucket(&mut self, distance: u8, now: Instant) {
        if let Some(bucket) = self.buckets.get_mut(&distance) {
            bucket.last_changed = now;
        }
    }

    // === Private Methods ===

    fn entry(&self, node_id: &Id) -> Option<&Entry> {
        let distance = self.id.distance(node_id);

        self.buckets
            .get(&distance)
            .and_then(|bucket| bucket.entries.iter().find(|e| e.node.id() == node_id))
    }
}

pub struct RoutingTableIterator<'a> {
    bucket_index: u8,
    node_index: usize,
    table: &'a RoutingTable,
}

impl<'a> Iterator for RoutingTableIterator<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<Self::Item> {
        while self.bucket_index <= MAX_DISTANCE {
            if let Some(current_bucket) = self.table.buckets.get(&self.bucket_index) {
                if let Some(current) = current_bucket.entries.get(self.node_index) {
                    self.node_index += 1;

                    if self.node_index == current_bucket.entries.len() {
                        self.node_index = 0;
                        self.bucket_index = self.bucket_index.saturating_add(1);
                    }

                    return Some(&current.node);
                }
            };

            self.node_index = 0;

            if self.bucket_index == MAX_DISTANCE {
                break;
            }
            self.bucket_index += 1;
        }

        None
    }
}

#[derive(Debug, Clone)]
struct Entry {
    node: Node,
    state: NodeState,
}

/// Kbuckets are similar to LRU caches that checks and evicts unresponsive nodes,
/// without dropping any responsive nodes in the process.
#[derive(Debug, Clone)]
pub struct KBucket {
    /// Nodes in the k-bucket, sorted by the least recently seen.
    entries: Vec<Entry>,
    last_changed: Instant,
}

impl KBucket {
    pub fn new(now: Instant) -> Self {
        KBucket {
            entries: Vec::with_capacity(MAX_BUCKET_SIZE_K),
            last_changed: now,
        }
    }

    // === Public Methods ===

    pub fn add(&mut self, incoming: Node, now: Instant) -> Option<&Node> {
        if let Some(index) = self.entries.iter().position(|e| e.node.id() == incoming.id()) {
            // Same id means same key and ip; accept a changed port, keep the bookkeeping.
            let mut existing = self.entries.remove(index);
            existing.node = incoming;
            self.entries.push(existing);
        } else if self.entries.len() < MAX_BUCKET_SIZE_K {
            self.entries.push(Entry {
                node: incoming,
                state: NodeState::new(),
            });
        } else if let Some(index) = self
            .entries
            .iter()
            .position(|e| e.state.status(now) == NodeStatus::Bad)
        {
            // Replace the least recently seen bad node.
            self.entries.remove(index);
            self.entries.push(Entry {
                node: incoming,
                state: NodeState::new(),
            });
        } else {
            return None;
        }

        self.last_changed = now;

        self.entries.last().map(|e| &e.node)
    }

    pub fn remove(&mut self, node_id: &Id) -> Option<Node> {
        let index = self.entries.iter().position(|e| e.node.id() == node_id)?;

        Some(self.entries.remove(index).node)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
