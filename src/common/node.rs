//! Struct and implementation of the Node entry in the Kademlia routing table
use std::{
    collections::VecDeque,
    fmt::{self, Debug, Display, Formatter},
    net::SocketAddrV4,
    time::{Duration, Instant},
};

use crate::common::Id;

/// Size of an ed25519 public key.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Maximum number of queries a node can send within [NODE_LIMIT_INTERVAL]
/// before it is considered blocked.
pub const NODE_LIMIT_QUERIES: usize = 10;
pub const NODE_LIMIT_INTERVAL: Duration = Duration::from_secs(5);

/// Number of consecutive timeouts after which a node is considered bad.
pub const MAX_NODE_FAILURES: u8 = 3;
/// How long after its last response a node is still considered good.
pub const NODE_STATUS_GOOD: Duration = Duration::from_secs(15 * 60);

/// Smoothing factor for the round trip time estimate.
const RTT_ALPHA: f64 = 0.2;

/// ed25519 public key bytes.
pub type PublicKey = [u8; PUBLIC_KEY_SIZE];

#[derive(Clone, PartialEq, Eq, Hash)]
/// Identity of a peer: the id derived from its public key and address.
pub struct Node {
    id: Id,
    public_key: PublicKey,
    address: SocketAddrV4,
}

impl Node {
    /// Creates a new Node from a public key and the address it was observed at.
    pub fn new(public_key: PublicKey, address: SocketAddrV4) -> Node {
        Node {
            id: Id::from_public_key(&public_key, address.ip()),
            public_key,
            address,
        }
    }

    /// Creates a node with a random key and address, for testing.
    #[cfg(test)]
    pub fn random() -> Node {
        use rand::Rng;

        let mut rng = rand::thread_rng();

        Node::new(
            rng.gen(),
            SocketAddrV4::new(rng.gen::<u32>().into(), rng.gen()),
        )
    }

    /// Creates a deterministic node for the `i`th position, for testing.
    #[cfg(test)]
    pub fn unique(i: usize) -> Node {
        let mut public_key = [0_u8; PUBLIC_KEY_SIZE];
        public_key[..8].copy_from_slice(&(i as u64).to_be_bytes());

        Node::new(
            public_key,
            SocketAddrV4::new([127, 0, 0, 1].into(), 10_000 + i as u16),
        )
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Node<{}, {}>", self.address, self.id)
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Responded recently without failing since.
    Good,
    /// Never responded, or not for a while.
    Unknown,
    /// Failed to respond [MAX_NODE_FAILURES] times in a row.
    Bad,
}

/// Mutable bookkeeping for a node, kept by the routing table under the node's [Id].
#[derive(Debug, Clone)]
pub struct NodeState {
    failed: u8,
    last_response: Option<Instant>,
    rtt: Option<Duration>,
    last_queries: VecDeque<Instant>,
}

impl NodeState {
    pub fn new() -> Self {
        Self {
            failed: 0,
            last_response: None,
            rtt: None,
            last_queries: VecDeque::with_capacity(NODE_LIMIT_QUERIES),
        }
    }

    // === Getters ===

    /// Consecutive timeouts since the last response.
    pub fn failed(&self) -> u8 {
        self.failed
    }

    pub fn last_response(&self) -> Option<Instant> {
        self.last_response
    }

    /// Smoothed round trip time.
    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    pub fn status(&self, now: Instant) -> NodeStatus {
        if self.failed >= MAX_NODE_FAILURES {
            return NodeStatus::Bad;
        }

        match self.last_response {
            Some(last) if self.failed == 0 && now.duration_since(last) < NODE_STATUS_GOOD => {
                NodeStatus::Good
            }
            _ => NodeStatus::Unknown,
        }
    }

    /// Returns `true` if this node sent more than [NODE_LIMIT_QUERIES] within
    /// the last [NODE_LIMIT_INTERVAL].
    pub fn is_blocked(&self, now: Instant) -> bool {
        self.last_queries.len() == NODE_LIMIT_QUERIES
            && self
                .last_queries
                .front()
                .map(|first| now.duration_since(*first) < NODE_LIMIT_INTERVAL)
                .unwrap_or(false)
    }

    // === Public Methods ===

    pub fn record_query(&mut self, now: Instant) {
        if self.last_queries.len() == NODE_LIMIT_QUERIES {
            self.last_queries.pop_front();
        }
        self.last_queries.push_back(now);
    }

    pub fn record_response(&mut self, rtt: Duration, now: Instant) {
        self.failed = 0;
        self.last_response = Some(now);
        self.rtt = Some(match self.rtt {
            Some(previous) => previous.mul_f64(1.0 - RTT_ALPHA) + rtt.mul_f64(RTT_ALPHA),
            None => rtt,
        });
    }

    pub fn record_timeout(&mut self) {
        self.failed = self.failed.saturating_add(1);
    }
}

impl Default for NodeState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_derived_from_key_and_ip() {
        let node = Node::random();

        assert_eq!(
            *node.id(),
            Id::from_public_key(node.public_key(), node.address().ip())
        );
    }

    #[test]
    fn status() {
        let now = Instant::now();
        let mut state = NodeState::new();

        assert_eq!(state.status(now), NodeStatus::Unknown);

        state.record_response(Duration::from_millis(20), now);
        assert_eq!(state.status(now), NodeStatus::Good);

        state.record_timeout();
        assert_eq!(state.status(now), NodeStatus::Unknown);

        state.record_timeout();
        state.record_timeout();
        assert_eq!(state.status(now), NodeStatus::Bad);

        state.record_response(Duration::from_millis(20), now);
        assert_eq!(state.failed(), 0);
    }

    #[test]
    fn rtt_is_smoothed() {
        let now = Instant::now();
        let mut state = NodeState::new();

        state.record_response(Duration::from_millis(100), now);
        assert_eq!(state.rtt(), Some(Duration::from_millis(100)));

        state.record_response(Duration::from_millis(200), now);
        let rtt = state.rtt().unwrap();
        assert!(rtt > Duration::from_millis(100) && rtt < Duration::from_millis(200));
    }

    #[test]
    fn blocked_after_too_many_queries() {
        let now = Instant::now();
        let mut state = NodeState::new();

        for _ in 0..NODE_LIMIT_QUERIES - 1 {
            state.record_query(now);
        }
        assert!(!state.is_blocked(now));

        state.record_query(now);
        assert!(state.is_blocked(now));

        assert!(!state.is_blocked(now + NODE_LIMIT_INTERVAL));
    }
}
