//! Bounded, round based iterative lookups.

use std::collections::HashSet;
use std::net::SocketAddrV4;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::common::{
    post_process_values, ClosestNodes, FindRequestArguments, FindResponseSpecific, Id,
    MessageType, Node, PublicKey,
};
use crate::rpc::socket::inflight_requests::{Completion, RequestOwner, TimeoutPolicy};
use crate::rpc::socket::DhtSocket;
use crate::rpc::QueryId;

/// Maximum number of nodes queried in each round.
pub const MAX_FIND_WALKS: usize = 8;
/// Maximum number of rounds of a lookup.
pub const MAX_FIND_STEPS: usize = 4;

/// The result of a finished [FindQuery].
#[derive(Debug, Clone, PartialEq)]
pub enum FindOutcome {
    /// Every node tried, closest to the target first.
    Nodes(Vec<Node>),
    Values {
        /// Post processed values, the latest per signer then unsigned ones.
        values: Vec<(Bytes, Option<PublicKey>)>,
        /// Raw values merged across responders.
        merged: Vec<Bytes>,
        /// The most recent responder that answered with nodes instead of values.
        cache_on: Option<Node>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for the find requests of the current round.
    Round,
    /// Waiting for the find requests sent to help responders puncture toward new candidates.
    Puncture,
}

#[derive(Debug)]
struct RoundRequest {
    transaction_id: u32,
    node: Node,
    // `None` until resolved, then `Some(None)` if it timed out.
    result: Option<Option<FindResponseSpecific>>,
}

/// An iterative lookup toward a target.
///
/// Every round, all candidates are queried concurrently, tolerating timeouts.
/// Each responder that returned nodes admits one untried node into the next
/// round, at most [MAX_FIND_WALKS] of the closest ones, for at most
/// [MAX_FIND_STEPS] rounds.
#[derive(Debug)]
pub(crate) struct FindQuery {
    id: QueryId,
    target: Id,
    force_nodes: bool,
    start_idx: u32,
    lan_address: SocketAddrV4,

    step: usize,
    phase: Phase,

    candidates: Vec<Node>,
    tried: ClosestNodes,
    round: Vec<RoundRequest>,
    punctures: HashSet<u32>,

    value_batches: Vec<Vec<Bytes>>,
    recent: Option<Node>,
}

impl FindQuery {
    pub fn new(
        id: QueryId,
        target: Id,
        force_nodes: bool,
        start_idx: u32,
        lan_address: SocketAddrV4,
        seeds: Vec<Node>,
    ) -> Self {
        trace!(?target, force_nodes, start_idx, seeds = seeds.len(), "New find query");

        let mut candidates = ClosestNodes::new(target);
        for node in seeds {
            candidates.add(node);
        }
        candidates.truncate(MAX_FIND_WALKS);

        Self {
            id,
            target,
            force_nodes,
            start_idx,
            lan_address,

            step: 0,
            phase: Phase::Round,

            candidates: candidates.into_iter().collect(),
            tried: ClosestNodes::new(target),
            round: Vec::new(),
            punctures: HashSet::new(),

            value_batches: Vec::new(),
            recent: None,
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    /// Number of rounds started so far.
    #[cfg(test)]
    pub fn step(&self) -> usize {
        self.step
    }

    // === Public Methods ===

    /// Send the first round of requests.
    pub fn start(&mut self, socket: &mut DhtSocket) {
        self.send_round(socket);
    }

    /// Resolve one of this query's requests.
    pub fn on_completion(&mut self, transaction_id: u32, completion: Completion<FindResponseSpecific>) {
        if self.punctures.remove(&transaction_id) {
            return;
        }

        if let Some(request) = self
            .round
            .iter_mut()
            .find(|r| r.transaction_id == transaction_id && r.result.is_none())
        {
            request.result = Some(match completion {
                // Values are not expected when asking for nodes.
                Completion::Completed(FindResponseSpecific::Values(_)) if self.force_nodes => {
                    Some(FindResponseSpecific::Nodes(vec![]))
                }
                Completion::Completed(result) => Some(result),
                Completion::EmptyOnTimeout | Completion::FailedOnTimeout => {
                    trace!(node = ?request.node, "Find request got no response");
                    None
                }
            });
        }
    }

    /// Advance the query, returns the outcome once it is done.
    pub fn tick(&mut self, socket: &mut DhtSocket) -> Option<FindOutcome> {
        if self.phase == Phase::Round {
            if self.round.iter().any(|r| r.result.is_none()) {
                return None;
            }

            self.finish_round(socket);
        }

        if !self.punctures.is_empty() {
            return None;
        }

        if self.step < MAX_FIND_STEPS && !self.candidates.is_empty() {
            self.send_round(socket);
            return None;
        }

        Some(self.outcome())
    }

    // === Private Methods ===

    fn send_round(&mut self, socket: &mut DhtSocket) {
        self.step += 1;
        self.phase = Phase::Round;
        self.round.clear();

        let target = self.target;
        trace!(?target, step = self.step, candidates = self.candidates.len(), "Find round");

        for node in std::mem::take(&mut self.candidates) {
            let transaction_id = self.request(socket, &node, self.target, self.start_idx);

            self.tried.add(node.clone());
            self.round.push(RoundRequest {
                transaction_id,
                node,
                result: None,
            });
        }
    }

    fn finish_round(&mut self, socket: &mut DhtSocket) {
        let responses: Vec<(Node, FindResponseSpecific)> = self
            .round
            .drain(..)
            .filter_map(|r| r.result.flatten().map(|result| (r.node, result)))
            .collect();

        if let Some((sender, _)) = responses
            .iter()
            .find(|(_, result)| matches!(result, FindResponseSpecific::Nodes(_)))
        {
            self.recent = Some(sender.clone());
        }

        for (_, result) in &responses {
            if let FindResponseSpecific::Values(values) = result {
                self.value_batches.push(values.clone());
            }
        }

        let (next, to_puncture) = pick_next_nodes(&responses, &self.tried);

        for (sender, node) in to_puncture {
            trace!(?sender, ?node, "Puncturing toward node");

            let transaction_id = self.request(socket, &sender, *node.id(), 0);
            self.punctures.insert(transaction_id);
        }
        self.phase = Phase::Puncture;

        let mut candidates = ClosestNodes::new(self.target);
        for node in next {
            if !self.tried.contains(node.id()) {
                candidates.add(node);
            }
        }
        candidates.truncate(MAX_FIND_WALKS);

        self.candidates = candidates.into_iter().collect();
    }

    fn request(&self, socket: &mut DhtSocket, node: &Node, target: Id, start_idx: u32) -> u32 {
        socket.request(
            node.address(),
            Some(node.clone()),
            RequestOwner::Find(self.id),
            TimeoutPolicy::EmptyOnTimeout,
            MessageType::FindRequest(FindRequestArguments {
                lan_address: self.lan_address,
                target,
                start_idx,
                force_nodes: self.force_nodes,
            }),
        )
    }

    fn outcome(&self) -> FindOutcome {
        let target = self.target;
        debug!(
            ?target,
            steps = self.step,
            tried = self.tried.len(),
            batches = self.value_batches.len(),
            "Done find query"
        );

        if self.force_nodes {
            return FindOutcome::Nodes(self.tried.nodes().to_vec());
        }

        let merged = merge_values(&self.value_batches);

        FindOutcome::Values {
            values: post_process_values(&merged),
            merged,
            cache_on: self.recent.clone(),
        }
    }
}

/// From each responder that returned nodes, pick the first node that is neither
/// tried nor already picked for a puncture.
///
/// Returns the picked nodes, and the `(responder, node)` pairs where the pick
/// was not the responder's first node, so the responder did not send it a
/// puncture request on our behalf.
fn pick_next_nodes(
    responses: &[(Node, FindResponseSpecific)],
    tried: &ClosestNodes,
) -> (Vec<Node>, Vec<(Node, Node)>) {
    let mut next: Vec<Node> = Vec::new();
    let mut to_puncture: Vec<(Node, Node)> = Vec::new();

    for (sender, result) in responses {
        let FindResponseSpecific::Nodes(nodes) = result else {
            continue;
        };

        let picked = nodes.iter().find(|node| {
            !tried.contains(node.id()) && !to_puncture.iter().any(|(_, p)| p == *node)
        });

        if let Some(node) = picked {
            if !next.contains(node) {
                next.push(node.clone());
            }

            if Some(node) != nodes.first() {
                to_puncture.push((sender.clone(), node.clone()));
            }
        }
    }

    (next, to_puncture)
}

/// Interleave batches (first of each, then second of each, ...) and drop duplicates.
fn merge_values(batches: &[Vec<Bytes>]) -> Vec<Bytes> {
    let longest = batches.iter().map(Vec::len).max().unwrap_or(0);

    let mut merged: Vec<Bytes> = Vec::new();

    for i in 0..longest {
        for batch in batches {
            if let Some(value) = batch.get(i) {
                if !merged.contains(value) {
                    merged.push(value.clone());
                }
            }
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;

    use super::*;
    use crate::common::Value;
    use crate::rpc::socket::{Incoming, DEFAULT_REQUEST_TIMEOUT};
    use crate::rpc::transport::MemoryNetwork;

    fn socket(network: &MemoryNetwork) -> DhtSocket {
        DhtSocket::new(
            Box::new(network.bind("127.0.0.1:1".parse().unwrap()).unwrap()),
            SigningKey::from_bytes(&rand::random()),
            DEFAULT_REQUEST_TIMEOUT,
        )
    }

    /// Nodes listening on the network, bound before the query sends anything.
    fn listen(network: &MemoryNetwork, nodes: &[Node]) -> Vec<(Node, DhtSocket)> {
        nodes
            .iter()
            .map(|node| {
                let socket = DhtSocket::new(
                    Box::new(network.bind(node.address()).unwrap()),
                    SigningKey::from_bytes(&rand::random()),
                    DEFAULT_REQUEST_TIMEOUT,
                );

                (node.clone(), socket)
            })
            .collect()
    }

    /// Find requests received by `peer`, as `(transaction_id, arguments)`.
    fn received(peer: &mut (Node, DhtSocket)) -> Vec<(u32, FindRequestArguments)> {
        let mut requests = vec![];

        while let Some(incoming) = peer.1.recv_from() {
            if let Incoming::Request { message, .. } = incoming {
                if let MessageType::FindRequest(arguments) = message.message_type {
                    requests.push((message.transaction_id, arguments));
                }
            }
        }

        requests
    }

    #[test]
    fn merge_round_robin() {
        let a = Bytes::from_static(b"a");
        let b = Bytes::from_static(b"b");
        let c = Bytes::from_static(b"c");
        let d = Bytes::from_static(b"d");

        let merged = merge_values(&[
            vec![a.clone(), b.clone(), c.clone()],
            vec![d.clone(), a.clone()],
            vec![],
        ]);

        assert_eq!(merged, vec![a, d, b, c]);
    }

    #[test]
    fn pick_one_untried_node_per_responder() {
        let target = Id::random();

        let sender_a = Node::unique(1);
        let sender_b = Node::unique(2);
        let sender_c = Node::unique(3);
        let x = Node::unique(10);
        let y = Node::unique(11);
        let z = Node::unique(12);

        let mut tried = ClosestNodes::new(target);
        tried.add(sender_a.clone());
        tried.add(sender_b.clone());
        tried.add(sender_c.clone());

        let responses = vec![
            // First node is untried, no puncture needed.
            (
                sender_a.clone(),
                FindResponseSpecific::Nodes(vec![x.clone(), y.clone()]),
            ),
            // First node was tried, the second one needs a puncture.
            (
                sender_b.clone(),
                FindResponseSpecific::Nodes(vec![sender_a.clone(), y.clone(), z.clone()]),
            ),
            // `y` is already picked for a puncture, so `z` is picked.
            (
                sender_c.clone(),
                FindResponseSpecific::Nodes(vec![sender_b.clone(), y.clone(), z.clone()]),
            ),
            (
                Node::unique(4),
                FindResponseSpecific::Values(vec![Value::unsigned(b"v")]),
            ),
        ];

        let (next, to_puncture) = pick_next_nodes(&responses, &tried);

        assert_eq!(next, vec![x, y.clone(), z.clone()]);
        assert_eq!(to_puncture, vec![(sender_b, y), (sender_c, z)]);
    }

    #[test]
    fn rounds_and_outcome() {
        let network = MemoryNetwork::non_blocking();
        let mut socket = socket(&network);

        let target = Id::random();
        let seed = Node::unique(1);
        let hop = Node::unique(2);
        let mut peers = listen(&network, &[seed.clone(), hop.clone()]);

        let mut query = FindQuery::new(
            7,
            target,
            false,
            0,
            socket.local_addr(),
            vec![seed.clone()],
        );
        query.start(&mut socket);

        let round = received(&mut peers[0]);
        assert_eq!(round.len(), 1);
        assert_eq!(round[0].1.target, target);
        assert_eq!(query.step(), 1);

        // Waits for the whole round.
        assert!(query.tick(&mut socket).is_none());

        query.on_completion(
            round[0].0,
            Completion::Completed(FindResponseSpecific::Nodes(vec![hop.clone()])),
        );

        // Next round toward `hop`.
        assert!(query.tick(&mut socket).is_none());
        assert_eq!(query.step(), 2);

        let round = received(&mut peers[1]);
        assert_eq!(round.len(), 1);

        let value = Value::unsigned(b"found");
        query.on_completion(
            round[0].0,
            Completion::Completed(FindResponseSpecific::Values(vec![value.clone()])),
        );

        assert_eq!(
            query.tick(&mut socket),
            Some(FindOutcome::Values {
                values: vec![(Bytes::from_static(b"found"), None)],
                merged: vec![value],
                cache_on: Some(seed),
            })
        );
    }

    #[test]
    fn next_round_waits_for_punctures() {
        let network = MemoryNetwork::non_blocking();
        let mut socket = socket(&network);

        let target = Id::random();
        let seed = Node::unique(1);
        let hop = Node::unique(2);
        let mut peers = listen(&network, &[seed.clone(), hop.clone()]);

        let mut query = FindQuery::new(
            7,
            target,
            true,
            0,
            socket.local_addr(),
            vec![seed.clone()],
        );
        query.start(&mut socket);

        let round = received(&mut peers[0]);

        // The first node is already tried, so the seed did not ask `hop`
        // to puncture toward us.
        query.on_completion(
            round[0].0,
            Completion::Completed(FindResponseSpecific::Nodes(vec![seed.clone(), hop.clone()])),
        );
        assert!(query.tick(&mut socket).is_none());

        let punctures = received(&mut peers[0]);
        assert_eq!(punctures.len(), 1);
        assert_eq!(punctures[0].1.target, *hop.id());

        assert!(query.tick(&mut socket).is_none());
        assert_eq!(query.step(), 1);
        assert!(received(&mut peers[1]).is_empty());

        query.on_completion(punctures[0].0, Completion::EmptyOnTimeout);

        assert!(query.tick(&mut socket).is_none());
        assert_eq!(query.step(), 2);

        let round = received(&mut peers[1]);
        assert_eq!(round.len(), 1);
        assert_eq!(round[0].1.target, target);
    }

    #[test]
    fn timeouts_are_tolerated() {
        let network = MemoryNetwork::non_blocking();
        let mut socket = socket(&network);

        let target = Id::random();
        let seeds: Vec<Node> = (1..=3).map(Node::unique).collect();
        let mut peers = listen(&network, &seeds);

        let mut query =
            FindQuery::new(7, target, true, 0, socket.local_addr(), seeds.clone());
        query.start(&mut socket);

        let round: Vec<_> = peers.iter_mut().flat_map(received).collect();
        assert_eq!(round.len(), 3);

        for (transaction_id, arguments) in &round {
            assert!(arguments.force_nodes);
            query.on_completion(*transaction_id, Completion::EmptyOnTimeout);
        }

        // Nothing new to query, tried nodes are returned closest first.
        let Some(FindOutcome::Nodes(nodes)) = query.tick(&mut socket) else {
            panic!("expected nodes");
        };

        let mut expected = seeds;
        expected.sort_by_key(|node| node.id().xor(&target));

        assert_eq!(nodes, expected);
    }

    #[test]
    fn stops_after_max_steps() {
        let network = MemoryNetwork::non_blocking();
        let mut socket = socket(&network);

        let target = Id::random();
        let nodes: Vec<Node> = (0..=MAX_FIND_STEPS).map(Node::unique).collect();
        let mut peers = listen(&network, &nodes);

        let mut query = FindQuery::new(
            7,
            target,
            true,
            0,
            socket.local_addr(),
            vec![Node::unique(0)],
        );
        query.start(&mut socket);

        let mut outcome = None;

        for i in 0..MAX_FIND_STEPS {
            let round = received(&mut peers[i]);
            assert_eq!(round.len(), 1);

            // Always point to a new node.
            query.on_completion(
                round[0].0,
                Completion::Completed(FindResponseSpecific::Nodes(vec![Node::unique(i + 1)])),
            );

            outcome = query.tick(&mut socket);
        }

        assert_eq!(query.step(), MAX_FIND_STEPS);

        let Some(FindOutcome::Nodes(nodes)) = outcome else {
            panic!("expected the query to be done");
        };
        assert_eq!(nodes.len(), MAX_FIND_STEPS);
    }
}
