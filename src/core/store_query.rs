use bytes::Bytes;
use tracing::{debug, trace};

use crate::common::{Id, MessageType, Node, StoreRequestArguments};
use crate::core::server::{MAX_VALUES_IN_STORE, TARGET_NODES};
use crate::error::DhtError;
use crate::rpc::socket::inflight_requests::{Completion, RequestOwner, TimeoutPolicy};
use crate::rpc::socket::DhtSocket;
use crate::rpc::QueryId;

#[derive(Debug)]
/// Once a [super::iterative_query::FindQuery] found the closest nodes to a key,
/// stores values at the ones we hold a token for, keeping track of the acknowledging nodes.
pub(crate) struct StoreQuery {
    id: QueryId,
    target: Id,
    values: Vec<Bytes>,
    // Transaction id, destination, and whether it acknowledged once resolved.
    requests: Vec<(u32, Node, Option<bool>)>,
}

impl StoreQuery {
    pub fn new(id: QueryId, target: Id, mut values: Vec<Bytes>) -> Self {
        values.truncate(MAX_VALUES_IN_STORE);

        Self {
            id,
            target,
            values,
            requests: Vec::new(),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    /// Values to store, at most [MAX_VALUES_IN_STORE].
    pub fn values(&self) -> &[Bytes] {
        &self.values
    }

    pub fn started(&self) -> bool {
        !self.requests.is_empty()
    }

    // === Public Methods ===

    /// Send a store request to each node with the token it gave us.
    ///
    /// Errors with [DhtError::StoreFailed] if we hold no token for any of them.
    pub fn start(
        &mut self,
        socket: &mut DhtSocket,
        nodes: Vec<(Node, Vec<u8>)>,
    ) -> Result<(), DhtError> {
        if self.started() {
            panic!("should not call StoreQuery::start() twice");
        };

        let target = self.target;
        trace!(?target, nodes = nodes.len(), "StoreQuery start");

        for (node, token) in nodes {
            let transaction_id = socket.request(
                node.address(),
                Some(node.clone()),
                RequestOwner::Store(self.id),
                TimeoutPolicy::FailOnTimeout,
                MessageType::StoreRequest(StoreRequestArguments {
                    token,
                    target,
                    values: self.values.clone(),
                }),
            );

            self.requests.push((transaction_id, node, None));
        }

        if self.requests.is_empty() {
            debug!(?target, "Value was not stored, no tokens available");
            return Err(DhtError::StoreFailed);
        }

        Ok(())
    }

    pub fn on_completion(&mut self, transaction_id: u32, completion: Completion<()>) {
        if let Some((_, node, acked)) = self
            .requests
            .iter_mut()
            .find(|(tid, _, acked)| *tid == transaction_id && acked.is_none())
        {
            let success = matches!(completion, Completion::Completed(()));

            trace!(?node, success, "StoreQuery got completion");
            *acked = Some(success);
        }
    }

    /// Returns the acknowledging nodes once every request resolved.
    pub fn tick(&self) -> Option<Result<Vec<Node>, DhtError>> {
        if !self.started() || self.requests.iter().any(|(_, _, acked)| acked.is_none()) {
            return None;
        }

        let stored_at: Vec<Node> = self
            .requests
            .iter()
            .filter(|(_, _, acked)| *acked == Some(true))
            .map(|(_, node, _)| node.clone())
            .collect();

        let target = self.target;
        debug!(?target, stored_at = stored_at.len(), "StoreQuery done");

        if stored_at.is_empty() {
            return Some(Err(DhtError::StoreFailed));
        }

        Some(Ok(stored_at))
    }
}

/// Whether we should hold the values ourselves too, because we are among
/// the closest to the key, or there are not enough nodes around.
pub(crate) fn should_store_locally(own_id: &Id, target: &Id, nodes: &[Node]) -> bool {
    if nodes.len() < TARGET_NODES {
        return true;
    }

    let own_distance = own_id.xor(target);

    nodes
        .iter()
        .map(|node| node.id().xor(target))
        .max()
        .map(|largest| own_distance < largest)
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;

    use super::*;
    use crate::common::{Value, ClosestNodes};
    use crate::rpc::socket::DEFAULT_REQUEST_TIMEOUT;
    use crate::rpc::transport::MemoryNetwork;

    fn socket(network: &MemoryNetwork) -> DhtSocket {
        DhtSocket::new(
            Box::new(network.bind("127.0.0.1:1".parse().unwrap()).unwrap()),
            SigningKey::from_bytes(&rand::random()),
            DEFAULT_REQUEST_TIMEOUT,
        )
    }

    #[test]
    fn no_tokens_fails_immediately() {
        let network = MemoryNetwork::non_blocking();
        let mut socket = socket(&network);

        let mut query = StoreQuery::new(1, Id::random(), vec![Value::unsigned(b"v")]);

        assert_eq!(query.start(&mut socket, vec![]), Err(DhtError::StoreFailed));
        assert!(query.tick().is_none());
    }

    #[test]
    fn values_are_truncated() {
        let values = (0..20).map(|i| Value::unsigned(&[i])).collect();
        let query = StoreQuery::new(1, Id::random(), values);

        assert_eq!(query.values().len(), MAX_VALUES_IN_STORE);
    }

    #[test]
    fn acknowledging_nodes() {
        let network = MemoryNetwork::non_blocking();
        let mut socket = socket(&network);

        let mut query = StoreQuery::new(1, Id::random(), vec![Value::unsigned(b"v")]);

        let nodes: Vec<Node> = (1..=3).map(Node::unique).collect();
        query
            .start(
                &mut socket,
                nodes.iter().map(|n| (n.clone(), vec![1, 2, 3])).collect(),
            )
            .unwrap();

        let tids: Vec<u32> = query.requests.iter().map(|(tid, _, _)| *tid).collect();

        query.on_completion(tids[0], Completion::Completed(()));
        assert!(query.tick().is_none());

        query.on_completion(tids[1], Completion::FailedOnTimeout);
        query.on_completion(tids[2], Completion::Completed(()));
        // Completions are only observed once.
        query.on_completion(tids[1], Completion::Completed(()));

        assert_eq!(
            query.tick(),
            Some(Ok(vec![nodes[0].clone(), nodes[2].clone()]))
        );
    }

    #[test]
    fn all_timeouts_fail() {
        let network = MemoryNetwork::non_blocking();
        let mut socket = socket(&network);

        let mut query = StoreQuery::new(1, Id::random(), vec![Value::unsigned(b"v")]);
        query
            .start(&mut socket, vec![(Node::unique(1), vec![1])])
            .unwrap();

        let tid = query.requests[0].0;
        query.on_completion(tid, Completion::FailedOnTimeout);

        assert_eq!(query.tick(), Some(Err(DhtError::StoreFailed)));
    }

    #[test]
    fn store_locally() {
        let target = Id::random();
        let nodes: Vec<Node> = (0..TARGET_NODES).map(Node::unique).collect();

        // Too few nodes.
        assert!(should_store_locally(&Id::random(), &target, &nodes[..3]));

        // Closer than the furthest.
        assert!(should_store_locally(&target, &target, &nodes));

        // Further than all of them.
        let mut sorted = ClosestNodes::new(target);
        for node in &nodes {
            sorted.add(node.clone());
        }
        let furthest = sorted.nodes().last().unwrap().id().xor(&target);
        let far_away = target.xor(&furthest);

        assert!(!should_store_locally(&far_away, &target, &nodes));
    }
}
