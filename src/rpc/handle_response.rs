use std::net::SocketAddrV4;
use std::time::Instant;

use tracing::{debug, trace};

use crate::common::{FindResponseArguments, Message, MessageType, Node};

use super::socket::inflight_requests::{Completion, PendingRequest, RequestOwner};
use super::Rpc;

impl Rpc {
    /// Handle an inbound response matched with its pending request: add the
    /// responder to the routing table, remember its token, and hand the
    /// result to the request's owner.
    pub(super) fn handle_response(
        &mut self,
        from: SocketAddrV4,
        message: Message,
        request: PendingRequest,
    ) {
        if message.public_key == *self.public_key() {
            trace!(?from, "Ignoring our own response");
            return;
        }

        let node = Node::new(message.public_key, from);
        let now = Instant::now();

        if let Some(expected) = &request.node {
            if expected.id() != node.id() {
                debug!(?expected, ?node, "Response from a different node than requested");
            }
        }

        self.routing_table.add(node.clone());
        if let Some(state) = self.routing_table.state_mut(node.id()) {
            state.record_response(now.saturating_duration_since(request.sent_at), now);
        }

        match (request.owner, message.message_type) {
            (
                RequestOwner::Find(id),
                MessageType::FindResponse(FindResponseArguments { token, result }),
            ) => {
                self.received_tokens.insert_at(node.id(), token, now);

                if let Some((query, _)) = self.find_queries.get_mut(&id) {
                    query.on_completion(request.transaction_id, Completion::Completed(result));
                }
            }
            (RequestOwner::Store(id), MessageType::StoreResponse) => {
                if let Some((query, _)) = self.store_queries.get_mut(&id) {
                    query.on_completion(request.transaction_id, Completion::Completed(()));
                }
            }
            (RequestOwner::Ping(id), MessageType::Pong) => {
                self.done_pings.push((id, Ok(node)));
            }
            (RequestOwner::Bootstrap, MessageType::Pong) => {
                self.bootstrap_pings = self.bootstrap_pings.saturating_sub(1);
                trace!(?node, "Bootstrapping node responded");

                self.lookup_self();
            }
            (RequestOwner::Maintenance, MessageType::Pong) => {}
            (owner, message_type) => {
                debug!(?owner, ?message_type, ?from, "Unexpected response for request");
            }
        }
    }
}
