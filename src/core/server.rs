//! Responder side of the Dht: answers requests from the local routing table and storage.

pub mod storage;
pub mod tokens;

use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::common::{
    FindRequestArguments, FindResponseArguments, FindResponseSpecific, Id, MessageType, Node,
    RoutingTable, StoreRequestArguments, Value, MAX_ENTRY_SIZE,
};

use storage::{Storage, MAX_ENTRY_AGE};
use tokens::Tokens;

/// Maximum number of values accepted in a single store request.
pub const MAX_VALUES_IN_STORE: usize = 8;
/// Maximum number of values returned in a single find response.
pub const MAX_VALUES_IN_FIND: usize = 8;
/// Maximum number of nodes returned in a single find response.
pub const MAX_NODES_IN_FIND: usize = 8;
/// Number of nodes a value is replicated on.
pub const TARGET_NODES: usize = 8;

/// Number of closest nodes considered when deciding how long to keep a value.
const TTL_NEIGHBOURHOOD: usize = 20;

#[derive(Debug, Default)]
/// Handles incoming ping, store and find requests.
///
/// Requests are expected to be rate limited by the caller.
pub struct Server {
    tokens: Tokens,
    storage: Storage,
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    // === Getters ===

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    #[cfg(test)]
    pub fn tokens(&self) -> &Tokens {
        &self.tokens
    }

    // === Public Methods ===

    /// Returns the response to send back to `requester`, or `None` to silently drop the request.
    pub fn handle_request(
        &mut self,
        routing_table: &RoutingTable,
        requester: &Node,
        request: &MessageType,
    ) -> Option<MessageType> {
        self.handle_request_at(routing_table, requester, request, Instant::now())
    }

    pub(crate) fn handle_request_at(
        &mut self,
        routing_table: &RoutingTable,
        requester: &Node,
        request: &MessageType,
        now: Instant,
    ) -> Option<MessageType> {
        match request {
            MessageType::Ping => Some(MessageType::Pong),
            MessageType::StoreRequest(arguments) => {
                self.handle_store(routing_table, requester, arguments, now)
            }
            MessageType::FindRequest(arguments) => {
                Some(self.handle_find(routing_table, requester, arguments, now))
            }
            _ => None,
        }
    }

    /// Decode and store a value locally.
    ///
    /// Returns `false` if the value is invalid or stale.
    pub fn add_value(&mut self, key: Id, value: Bytes, max_age: Duration) -> bool {
        self.add_value_at(key, value, max_age, Instant::now())
    }

    pub(crate) fn add_value_at(
        &mut self,
        key: Id,
        value: Bytes,
        max_age: Duration,
        now: Instant,
    ) -> bool {
        match Value::decode(&value) {
            Ok(decoded) => {
                self.storage
                    .put_at(key, value, decoded.owner(), decoded.version(), max_age, now)
            }
            Err(error) => {
                warn!(?error, ?key, "Failed to store value");
                false
            }
        }
    }

    /// Rotate the secret tokens are generated from.
    pub fn rotate_tokens(&mut self) {
        self.tokens.rotate()
    }

    /// Remove expired values.
    pub fn sweep(&mut self) {
        self.storage.sweep()
    }

    // === Private Methods ===

    fn handle_store(
        &mut self,
        routing_table: &RoutingTable,
        requester: &Node,
        arguments: &StoreRequestArguments,
        now: Instant,
    ) -> Option<MessageType> {
        let StoreRequestArguments {
            token,
            target,
            values,
        } = arguments;

        if values.iter().any(|value| value.len() > MAX_ENTRY_SIZE) {
            warn!(?requester, "Maximum length of value exceeded, dropping packet");
            return None;
        }
        if values.len() > MAX_VALUES_IN_STORE {
            warn!(?requester, "Too many values, dropping packet");
            return None;
        }
        // Prevents spoofing the source address, the values themselves are not checked.
        if !self.tokens.validate(requester, token) {
            warn!(?requester, "Bad token, dropping packet");
            return None;
        }

        let max_age = storage_ttl(routing_table, target);

        debug!(?target, ?max_age, count = values.len(), "Storing values");

        for value in values {
            self.add_value_at(*target, value.clone(), max_age, now);
        }

        Some(MessageType::StoreResponse)
    }

    fn handle_find(
        &mut self,
        routing_table: &RoutingTable,
        requester: &Node,
        arguments: &FindRequestArguments,
        now: Instant,
    ) -> MessageType {
        let values = if arguments.force_nodes {
            vec![]
        } else {
            self.storage.get_at(
                &arguments.target,
                arguments.start_idx as usize,
                MAX_VALUES_IN_FIND,
                now,
            )
        };

        let result = if values.is_empty() {
            FindResponseSpecific::Nodes(routing_table.closest_nodes(
                &arguments.target,
                MAX_NODES_IN_FIND,
                Some(requester.id()),
            ))
        } else {
            FindResponseSpecific::Values(values)
        };

        MessageType::FindResponse(FindResponseArguments {
            token: self.tokens.generate_token(requester).to_vec(),
            result,
        })
    }
}

/// How long to keep values for `target`.
///
/// Halved for every known node closer to `target` than us beyond the
/// [TARGET_NODES] closest, so far away nodes don't over-cache.
fn storage_ttl(routing_table: &RoutingTable, target: &Id) -> Duration {
    let own_distance = routing_table.id().xor(target);

    let num_closer = routing_table
        .closest_nodes(target, TTL_NEIGHBOURHOOD, None)
        .iter()
        .filter(|node| node.id().xor(target) < own_distance)
        .count();

    let exponent = (num_closer + 1).saturating_sub(TARGET_NODES) as u32;

    MAX_ENTRY_AGE / 2_u32.pow(exponent)
}
