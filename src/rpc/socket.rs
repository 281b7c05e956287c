//! Socket layer signing outgoing messages and correlating responses with requests.

pub(crate) mod inflight_requests;

use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use ed25519_dalek::SigningKey;
use tracing::{debug, trace};

use crate::common::{Message, MessageType, Node, PublicKey, RequestKind};

use super::transport::Transport;
use inflight_requests::{Completion, PendingRequest, RequestCache, RequestOwner, TimeoutPolicy};

/// Default request timeout before abandoning an inflight request to a non-responding node.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A [Transport] wrapper that signs, verifies and correlates Dht messages.
#[derive(Debug)]
pub struct DhtSocket {
    transport: Box<dyn Transport>,
    signer: SigningKey,
    public_key: PublicKey,
    global_time: u64,
    requests: RequestCache,
}

/// A verified incoming message.
#[derive(Debug)]
pub enum Incoming {
    Request {
        message: Message,
        from: SocketAddrV4,
    },
    /// A response matched with the request it answers.
    Response {
        message: Message,
        from: SocketAddrV4,
        request: PendingRequest,
    },
}

impl DhtSocket {
    pub fn new(transport: Box<dyn Transport>, signer: SigningKey, request_timeout: Duration) -> Self {
        let public_key = signer.verifying_key().to_bytes();

        Self {
            transport,
            signer,
            public_key,
            global_time: 0,
            requests: RequestCache::new(request_timeout),
        }
    }

    // === Getters ===

    /// Returns the address the transport is bound to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.transport.local_addr()
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub(crate) fn signer(&self) -> &SigningKey {
        &self.signer
    }

    #[cfg(test)]
    pub fn requests(&self) -> &RequestCache {
        &self.requests
    }

    // === Public Methods ===

    /// Send a request to `address` and return its transaction_id.
    ///
    /// The request kind is inferred from `message_type`.
    pub fn request(
        &mut self,
        address: SocketAddrV4,
        node: Option<Node>,
        owner: RequestOwner,
        policy: TimeoutPolicy,
        message_type: MessageType,
    ) -> u32 {
        let kind = match &message_type {
            MessageType::Ping => RequestKind::Ping,
            MessageType::StoreRequest(_) => RequestKind::Store,
            MessageType::FindRequest(_) => RequestKind::Find,
            _ => {
                // Not a correlated request, nothing to wait for.
                let transaction_id = rand::random();
                self.send(address, transaction_id, message_type);
                return transaction_id;
            }
        };

        let transaction_id = self.requests.unique_id(kind);

        self.requests.add(PendingRequest {
            kind,
            transaction_id,
            to: address,
            node,
            owner,
            policy,
            sent_at: Instant::now(),
        });

        self.send(address, transaction_id, message_type);

        transaction_id
    }

    /// Send a response or an unsolicited message to `address`.
    pub fn send(&mut self, address: SocketAddrV4, transaction_id: u32, message_type: MessageType) {
        self.global_time += 1;

        let message = Message {
            transaction_id,
            public_key: self.public_key,
            global_time: self.global_time,
            message_type,
        };

        trace!(context = "socket_message_sending", ?message, ?address);

        match message.to_bytes(&self.signer) {
            Ok(bytes) => {
                let _ = self.transport.send_to(&bytes, address).map_err(|e| {
                    debug!(?e, ?address, "Error sending message");
                });
            }
            Err(error) => {
                debug!(?error, "Error encoding message");
            }
        }
    }

    /// Receives a single message from the transport.
    ///
    /// Returns requests as is, and responses only if they match a pending request.
    pub fn recv_from(&mut self) -> Option<Incoming> {
        let (bytes, from) = self.transport.recv_from()?;

        if from.port() == 0 {
            trace!(context = "socket_validation", "Message from port 0");
            return None;
        }

        let message = match Message::from_bytes(&bytes) {
            Ok(message) => message,
            Err(error) => {
                trace!(
                    context = "socket_error",
                    ?error,
                    ?from,
                    "Received invalid message"
                );
                return None;
            }
        };

        trace!(context = "socket_message_receiving", ?message, ?from);

        match message.message_type.response_kind() {
            Some(kind) => {
                match self.requests.pop(kind, message.transaction_id, &from) {
                    Some(request) => Some(Incoming::Response {
                        message,
                        from,
                        request,
                    }),
                    None => {
                        trace!(
                            context = "socket_validation",
                            ?from,
                            transaction_id = message.transaction_id,
                            "Unexpected response id"
                        );
                        None
                    }
                }
            }
            None => Some(Incoming::Request { message, from }),
        }
    }

    /// Remove timed out requests with their [Completion].
    pub fn expire<T>(&mut self, now: Instant) -> Vec<(PendingRequest, Completion<T>)> {
        self.requests.expire(now)
    }

    /// Abandon every pending request.
    pub fn shutdown(&mut self) {
        self.requests.shutdown()
    }
}
