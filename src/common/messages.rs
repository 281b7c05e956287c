//! Serialize, sign and verify Dht messages.

mod internal;

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::Bytes;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde_bytes::ByteBuf;

use crate::common::{Id, Node, PublicKey, ID_SIZE, PUBLIC_KEY_SIZE};

/// Size of the trailing ed25519 signature of every packet.
pub const SIGNATURE_SIZE: usize = 64;
/// Size of a compact node: `id(20) ‖ public_key(32) ‖ ipv4(4) ‖ port(2)`.
pub const COMPACT_NODE_SIZE: usize = ID_SIZE + PUBLIC_KEY_SIZE + 6;

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    pub transaction_id: u32,

    /// Public key of the sender, verified against the packet signature.
    pub public_key: PublicKey,

    /// The sender's claimed global time.
    pub global_time: u64,

    pub message_type: MessageType,
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageType {
    Ping,
    Pong,
    StoreRequest(StoreRequestArguments),
    StoreResponse,
    FindRequest(FindRequestArguments),
    FindResponse(FindResponseArguments),
    PunctureRequest(PunctureRequestArguments),
    Puncture,
}

/// Kinds of correlated request/response pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RequestKind {
    Ping,
    Store,
    Find,
}

// === STORE ===

#[derive(Debug, PartialEq, Clone)]
pub struct StoreRequestArguments {
    pub token: Vec<u8>,
    pub target: Id,
    pub values: Vec<Bytes>,
}

// === FIND ===

#[derive(Debug, PartialEq, Clone)]
pub struct FindRequestArguments {
    /// The requester's believed LAN address.
    pub lan_address: SocketAddrV4,
    pub target: Id,
    pub start_idx: u32,
    pub force_nodes: bool,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindResponseArguments {
    pub token: Vec<u8>,
    pub result: FindResponseSpecific,
}

#[derive(Debug, PartialEq, Clone)]
pub enum FindResponseSpecific {
    Values(Vec<Bytes>),
    Nodes(Vec<Node>),
}

// === PUNCTURE ===

#[derive(Debug, PartialEq, Clone)]
pub struct PunctureRequestArguments {
    pub lan_address: SocketAddrV4,
    pub wan_address: SocketAddrV4,
}

impl MessageType {
    /// The kind of request this message correlates with, if it is a response.
    pub fn response_kind(&self) -> Option<RequestKind> {
        match self {
            MessageType::Pong => Some(RequestKind::Ping),
            MessageType::StoreResponse => Some(RequestKind::Store),
            MessageType::FindResponse(_) => Some(RequestKind::Find),
            _ => None,
        }
    }
}

impl Message {
    fn into_serde_message(self) -> internal::DHTMessage {
        internal::DHTMessage {
            transaction_id: self.transaction_id,
            public_key: self.public_key,
            global_time: self.global_time,
            variant: match self.message_type {
                MessageType::Ping => internal::DHTMessageVariant::Ping {
                    arguments: internal::DHTEmptyArguments {},
                },
                MessageType::Pong => internal::DHTMessageVariant::Pong {
                    arguments: internal::DHTEmptyArguments {},
                },
                MessageType::StoreRequest(args) => internal::DHTMessageVariant::StoreRequest {
                    arguments: internal::DHTStoreRequestArguments {
                        token: args.token.into(),
                        target: args.target.into(),
                        values: values_to_bytes(args.values),
                    },
                },
                MessageType::StoreResponse => internal::DHTMessageVariant::StoreResponse {
                    arguments: internal::DHTEmptyArguments {},
                },
                MessageType::FindRequest(args) => internal::DHTMessageVariant::FindRequest {
                    arguments: internal::DHTFindRequestArguments {
                        lan_address: sockaddr_to_bytes(&args.lan_address),
                        target: args.target.into(),
                        start_idx: args.start_idx,
                        force_nodes: args.force_nodes.into(),
                    },
                },
                MessageType::FindResponse(args) => {
                    let (values, nodes) = match args.result {
                        FindResponseSpecific::Values(values) => (values_to_bytes(values), vec![]),
                        FindResponseSpecific::Nodes(nodes) => (vec![], nodes4_to_bytes(&nodes)),
                    };

                    internal::DHTMessageVariant::FindResponse {
                        arguments: internal::DHTFindResponseArguments {
                            token: args.token.into(),
                            values,
                            nodes: nodes.into(),
                        },
                    }
                }
                MessageType::PunctureRequest(args) => {
                    internal::DHTMessageVariant::PunctureRequest {
                        arguments: internal::DHTPunctureRequestArguments {
                            lan_address: sockaddr_to_bytes(&args.lan_address),
                            wan_address: sockaddr_to_bytes(&args.wan_address),
                        },
                    }
                }
                MessageType::Puncture => internal::DHTMessageVariant::Puncture {
                    arguments: internal::DHTEmptyArguments {},
                },
            },
        }
    }

    fn from_serde_message(msg: internal::DHTMessage) -> Result<Message, DecodeError> {
        Ok(Message {
            transaction_id: msg.transaction_id,
            public_key: msg.public_key,
            global_time: msg.global_time,
            message_type: match msg.variant {
                internal::DHTMessageVariant::Ping { .. } => MessageType::Ping,
                internal::DHTMessageVariant::Pong { .. } => MessageType::Pong,
                internal::DHTMessageVariant::StoreRequest { arguments } => {
                    MessageType::StoreRequest(StoreRequestArguments {
                        token: arguments.token.into(),
                        target: arguments.target.into(),
                        values: bytes_to_values(arguments.values),
                    })
                }
                internal::DHTMessageVariant::StoreResponse { .. } => MessageType::StoreResponse,
                internal::DHTMessageVariant::FindRequest { arguments } => {
                    MessageType::FindRequest(FindRequestArguments {
                        lan_address: bytes_to_sockaddr(arguments.lan_address),
                        target: arguments.target.into(),
                        start_idx: arguments.start_idx,
                        force_nodes: arguments.force_nodes != 0,
                    })
                }
                internal::DHTMessageVariant::FindResponse { arguments } => {
                    let result = if arguments.values.is_empty() {
                        FindResponseSpecific::Nodes(bytes_to_nodes4(&arguments.nodes)?)
                    } else {
                        FindResponseSpecific::Values(bytes_to_values(arguments.values))
                    };

                    MessageType::FindResponse(FindResponseArguments {
                        token: arguments.token.into(),
                        result,
                    })
                }
                internal::DHTMessageVariant::PunctureRequest { arguments } => {
                    MessageType::PunctureRequest(PunctureRequestArguments {
                        lan_address: bytes_to_sockaddr(arguments.lan_address),
                        wan_address: bytes_to_sockaddr(arguments.wan_address),
                    })
                }
                internal::DHTMessageVariant::Puncture { .. } => MessageType::Puncture,
            },
        })
    }

    /// Encode this message and append the signature of `signer` over the encoded body.
    ///
    /// The [Message::public_key] is expected to be the verifying key of `signer`.
    pub fn to_bytes(&self, signer: &SigningKey) -> Result<Vec<u8>, DecodeError> {
        let mut body = self.clone().into_serde_message().to_bytes()?;

        let signature = signer.sign(&body);
        body.extend_from_slice(&signature.to_bytes());

        Ok(body)
    }

    /// Decode a packet and verify its trailing signature against the embedded public key.
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message, DecodeError> {
        let bytes = bytes.as_ref();

        if bytes.len() <= SIGNATURE_SIZE {
            return Err(DecodeError::TooShort(bytes.len()));
        }

        let (body, signature) = bytes.split_at(bytes.len() - SIGNATURE_SIZE);

        let message = internal::DHTMessage::from_bytes(body)?;

        let verifying_key = VerifyingKey::from_bytes(&message.public_key)
            .map_err(|_| DecodeError::InvalidPublicKey)?;
        let signature =
            Signature::from_slice(signature).map_err(|_| DecodeError::InvalidSignature)?;

        verifying_key
            .verify(body, &signature)
            .map_err(|_| DecodeError::InvalidSignature)?;

        Message::from_serde_message(message)
    }
}

#[derive(thiserror::Error, Debug)]
/// Reasons an incoming packet is dropped.
pub enum DecodeError {
    #[error("Packet too short ({0} bytes)")]
    TooShort(usize),

    #[error("Failed to parse packet bytes: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error("Invalid sender public key")]
    InvalidPublicKey,

    #[error("Invalid packet signature")]
    InvalidSignature,

    #[error("Wrong number of bytes for nodes message ({0})")]
    InvalidNodesLength(usize),
}

fn bytes_to_sockaddr(bytes: [u8; 6]) -> SocketAddrV4 {
    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);

    SocketAddrV4::new(ip, port)
}

pub fn sockaddr_to_bytes(sockaddr: &SocketAddrV4) -> [u8; 6] {
    let mut bytes = [0_u8; 6];

    bytes[..4].copy_from_slice(&sockaddr.ip().octets());
    bytes[4..].copy_from_slice(&sockaddr.port().to_be_bytes());

    bytes
}

fn nodes4_to_bytes(nodes: &[Node]) -> Vec<u8> {
    let mut vec = Vec::with_capacity(nodes.len() * COMPACT_NODE_SIZE);

    for node in nodes {
        vec.extend_from_slice(node.id().as_bytes());
        vec.extend_from_slice(node.public_key());
        vec.extend_from_slice(&sockaddr_to_bytes(&node.address()));
    }

    vec
}

fn bytes_to_nodes4(bytes: &[u8]) -> Result<Vec<Node>, DecodeError> {
    if bytes.len() % COMPACT_NODE_SIZE != 0 {
        return Err(DecodeError::InvalidNodesLength(bytes.len()));
    }

    let mut nodes = Vec::with_capacity(bytes.len() / COMPACT_NODE_SIZE);

    for chunk in bytes.chunks_exact(COMPACT_NODE_SIZE) {
        let mut public_key = [0_u8; PUBLIC_KEY_SIZE];
        public_key.copy_from_slice(&chunk[ID_SIZE..ID_SIZE + PUBLIC_KEY_SIZE]);

        let mut address = [0_u8; 6];
        address.copy_from_slice(&chunk[ID_SIZE + PUBLIC_KEY_SIZE..]);

        let node = Node::new(public_key, bytes_to_sockaddr(address));

        // Ids are recomputed, a mismatch means the entry was forged.
        if node.id().as_bytes()[..] != chunk[..ID_SIZE] {
            tracing::trace!(?node, "Ignoring node with mismatching id");
            continue;
        }

        nodes.push(node);
    }

    Ok(nodes)
}

fn values_to_bytes(values: Vec<Bytes>) -> Vec<ByteBuf> {
    values
        .into_iter()
        .map(|value| ByteBuf::from(value.to_vec()))
        .collect()
}

fn bytes_to_values(values: Vec<ByteBuf>) -> Vec<Bytes> {
    values
        .into_iter()
        .map(|value| Bytes::from(value.into_vec()))
        .collect()
}
