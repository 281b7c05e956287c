use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTMessage {
    #[serde(rename = "t")]
    pub transaction_id: u32,

    /// Sender's ed25519 public key.
    #[serde(rename = "k", with = "serde_bytes")]
    pub public_key: [u8; 32],

    /// Sender's claimed global time.
    #[serde(rename = "g")]
    pub global_time: u64,

    #[serde(flatten)]
    pub variant: DHTMessageVariant,
}

impl DHTMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<DHTMessage, serde_bencode::Error> {
        let obj = serde_bencode::from_bytes(bytes)?;
        Ok(obj)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "y")]
pub enum DHTMessageVariant {
    #[serde(rename = "ping")]
    Ping {
        #[serde(rename = "a")]
        arguments: DHTEmptyArguments,
    },

    #[serde(rename = "pong")]
    Pong {
        #[serde(rename = "a")]
        arguments: DHTEmptyArguments,
    },

    #[serde(rename = "store")]
    StoreRequest {
        #[serde(rename = "a")]
        arguments: DHTStoreRequestArguments,
    },

    #[serde(rename = "stored")]
    StoreResponse {
        #[serde(rename = "a")]
        arguments: DHTEmptyArguments,
    },

    #[serde(rename = "find")]
    FindRequest {
        #[serde(rename = "a")]
        arguments: DHTFindRequestArguments,
    },

    #[serde(rename = "found")]
    FindResponse {
        #[serde(rename = "a")]
        arguments: DHTFindResponseArguments,
    },

    #[serde(rename = "puncture_request")]
    PunctureRequest {
        #[serde(rename = "a")]
        arguments: DHTPunctureRequestArguments,
    },

    #[serde(rename = "puncture")]
    Puncture {
        #[serde(rename = "a")]
        arguments: DHTEmptyArguments,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct DHTEmptyArguments {}

// === STORE ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTStoreRequestArguments {
    #[serde(with = "serde_bytes")]
    pub token: Box<[u8]>,

    #[serde(with = "serde_bytes")]
    pub target: [u8; 20],

    pub values: Vec<ByteBuf>,
}

// === FIND ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTFindRequestArguments {
    #[serde(rename = "lan", with = "serde_bytes")]
    pub lan_address: [u8; 6],

    #[serde(with = "serde_bytes")]
    pub target: [u8; 20],

    #[serde(rename = "start")]
    pub start_idx: u32,

    #[serde(rename = "force")]
    pub force_nodes: u8,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTFindResponseArguments {
    #[serde(with = "serde_bytes")]
    pub token: Box<[u8]>,

    // Non-empty values take precedence over nodes.
    pub values: Vec<ByteBuf>,

    #[serde(with = "serde_bytes")]
    pub nodes: Box<[u8]>,
}

// === PUNCTURE ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTPunctureRequestArguments {
    #[serde(rename = "lan", with = "serde_bytes")]
    pub lan_address: [u8; 6],

    #[serde(rename = "wan", with = "serde_bytes")]
    pub wan_address: [u8; 6],
}
