#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
mod common;
mod core;

#[cfg(feature = "async")]
pub mod async_dht;
mod dht;
mod error;
pub mod rpc;

pub use crate::common::{
    post_process_values, Id, Node, NodeStatus, PublicKey, Value, ValueError, MAX_ENTRY_SIZE,
};
pub use bytes::Bytes;
pub use dht::{Dht, DhtBuilder, Testnet};
pub use error::DhtError;

pub use ed25519_dalek::SigningKey;

pub mod errors {
    //! Errors of decoding messages and values.

    pub use super::common::{DecodeError, ValueError};
    pub use super::error::DhtError;
}

pub mod messages {
    //! Wire messages exchanged between Dht nodes.

    pub use super::common::messages::*;
}
