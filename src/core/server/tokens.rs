//! Manage write tokens, both the ones we issue and the ones we receive.

use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    time::{Duration, Instant},
};

use sha1_smol::Sha1;
use tracing::trace;

use crate::common::{Id, Node};

const SECRET_SIZE: usize = 20;

/// How long a token received from a remote node is used for stores.
pub const TOKEN_EXPIRATION_TIME: Duration = Duration::from_secs(10 * 60);

/// Tokens generator.
///
/// A token is bound to the requester's identity and one of the two most
/// recent secrets, so it stays valid for at least one rotation interval.
/// Rotation is scheduled by the routing maintenance timers.
#[derive(Clone)]
pub struct Tokens {
    prev_secret: [u8; SECRET_SIZE],
    curr_secret: [u8; SECRET_SIZE],
}

impl Debug for Tokens {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Tokens (_)")
    }
}

impl Tokens {
    /// Create a Tokens generator.
    pub fn new() -> Self {
        Tokens {
            prev_secret: rand::random(),
            curr_secret: rand::random(),
        }
    }

    // === Public Methods ===

    /// Validate that the token was generated from one of the two most recent secrets.
    pub fn validate(&self, node: &Node, token: &[u8]) -> bool {
        let prev = Self::internal_generate_token(node, &self.prev_secret);
        let curr = Self::internal_generate_token(node, &self.curr_secret);

        token == curr || token == prev
    }

    /// Rotate the tokens secret.
    pub fn rotate(&mut self) {
        trace!("Rotating secrets");

        self.prev_secret = self.curr_secret;
        self.curr_secret = rand::random();
    }

    /// Generates a new token for a remote node.
    pub fn generate_token(&self, node: &Node) -> [u8; 20] {
        Self::internal_generate_token(node, &self.curr_secret)
    }

    // === Private Methods ===

    fn internal_generate_token(node: &Node, secret: &[u8; SECRET_SIZE]) -> [u8; 20] {
        let mut hasher = Sha1::new();

        hasher.update(node.id().as_bytes());
        hasher.update(node.address().to_string().as_bytes());
        hasher.update(secret);

        hasher.digest().bytes()
    }
}

impl Default for Tokens {
    fn default() -> Self {
        Self::new()
    }
}

/// Tokens received in find responses, used to store on the same nodes later.
#[derive(Debug, Default)]
pub struct ReceivedTokens {
    tokens: HashMap<Id, (Instant, Vec<u8>)>,
}

impl ReceivedTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_at(&mut self, node: &Id, token: Vec<u8>, now: Instant) {
        self.tokens.insert(*node, (now, token));
    }

    /// Returns the token received from `node` if it did not expire yet.
    pub fn get_at(&self, node: &Id, now: Instant) -> Option<&[u8]> {
        self.tokens
            .get(node)
            .filter(|(received_at, _)| {
                now.saturating_duration_since(*received_at) < TOKEN_EXPIRATION_TIME
            })
            .map(|(_, token)| token.as_slice())
    }

    /// Forget expired tokens.
    pub fn purge_at(&mut self, now: Instant) {
        self.tokens.retain(|_, (received_at, _)| {
            now.saturating_duration_since(*received_at) < TOKEN_EXPIRATION_TIME
        });
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn valid_tokens() {
        let tokens = Tokens::new();

        let node = Node::random();
        let token = tokens.generate_token(&node);

        assert!(tokens.validate(&node, &token));
        assert!(!tokens.validate(&Node::random(), &token));
    }

    #[test]
    fn tokens_survive_one_rotation() {
        let mut tokens = Tokens::new();

        let node = Node::random();
        let token = tokens.generate_token(&node);

        tokens.rotate();
        assert!(tokens.validate(&node, &token));

        tokens.rotate();
        assert!(!tokens.validate(&node, &token));
    }

    #[test]
    fn received_tokens_expire() {
        let mut received = ReceivedTokens::new();
        let now = Instant::now();

        let node = Id::random();
        received.insert_at(&node, vec![1, 2, 3], now);

        let almost = now + TOKEN_EXPIRATION_TIME - Duration::from_secs(1);
        assert_eq!(received.get_at(&node, almost), Some(&[1, 2, 3][..]));

        let expired = now + TOKEN_EXPIRATION_TIME * 3;
        assert_eq!(received.get_at(&node, expired), None);

        received.purge_at(almost);
        assert_eq!(received.len(), 1);

        received.purge_at(expired);
        assert_eq!(received.len(), 0);
    }
}
