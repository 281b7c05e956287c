//! AsyncDht node.

use std::net::SocketAddrV4;

use bytes::Bytes;

use crate::{
    common::{Id, Node, PublicKey},
    dht::{ActorMessage, Dht},
    error::DhtError,
    rpc::{FindResult, Info},
};

impl Dht {
    /// Return an async version of the Dht client.
    pub fn as_async(self) -> AsyncDht {
        AsyncDht(self)
    }
}

#[derive(Debug, Clone)]
/// Async version of the Dht node.
pub struct AsyncDht(Dht);

impl AsyncDht {
    // === Getters ===

    /// Information and statistics about this [Dht] node.
    pub async fn info(&self) -> Result<Info, DhtError> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.0.send(ActorMessage::Info(sender))?;

        receiver
            .recv_async()
            .await
            .map_err(|_| DhtError::DhtWasShutdown)
    }

    // === Public Methods ===

    /// Shutdown the actor thread loop.
    pub async fn shutdown(&mut self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.0.send(ActorMessage::Shutdown(sender));
        let _ = receiver.recv_async().await;
    }

    /// Wait until the first bootstrapping attempt concludes.
    ///
    /// Returns true if the bootstrapping was successful.
    pub async fn bootstrapped(&self) -> bool {
        let (sender, receiver) = flume::bounded::<bool>(1);

        if self.0.send(ActorMessage::Bootstrapped(sender)).is_err() {
            return false;
        }

        receiver.recv_async().await.unwrap_or(false)
    }

    /// Async version of [Dht::store_value].
    pub async fn store_value(
        &self,
        key: Id,
        data: &[u8],
        sign: bool,
    ) -> Result<Vec<Node>, DhtError> {
        let (sender, receiver) = flume::bounded::<Result<Vec<Node>, DhtError>>(1);

        self.0
            .send(ActorMessage::Store(key, data.into(), sign, sender))?;

        receiver
            .recv_async()
            .await
            .map_err(|_| DhtError::DhtWasShutdown)?
    }

    /// Async version of [Dht::find_values].
    pub async fn find_values(&self, key: Id) -> Result<Vec<(Bytes, Option<PublicKey>)>, DhtError> {
        self.find_values_from(key, 0).await
    }

    /// Async version of [Dht::find_values_from].
    pub async fn find_values_from(
        &self,
        key: Id,
        start_idx: u32,
    ) -> Result<Vec<(Bytes, Option<PublicKey>)>, DhtError> {
        match self.find(key, false, start_idx).await? {
            FindResult::Values(values) => Ok(values),
            FindResult::Nodes(_) => Ok(vec![]),
        }
    }

    /// Async version of [Dht::find_nodes].
    pub async fn find_nodes(&self, key: Id) -> Result<Vec<Node>, DhtError> {
        match self.find(key, true, 0).await? {
            FindResult::Nodes(nodes) => Ok(nodes),
            FindResult::Values(_) => Ok(vec![]),
        }
    }

    /// Async version of [Dht::ping].
    pub async fn ping(&self, address: SocketAddrV4) -> Result<Node, DhtError> {
        let (sender, receiver) = flume::bounded::<Result<Node, DhtError>>(1);

        self.0.send(ActorMessage::Ping(address, sender))?;

        receiver
            .recv_async()
            .await
            .map_err(|_| DhtError::DhtWasShutdown)?
    }

    /// Same as [Dht::add_node].
    pub fn add_node(&self, public_key: PublicKey, address: SocketAddrV4) -> Result<(), DhtError> {
        self.0.add_node(public_key, address)
    }

    // === Private Methods ===

    async fn find(
        &self,
        key: Id,
        force_nodes: bool,
        start_idx: u32,
    ) -> Result<FindResult, DhtError> {
        let (sender, receiver) = flume::bounded::<Result<FindResult, DhtError>>(1);

        self.0
            .send(ActorMessage::Find(key, force_nodes, start_idx, sender))?;

        receiver
            .recv_async()
            .await
            .map_err(|_| DhtError::DhtWasShutdown)?
    }
}

#[cfg(test)]
mod test {
    use ed25519_dalek::SigningKey;

    use crate::dht::Testnet;

    use super::*;

    #[test]
    fn shutdown() {
        async fn test() {
            let mut a = Dht::builder()
                .bind_address([127, 0, 0, 1].into())
                .build()
                .unwrap()
                .as_async();

            a.shutdown().await;

            assert_eq!(a.info().await.unwrap_err(), DhtError::DhtWasShutdown);
        }

        futures::executor::block_on(test());
    }

    #[test]
    fn store_find_unsigned() {
        async fn test() {
            let testnet = Testnet::new(10).unwrap();

            let a = Dht::builder()
                .bind_address([127, 0, 0, 1].into())
                .bootstrap(&testnet.bootstrap)
                .build()
                .unwrap()
                .as_async();
            let b = Dht::builder()
                .bind_address([127, 0, 0, 1].into())
                .bootstrap(&testnet.bootstrap)
                .build()
                .unwrap()
                .as_async();

            assert!(a.bootstrapped().await);
            assert!(b.bootstrapped().await);

            let key = Id::hash(b"async key");

            let stored_at = a.store_value(key, b"Hello World!", false).await.unwrap();
            assert!(!stored_at.is_empty());

            let values = b.find_values(key).await.unwrap();

            assert_eq!(values, vec![(Bytes::from_static(b"Hello World!"), None)]);
        }

        futures::executor::block_on(test());
    }

    #[test]
    fn store_find_signed() {
        async fn test() {
            let testnet = Testnet::new(10).unwrap();

            let signer = SigningKey::from_bytes(&[
                56, 171, 62, 85, 105, 58, 155, 209, 189, 8, 59, 109, 137, 84, 84, 201, 221, 115, 7,
                228, 127, 70, 4, 204, 182, 64, 77, 98, 92, 215, 27, 103,
            ]);

            let a = Dht::builder()
                .bind_address([127, 0, 0, 1].into())
                .bootstrap(&testnet.bootstrap)
                .signing_key(signer.clone())
                .build()
                .unwrap()
                .as_async();

            assert!(a.bootstrapped().await);

            let key = Id::hash(signer.verifying_key().as_bytes());

            a.store_value(key, b"signed", true).await.unwrap();

            let values = testnet.nodes[3].clone().as_async().find_values(key).await.unwrap();

            assert_eq!(
                values,
                vec![(
                    Bytes::from_static(b"signed"),
                    Some(signer.verifying_key().to_bytes())
                )]
            );
        }

        futures::executor::block_on(test());
    }
}
