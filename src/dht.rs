//! Dht node.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use ed25519_dalek::SigningKey;
use flume::{Receiver, RecvError, Sender, TryRecvError};
use tracing::{debug, info};

use crate::common::{Id, Node, PublicKey};
use crate::error::DhtError;
use crate::rpc::transport::Transport;
use crate::rpc::{Config, FindResult, Info, QueryId, Rpc};

#[derive(Debug, Clone)]
/// Dht node, a handle to an actor thread running the [Rpc] loop.
///
/// Cloning is cheap, the thread stops once every handle is dropped.
pub struct Dht(pub(crate) Sender<ActorMessage>);

#[derive(Debug, Default)]
/// A builder for [Dht] nodes.
pub struct DhtBuilder(Config);

impl DhtBuilder {
    /// Set bootstrapping nodes, as `host:port` strings.
    pub fn bootstrap<T: ToString>(&mut self, bootstrap: &[T]) -> &mut Self {
        self.0.bootstrap = bootstrap.iter().map(|s| s.to_string()).collect();

        self
    }

    /// Set an explicit port to listen on.
    pub fn port(&mut self, port: u16) -> &mut Self {
        self.0.port = Some(port);

        self
    }

    /// Set the Ipv4 address to bind the UDP socket to, defaults to `0.0.0.0`.
    pub fn bind_address(&mut self, bind_address: Ipv4Addr) -> &mut Self {
        self.0.bind_address = bind_address;

        self
    }

    /// Set the timeout of each request, see [Config::request_timeout].
    pub fn request_timeout(&mut self, request_timeout: Duration) -> &mut Self {
        self.0.request_timeout = request_timeout;

        self
    }

    /// Set the key pair identifying this node and signing its values.
    pub fn signing_key(&mut self, signing_key: SigningKey) -> &mut Self {
        self.0.signing_key = Some(signing_key);

        self
    }

    /// Use a custom [Transport] instead of a UDP socket.
    pub fn transport(&mut self, transport: Box<dyn Transport>) -> &mut Self {
        self.0.transport = Some(transport);

        self
    }

    /// Create a Dht node.
    pub fn build(&mut self) -> Result<Dht, std::io::Error> {
        Dht::new(std::mem::take(&mut self.0))
    }
}

impl Dht {
    /// Create a new Dht node.
    ///
    /// Binds the transport before returning, then runs the node in its own thread.
    pub fn new(config: Config) -> Result<Self, std::io::Error> {
        let (sender, receiver) = flume::unbounded();

        let mut actor = Actor::new(config, receiver)?;

        thread::Builder::new()
            .name("kadstore".to_string())
            .spawn(move || while actor.tick().is_ok() {})?;

        Ok(Dht(sender))
    }

    /// Returns a builder to edit settings before creating a Dht node.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    // === Getters ===

    /// Information and statistics about this [Dht] node.
    pub fn info(&self) -> Result<Info, DhtError> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.send(ActorMessage::Info(sender))?;

        receiver.recv().map_err(|_| DhtError::DhtWasShutdown)
    }

    // === Public Methods ===

    /// Block until the first bootstrapping attempt concludes.
    ///
    /// Returns `true` if the routing table got populated, or if this node has
    /// no bootstrapping nodes to begin with.
    pub fn bootstrapped(&self) -> bool {
        let (sender, receiver) = flume::bounded::<bool>(1);

        if self.send(ActorMessage::Bootstrapped(sender)).is_err() {
            return false;
        }

        receiver.recv().unwrap_or(false)
    }

    /// Stop the actor thread loop, and wait for it to abandon inflight requests.
    pub fn shutdown(&mut self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.0.send(ActorMessage::Shutdown(sender));
        let _ = receiver.recv();
    }

    /// Store `data` at the nodes closest to `key`, signed with this node's
    /// key if `sign` is set.
    ///
    /// Returns the nodes that acknowledged the store.
    pub fn store_value(&self, key: Id, data: &[u8], sign: bool) -> Result<Vec<Node>, DhtError> {
        let (sender, receiver) = flume::bounded::<Result<Vec<Node>, DhtError>>(1);

        self.send(ActorMessage::Store(key, data.into(), sign, sender))?;

        receiver.recv().map_err(|_| DhtError::DhtWasShutdown)?
    }

    /// Find values stored under `key`.
    ///
    /// Returns the latest value of each signer with its public key, followed
    /// by unsigned values.
    pub fn find_values(&self, key: Id) -> Result<Vec<(Bytes, Option<PublicKey>)>, DhtError> {
        self.find_values_from(key, 0)
    }

    /// Same as [Dht::find_values], skipping the first `start_idx` values at each responder.
    pub fn find_values_from(
        &self,
        key: Id,
        start_idx: u32,
    ) -> Result<Vec<(Bytes, Option<PublicKey>)>, DhtError> {
        match self.find(key, false, start_idx)? {
            FindResult::Values(values) => Ok(values),
            FindResult::Nodes(_) => Ok(vec![]),
        }
    }

    /// Find the nodes closest to `key`, closest first.
    pub fn find_nodes(&self, key: Id) -> Result<Vec<Node>, DhtError> {
        match self.find(key, true, 0)? {
            FindResult::Nodes(nodes) => Ok(nodes),
            FindResult::Values(_) => Ok(vec![]),
        }
    }

    /// Ping `address`, returning the responding node.
    ///
    /// Errors with [DhtError::Timeout] if it did not respond in time.
    pub fn ping(&self, address: SocketAddrV4) -> Result<Node, DhtError> {
        let (sender, receiver) = flume::bounded::<Result<Node, DhtError>>(1);

        self.send(ActorMessage::Ping(address, sender))?;

        receiver.recv().map_err(|_| DhtError::DhtWasShutdown)?
    }

    /// Add a node discovered by other means to the routing table.
    ///
    /// New nodes are pinged to measure their round trip time.
    pub fn add_node(&self, public_key: PublicKey, address: SocketAddrV4) -> Result<(), DhtError> {
        self.send(ActorMessage::AddNode(public_key, address))
    }

    // === Private Methods ===

    pub(crate) fn send(&self, message: ActorMessage) -> Result<(), DhtError> {
        self.0.send(message).map_err(|_| DhtError::DhtWasShutdown)
    }

    fn find(&self, key: Id, force_nodes: bool, start_idx: u32) -> Result<FindResult, DhtError> {
        let (sender, receiver) = flume::bounded::<Result<FindResult, DhtError>>(1);

        self.send(ActorMessage::Find(key, force_nodes, start_idx, sender))?;

        receiver.recv().map_err(|_| DhtError::DhtWasShutdown)?
    }
}

#[derive(Debug)]
struct Actor {
    rpc: Rpc,
    receiver: Receiver<ActorMessage>,
    find_senders: HashMap<QueryId, Sender<Result<FindResult, DhtError>>>,
    store_senders: HashMap<QueryId, Sender<Result<Vec<Node>, DhtError>>>,
    ping_senders: HashMap<QueryId, Sender<Result<Node, DhtError>>>,
    bootstrapped_senders: Vec<Sender<bool>>,
}

impl Actor {
    fn new(config: Config, receiver: Receiver<ActorMessage>) -> std::io::Result<Self> {
        let rpc = Rpc::new(config)?;

        let address = rpc.local_addr();
        info!(?address, "Dht node listening");

        Ok(Self {
            rpc,
            receiver,
            find_senders: HashMap::new(),
            store_senders: HashMap::new(),
            ping_senders: HashMap::new(),
            bootstrapped_senders: Vec::new(),
        })
    }

    /// Returns an error once the thread should stop.
    fn tick(&mut self) -> Result<(), RecvError> {
        match self.receiver.try_recv() {
            Ok(actor_message) => match actor_message {
                ActorMessage::Info(sender) => {
                    let _ = sender.send(self.rpc.info());
                }
                ActorMessage::Bootstrapped(sender) => {
                    self.bootstrapped_senders.push(sender);
                }
                ActorMessage::Store(key, data, sign, sender) => {
                    match self.rpc.store(key, &data, sign) {
                        Ok(id) => {
                            self.store_senders.insert(id, sender);
                        }
                        Err(error) => {
                            let _ = sender.send(Err(error));
                        }
                    }
                }
                ActorMessage::Find(key, force_nodes, start_idx, sender) => {
                    match self.rpc.find(key, force_nodes, start_idx) {
                        Ok(id) => {
                            self.find_senders.insert(id, sender);
                        }
                        Err(error) => {
                            let _ = sender.send(Err(error));
                        }
                    }
                }
                ActorMessage::Ping(address, sender) => {
                    let id = self.rpc.ping(address);
                    self.ping_senders.insert(id, sender);
                }
                ActorMessage::AddNode(public_key, address) => {
                    self.rpc.add_node(public_key, address);
                }
                ActorMessage::Shutdown(sender) => {
                    self.rpc.shutdown();
                    debug!("Dht's actor thread was shutdown");

                    // Pending callers observe the disconnection.
                    self.find_senders.clear();
                    self.store_senders.clear();
                    self.ping_senders.clear();

                    let _ = sender.send(());
                    return Err(RecvError::Disconnected);
                }
            },
            Err(TryRecvError::Disconnected) => {
                // Every handle was dropped, kill this thread.
                debug!("Dht's actor thread was shutdown after Drop.");
                self.rpc.shutdown();
                return Err(RecvError::Disconnected);
            }
            Err(TryRecvError::Empty) => {
                // No op
            }
        }

        let report = self.rpc.tick();

        for (id, result) in report.done_find_queries {
            if let Some(sender) = self.find_senders.remove(&id) {
                let _ = sender.send(result);
            }
        }

        for (id, result) in report.done_store_queries {
            if let Some(sender) = self.store_senders.remove(&id) {
                let _ = sender.send(result);
            }
        }

        for (id, result) in report.done_pings {
            if let Some(sender) = self.ping_senders.remove(&id) {
                let _ = sender.send(result);
            }
        }

        if let Some(bootstrapped) = self.rpc.bootstrapped() {
            for sender in self.bootstrapped_senders.drain(..) {
                let _ = sender.send(bootstrapped);
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
pub(crate) enum ActorMessage {
    Info(Sender<Info>),
    Bootstrapped(Sender<bool>),
    Store(Id, Box<[u8]>, bool, Sender<Result<Vec<Node>, DhtError>>),
    Find(Id, bool, u32, Sender<Result<FindResult, DhtError>>),
    Ping(SocketAddrV4, Sender<Result<Node, DhtError>>),
    AddNode(PublicKey, SocketAddrV4),
    Shutdown(Sender<()>),
}

/// Create a testnet of Dht nodes to run tests against instead of a real network.
#[derive(Debug)]
pub struct Testnet {
    pub bootstrap: Vec<String>,
    pub nodes: Vec<Dht>,
}

impl Testnet {
    /// Start `count` nodes on localhost, the first one bootstrapping the rest.
    ///
    /// Returns once every node finished bootstrapping.
    pub fn new(count: usize) -> Result<Testnet, std::io::Error> {
        let mut nodes: Vec<Dht> = vec![];
        let mut bootstrap = vec![];

        for i in 0..count {
            if i == 0 {
                let node = Dht::builder().bind_address(Ipv4Addr::LOCALHOST).build()?;

                let info = node.info().map_err(std::io::Error::other)?;
                bootstrap.push(info.local_addr().to_string());

                nodes.push(node)
            } else {
                let node = Dht::builder()
                    .bind_address(Ipv4Addr::LOCALHOST)
                    .bootstrap(&bootstrap)
                    .build()?;

                node.bootstrapped();

                nodes.push(node)
            }
        }

        Ok(Self { bootstrap, nodes })
    }

    /// Returns the bootstrapping nodes of this testnet.
    pub fn bootstrap(&self) -> &[String] {
        &self.bootstrap
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use crate::common::Value;
    use crate::rpc::transport::MemoryNetwork;

    use super::*;

    #[test]
    fn shutdown() {
        let mut dht = Dht::builder()
            .bind_address(Ipv4Addr::LOCALHOST)
            .build()
            .unwrap();

        let clone = dht.clone();

        dht.shutdown();

        assert_eq!(clone.info().unwrap_err(), DhtError::DhtWasShutdown);
        assert_eq!(
            clone.find_nodes(Id::random()).unwrap_err(),
            DhtError::DhtWasShutdown
        );
    }

    #[test]
    fn lonely_node() {
        let dht = Dht::builder()
            .bind_address(Ipv4Addr::LOCALHOST)
            .build()
            .unwrap();

        assert!(dht.bootstrapped());
        assert_eq!(
            dht.find_values(Id::random()),
            Err(DhtError::NoNodesAvailable)
        );
        assert_eq!(
            dht.store_value(Id::random(), b"lonely", false),
            Err(DhtError::NoNodesAvailable)
        );
    }

    #[test]
    fn value_too_large() {
        let dht = Dht::builder()
            .bind_address(Ipv4Addr::LOCALHOST)
            .build()
            .unwrap();

        let data = [0; 200];

        assert_eq!(
            dht.store_value(Id::random(), &data, false),
            Err(DhtError::ValueTooLarge(Value::unsigned(&data).len()))
        );
    }

    #[test]
    fn bind_twice() {
        let a = Dht::builder()
            .bind_address(Ipv4Addr::LOCALHOST)
            .build()
            .unwrap();

        let port = a.info().unwrap().local_addr().port();

        let result = Dht::builder()
            .bind_address(Ipv4Addr::LOCALHOST)
            .port(port)
            .build();

        assert!(result.is_err());
    }

    #[test]
    fn ping() {
        let testnet = Testnet::new(2).unwrap();

        let a = &testnet.nodes[0];
        let b = testnet.nodes[1].info().unwrap();

        let node = a.ping(b.local_addr()).unwrap();

        assert_eq!(node.id(), b.id());
    }

    #[test]
    fn ping_timeout() {
        let dht = Dht::builder()
            .bind_address(Ipv4Addr::LOCALHOST)
            .request_timeout(Duration::from_millis(100))
            .build()
            .unwrap();

        let start = Instant::now();

        // Nothing listens on port 9 of localhost.
        assert_eq!(
            dht.ping(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9)),
            Err(DhtError::Timeout)
        );
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn memory_transport() {
        let network = MemoryNetwork::new();
        let a_address = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1);

        let a = Dht::builder()
            .transport(Box::new(network.bind(a_address).unwrap()))
            .build()
            .unwrap();
        let b = Dht::builder()
            .bootstrap(&[a_address])
            .transport(Box::new(
                network
                    .bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 2))
                    .unwrap(),
            ))
            .build()
            .unwrap();

        assert!(b.bootstrapped());

        let a_info = a.info().unwrap();
        assert_eq!(b.ping(a_address).unwrap().id(), a_info.id());
        assert_eq!(a_info.routing_table_size(), 1);
    }
}
