//! Rpc, the I/O orchestration layer of the Dht.

mod config;
mod handle_request;
mod handle_response;
mod info;
pub(crate) mod socket;
pub mod transport;

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::time::Instant;

use bytes::Bytes;
use ed25519_dalek::SigningKey;
use tracing::{debug, error, info, trace};

use crate::common::{Id, MessageType, Node, PublicKey, RoutingTable, Value, MAX_ENTRY_SIZE};
use crate::core::iterative_query::{FindOutcome, FindQuery, MAX_FIND_WALKS};
use crate::core::routing_maintenance::RoutingMaintenance;
use crate::core::server::storage::MAX_ENTRY_AGE;
use crate::core::server::tokens::ReceivedTokens;
use crate::core::server::Server;
use crate::core::store_query::{should_store_locally, StoreQuery};
use crate::error::DhtError;

use socket::inflight_requests::{RequestOwner, TimeoutPolicy};
use socket::DhtSocket;
use transport::UdpTransport;

pub use crate::core::iterative_query::MAX_FIND_STEPS;
pub use crate::core::server::{
    MAX_NODES_IN_FIND, MAX_VALUES_IN_FIND, MAX_VALUES_IN_STORE, TARGET_NODES,
};
pub use config::Config;
pub use info::Info;
pub use socket::DEFAULT_REQUEST_TIMEOUT;

/// Identifies a find, store or ping started on an [Rpc].
pub type QueryId = u64;

/// The result of a find, depending on whether it asked for nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum FindResult {
    /// Every node tried, closest to the target first.
    Nodes(Vec<Node>),
    /// The latest value per signer, followed by unsigned values.
    Values(Vec<(Bytes, Option<PublicKey>)>),
}

/// Queries that finished during an [Rpc::tick].
#[derive(Debug, Default)]
pub struct RpcTickReport {
    pub done_find_queries: Vec<(QueryId, Result<FindResult, DhtError>)>,
    /// Nodes that acknowledged the store.
    pub done_store_queries: Vec<(QueryId, Result<Vec<Node>, DhtError>)>,
    pub done_pings: Vec<(QueryId, Result<Node, DhtError>)>,
}

/// Why a [FindQuery] was started, decides what happens with its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FindPurpose {
    /// Reported in [RpcTickReport::done_find_queries].
    Caller,
    /// Looking up the closest nodes for the store query with this id.
    Store(QueryId),
    /// Bucket refresh, the outcome is dropped.
    Refresh,
    /// Lookup of our own id once bootstrapping nodes responded.
    Bootstrap,
}

#[derive(Debug)]
/// Internal Rpc called in the Dht thread loop, useful to create your own actor setup.
pub struct Rpc {
    // Options
    bootstrap: Box<[SocketAddrV4]>,

    socket: DhtSocket,

    // Routing
    /// Closest nodes to this node
    routing_table: RoutingTable,
    /// Routing table maintenance (ping, refresh and token timing)
    maintenance: RoutingMaintenance,

    server: Server,
    /// Tokens other nodes gave us in find responses.
    received_tokens: ReceivedTokens,

    next_query_id: QueryId,
    find_queries: HashMap<QueryId, (FindQuery, FindPurpose)>,
    /// Store queries, and whether they are reported to the caller.
    store_queries: HashMap<QueryId, (StoreQuery, bool)>,

    done_find_queries: Vec<(QueryId, Result<FindResult, DhtError>)>,
    done_store_queries: Vec<(QueryId, Result<Vec<Node>, DhtError>)>,
    done_pings: Vec<(QueryId, Result<Node, DhtError>)>,

    // Bootstrapping
    bootstrap_pings: usize,
    bootstrapping: bool,
    bootstrapped: Option<bool>,
}

impl Rpc {
    /// Creates a new Rpc. Does not perform network I/O, call [Rpc::tick] to
    /// bootstrap and run scheduled maintenance.
    pub fn new(config: Config) -> Result<Self, std::io::Error> {
        let transport = match config.transport {
            Some(transport) => transport,
            None => Box::new(UdpTransport::bind(config.bind_address, config.port)?),
        };

        let signer = config
            .signing_key
            .unwrap_or_else(|| SigningKey::from_bytes(&rand::random()));

        let socket = DhtSocket::new(transport, signer, config.request_timeout);

        let local_addr = socket.local_addr();
        let id = Id::from_public_key(socket.public_key(), local_addr.ip());

        let bootstrap: Box<[SocketAddrV4]> = to_socket_address(&config.bootstrap)
            .into_iter()
            .filter(|address| *address != local_addr)
            .collect();

        info!(?id, ?local_addr, bootstrap = bootstrap.len(), "Starting Dht node");

        Ok(Rpc {
            bootstrapped: bootstrap.is_empty().then_some(true),
            bootstrap,

            socket,

            routing_table: RoutingTable::new(id),
            maintenance: RoutingMaintenance::new(),

            server: Server::new(),
            received_tokens: ReceivedTokens::new(),

            next_query_id: 0,
            find_queries: HashMap::new(),
            store_queries: HashMap::new(),

            done_find_queries: Vec::new(),
            done_store_queries: Vec::new(),
            done_pings: Vec::new(),

            bootstrap_pings: 0,
            bootstrapping: false,
        })
    }

    // === Getters ===

    /// Returns the node's Id
    pub fn id(&self) -> &Id {
        self.routing_table.id()
    }

    pub fn public_key(&self) -> &PublicKey {
        self.socket.public_key()
    }

    /// Returns the address the transport is bound to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.socket.local_addr()
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    /// Number of keys held in local storage.
    pub fn stored_keys(&self) -> usize {
        self.server.storage().len()
    }

    /// `None` while the first bootstrapping attempt is in progress, then whether
    /// it populated the routing table.
    pub fn bootstrapped(&self) -> Option<bool> {
        self.bootstrapped
    }

    /// Returns a thread safe and lightweight summary of this node's
    /// information and statistics.
    pub fn info(&self) -> Info {
        Info::from(self)
    }

    // === Public Methods ===

    /// Advances maintenance and inflight queries by one step.
    ///
    /// Call periodically, delays degrade query completion and routing table quality.
    pub fn tick(&mut self) -> RpcTickReport {
        self.handle_message();
        self.handle_timeouts();

        self.maintenance();

        self.tick_find_queries();
        self.tick_store_queries();

        RpcTickReport {
            done_find_queries: std::mem::take(&mut self.done_find_queries),
            done_store_queries: std::mem::take(&mut self.done_store_queries),
            done_pings: std::mem::take(&mut self.done_pings),
        }
    }

    /// Start an iterative lookup toward `target`, its result is reported in
    /// [RpcTickReport::done_find_queries].
    ///
    /// With `force_nodes` the closest nodes are returned instead of values.
    pub fn find(
        &mut self,
        target: Id,
        force_nodes: bool,
        start_idx: u32,
    ) -> Result<QueryId, DhtError> {
        self.start_find(target, force_nodes, start_idx, FindPurpose::Caller)
    }

    /// Store `data` on the nodes closest to `key`, optionally signed with this node's key.
    ///
    /// The nodes that acknowledged are reported in [RpcTickReport::done_store_queries].
    pub fn store(&mut self, key: Id, data: &[u8], sign: bool) -> Result<QueryId, DhtError> {
        let value = if sign {
            Value::signed(data, self.socket.signer())
        } else {
            Value::unsigned(data)
        };

        self.store_values(key, vec![value])
    }

    /// Store already encoded values, see [Value].
    pub fn store_values(&mut self, key: Id, values: Vec<Bytes>) -> Result<QueryId, DhtError> {
        if values.len() > MAX_VALUES_IN_STORE {
            return Err(DhtError::TooManyValues(values.len()));
        }
        if let Some(value) = values.iter().find(|value| value.len() > MAX_ENTRY_SIZE) {
            return Err(DhtError::ValueTooLarge(value.len()));
        }

        let store_id = self.next_query_id();
        self.start_find(key, true, 0, FindPurpose::Store(store_id))?;

        self.store_queries
            .insert(store_id, (StoreQuery::new(store_id, key, values), true));

        Ok(store_id)
    }

    /// Ping `address`, the responding node is reported in [RpcTickReport::done_pings].
    pub fn ping(&mut self, address: SocketAddrV4) -> QueryId {
        let id = self.next_query_id();

        let node = self
            .routing_table
            .nodes()
            .find(|node| node.address() == address)
            .cloned();

        self.socket.request(
            address,
            node,
            RequestOwner::Ping(id),
            TimeoutPolicy::FailOnTimeout,
            MessageType::Ping,
        );

        id
    }

    /// Add a node discovered through other means, and ping it if it is new.
    pub fn add_node(&mut self, public_key: PublicKey, address: SocketAddrV4) {
        let node = Node::new(public_key, address);

        if self.routing_table.has(node.id()) {
            return;
        }

        if self.routing_table.add(node.clone()).is_some() {
            debug!(?node, "Added node to the routing table");

            self.socket.request(
                address,
                Some(node),
                RequestOwner::Maintenance,
                TimeoutPolicy::FailOnTimeout,
                MessageType::Ping,
            );
        }
    }

    /// Run the periodic maintenance that is due, called by [Rpc::tick].
    pub fn maintenance(&mut self) {
        let decisions = self
            .maintenance
            .periodic_maintenance_decisions(&self.routing_table);

        if decisions.should_rotate_tokens {
            self.server.rotate_tokens();
            self.received_tokens.purge_at(Instant::now());
        }

        if !decisions.nodes_to_purge.is_empty() || !decisions.nodes_to_ping.is_empty() {
            for id in &decisions.nodes_to_purge {
                self.routing_table.remove(id);
            }

            for (id, address) in &decisions.nodes_to_ping {
                self.socket.request(
                    *address,
                    self.routing_table.get(id).cloned(),
                    RequestOwner::Maintenance,
                    TimeoutPolicy::FailOnTimeout,
                    MessageType::Ping,
                );
            }

            debug!(
                removed = decisions.nodes_to_purge.len(),
                pinged = decisions.nodes_to_ping.len(),
                "Node maintenance executed"
            );
        }

        if decisions.should_bootstrap {
            self.bootstrap();
        }

        if !decisions.buckets_to_refresh.is_empty() {
            let now = Instant::now();

            for distance in decisions.buckets_to_refresh {
                let target = self.id().random_at_distance(distance);

                if let Err(error) = self.start_find(target, false, 0, FindPurpose::Refresh) {
                    debug!(?error, distance, "Failed to refresh bucket");
                }

                self.routing_table.touch_bucket(distance, now);
            }
        }

        if decisions.should_sweep_storage {
            self.server.sweep();
        }
    }

    /// Abandon every inflight request, nothing is completed afterwards.
    pub fn shutdown(&mut self) {
        self.socket.shutdown();
        self.find_queries.clear();
        self.store_queries.clear();
    }

    // === Private Methods ===

    fn next_query_id(&mut self) -> QueryId {
        self.next_query_id += 1;
        self.next_query_id
    }

    fn start_find(
        &mut self,
        target: Id,
        force_nodes: bool,
        start_idx: u32,
        purpose: FindPurpose,
    ) -> Result<QueryId, DhtError> {
        let seeds = self
            .routing_table
            .closest_nodes(&target, MAX_FIND_WALKS, None);

        if seeds.is_empty() {
            debug!(?target, "No nodes found in the routing table");
            return Err(DhtError::NoNodesAvailable);
        }

        let id = self.next_query_id();

        let mut query = FindQuery::new(
            id,
            target,
            force_nodes,
            start_idx,
            self.local_addr(),
            seeds,
        );
        query.start(&mut self.socket);

        self.find_queries.insert(id, (query, purpose));

        Ok(id)
    }

    fn handle_message(&mut self) {
        match self.socket.recv_from() {
            Some(socket::Incoming::Request { message, from }) => {
                self.handle_request(from, message);
            }
            Some(socket::Incoming::Response {
                message,
                from,
                request,
            }) => {
                self.handle_response(from, message, request);
            }
            None => {}
        }
    }

    /// Resolve every timed out request with its owner, exactly once.
    fn handle_timeouts(&mut self) {
        for (request, completion) in self.socket.expire::<()>(Instant::now()) {
            if let Some(node) = &request.node {
                trace!(?node, kind = ?request.kind, "Request timed out");

                if let Some(state) = self.routing_table.state_mut(node.id()) {
                    state.record_timeout();
                }
            }

            match request.owner {
                RequestOwner::Maintenance => {}
                RequestOwner::Bootstrap => {
                    self.bootstrap_pings = self.bootstrap_pings.saturating_sub(1);

                    if self.bootstrap_pings == 0
                        && !self.bootstrapping
                        && self.routing_table.is_empty()
                    {
                        self.on_bootstrap_done();
                    }
                }
                RequestOwner::Ping(id) => {
                    self.done_pings.push((id, Err(DhtError::Timeout)));
                }
                RequestOwner::Find(id) => {
                    if let Some((query, _)) = self.find_queries.get_mut(&id) {
                        query.on_completion(request.transaction_id, request.timeout_completion());
                    }
                }
                RequestOwner::Store(id) => {
                    if let Some((query, _)) = self.store_queries.get_mut(&id) {
                        query.on_completion(request.transaction_id, completion);
                    }
                }
            }
        }
    }

    fn tick_find_queries(&mut self) {
        let mut done = Vec::new();

        for (id, (query, _)) in self.find_queries.iter_mut() {
            if let Some(outcome) = query.tick(&mut self.socket) {
                done.push((*id, outcome));
            }
        }

        for (id, outcome) in done {
            if let Some((query, purpose)) = self.find_queries.remove(&id) {
                self.on_find_done(id, query.target(), purpose, outcome);
            }
        }
    }

    fn tick_store_queries(&mut self) {
        let done: Vec<(QueryId, Result<Vec<Node>, DhtError>)> = self
            .store_queries
            .iter()
            .filter_map(|(id, (query, _))| query.tick().map(|result| (*id, result)))
            .collect();

        for (id, result) in done {
            if let Some((_, true)) = self.store_queries.remove(&id) {
                self.done_store_queries.push((id, result));
            }
        }
    }

    fn on_find_done(&mut self, id: QueryId, target: Id, purpose: FindPurpose, outcome: FindOutcome) {
        let result = match outcome {
            FindOutcome::Nodes(nodes) => FindResult::Nodes(nodes),
            FindOutcome::Values {
                values,
                merged,
                cache_on,
            } => {
                if let Some(node) = cache_on {
                    if !merged.is_empty() {
                        self.cache_values(target, merged, node);
                    }
                }

                FindResult::Values(values)
            }
        };

        match purpose {
            FindPurpose::Caller => self.done_find_queries.push((id, Ok(result))),
            FindPurpose::Store(store_id) => {
                let mut nodes = match result {
                    FindResult::Nodes(nodes) => nodes,
                    FindResult::Values(_) => vec![],
                };
                nodes.truncate(TARGET_NODES);

                if let Err(error) = self.store_on_nodes(store_id, &nodes) {
                    if let Some((_, true)) = self.store_queries.remove(&store_id) {
                        self.done_store_queries.push((store_id, Err(error)));
                    }
                }
            }
            FindPurpose::Refresh => {
                trace!(?target, "Bucket refreshed");
            }
            FindPurpose::Bootstrap => {
                self.bootstrapping = false;
                self.on_bootstrap_done();
            }
        }
    }

    /// Store the values found by a lookup on the latest node that answered with nodes instead.
    fn cache_values(&mut self, target: Id, values: Vec<Bytes>, node: Node) {
        let id = self.next_query_id();

        self.store_queries
            .insert(id, (StoreQuery::new(id, target, values), false));

        if let Err(error) = self.store_on_nodes(id, &[node]) {
            debug!(?error, ?target, "Failed to cache values");
            self.store_queries.remove(&id);
        }
    }

    /// Store the values of a [StoreQuery] locally if we are close enough, and
    /// send them to the nodes we hold a token from.
    fn store_on_nodes(&mut self, store_id: QueryId, nodes: &[Node]) -> Result<(), DhtError> {
        if nodes.is_empty() {
            return Err(DhtError::NoNodesAvailable);
        }

        let Some((query, _)) = self.store_queries.get_mut(&store_id) else {
            return Ok(());
        };

        let target = query.target();

        if should_store_locally(self.routing_table.id(), &target, nodes) {
            for value in query.values().iter().rev() {
                self.server.add_value(target, value.clone(), MAX_ENTRY_AGE);
            }
        }

        let now = Instant::now();

        let with_tokens: Vec<(Node, Vec<u8>)> = nodes
            .iter()
            .filter_map(|node| match self.received_tokens.get_at(node.id(), now) {
                Some(token) => Some((node.clone(), token.to_vec())),
                None => {
                    debug!(?node, "Not sending store request, no token available");
                    None
                }
            })
            .collect();

        query.start(&mut self.socket, with_tokens)
    }

    /// Ping the bootstrapping nodes, the first response starts a lookup of our own id.
    fn bootstrap(&mut self) {
        if self.bootstrap.is_empty() {
            return;
        }

        debug!(bootstrap = self.bootstrap.len(), "Pinging bootstrapping nodes");

        for address in self.bootstrap.clone() {
            self.socket.request(
                address,
                None,
                RequestOwner::Bootstrap,
                TimeoutPolicy::FailOnTimeout,
                MessageType::Ping,
            );
            self.bootstrap_pings += 1;
        }
    }

    fn on_bootstrap_done(&mut self) {
        let id = *self.id();
        let table_size = self.routing_table.size();

        if table_size == 0 {
            error!(?id, "Could not bootstrap the routing table");
            if self.bootstrapped.is_none() {
                self.bootstrapped = Some(false);
            }
        } else {
            info!(?id, table_size, "Bootstrapped the routing table");
            self.bootstrapped = Some(true);
        }
    }

    /// Look up our own id to populate the routing table with our neighbours.
    fn lookup_self(&mut self) {
        if self.bootstrapping {
            return;
        }

        let id = *self.id();

        match self.start_find(id, true, 0, FindPurpose::Bootstrap) {
            Ok(_) => {
                debug!(?id, "Bootstrapping the routing table");
                self.bootstrapping = true;
            }
            Err(error) => debug!(?error, "Could not start bootstrapping lookup"),
        }
    }
}

pub(crate) fn to_socket_address<T: ToSocketAddrs>(bootstrap: &[T]) -> Vec<SocketAddrV4> {
    bootstrap
        .iter()
        .flat_map(|s| {
            s.to_socket_addrs().map(|addrs| {
                addrs
                    .filter_map(|addr| match addr {
                        SocketAddr::V4(addr_v4) => Some(addr_v4),
                        _ => None,
                    })
                    .collect::<Box<[_]>>()
            })
        })
        .flatten()
        .collect()
}
