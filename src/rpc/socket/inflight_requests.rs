use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use crate::common::{Node, RequestKind};
use crate::rpc::QueryId;

/// What a request resolves to when its timeout elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Tolerated, the owner treats it as an empty result.
    EmptyOnTimeout,
    /// The owner treats it as a failure.
    FailOnTimeout,
}

/// The single resolution of a pending request.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion<T> {
    Completed(T),
    EmptyOnTimeout,
    FailedOnTimeout,
}

/// Who is waiting on a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestOwner {
    /// Liveness pings issued by maintenance.
    Maintenance,
    /// Pings to bootstrapping addresses.
    Bootstrap,
    Ping(QueryId),
    Find(QueryId),
    Store(QueryId),
}

#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub kind: RequestKind,
    pub transaction_id: u32,
    pub to: SocketAddrV4,
    /// The destination node if known, unknown for bootstrapping addresses.
    pub node: Option<Node>,
    pub owner: RequestOwner,
    pub policy: TimeoutPolicy,
    pub sent_at: Instant,
}

impl PendingRequest {
    pub fn does_match(&self, from: &SocketAddrV4) -> bool {
        if self.to.port() != from.port() {
            return false;
        }

        // Unspecified destinations only happen in tests binding to 0.0.0.0
        if self.to.ip().is_unspecified() {
            return true;
        }

        self.to.ip() == from.ip()
    }

    /// The [Completion] this request resolves to once it times out.
    pub fn timeout_completion<T>(&self) -> Completion<T> {
        match self.policy {
            TimeoutPolicy::EmptyOnTimeout => Completion::EmptyOnTimeout,
            TimeoutPolicy::FailOnTimeout => Completion::FailedOnTimeout,
        }
    }
}

/// Outstanding requests keyed by `(kind, transaction_id)`.
#[derive(Debug)]
pub struct RequestCache {
    timeout: Duration,
    // Insertion order, which is also `sent_at` order, removed entries are
    // left as `None` until the next compaction in [RequestCache::expire].
    requests: Vec<Option<PendingRequest>>,
    // Position of each live request in `requests`.
    index: HashMap<(RequestKind, u32), usize>,
    closed: bool,
}

impl RequestCache {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            requests: Vec::new(),
            index: HashMap::new(),
            closed: false,
        }
    }

    // === Getters ===

    /// Number of outstanding requests.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn has(&self, kind: RequestKind, transaction_id: u32) -> bool {
        self.index.contains_key(&(kind, transaction_id))
    }

    #[cfg(test)]
    pub fn is_shutdown(&self) -> bool {
        self.closed
    }

    // === Public Methods ===

    /// Returns a random transaction id not currently used by any request of `kind`.
    pub fn unique_id(&self, kind: RequestKind) -> u32 {
        loop {
            let id: u32 = rand::random();

            if !self.has(kind, id) {
                return id;
            }
        }
    }

    /// Register a new request, ignored after [RequestCache::shutdown].
    ///
    /// # Panics
    ///
    /// If a request with the same kind and transaction id is already pending.
    pub fn add(&mut self, request: PendingRequest) {
        if self.closed {
            return;
        }

        let key = (request.kind, request.transaction_id);

        assert!(
            !self.index.contains_key(&key),
            "shouldn't be adding the same transaction_id twice, use RequestCache::unique_id"
        );

        self.index.insert(key, self.requests.len());
        self.requests.push(Some(request));
    }

    /// Remove and return the request matching `kind` and `transaction_id`,
    /// if and only if it was sent to `from`.
    pub fn pop(
        &mut self,
        kind: RequestKind,
        transaction_id: u32,
        from: &SocketAddrV4,
    ) -> Option<PendingRequest> {
        let &position = self.index.get(&(kind, transaction_id))?;

        if !self.requests.get(position)?.as_ref()?.does_match(from) {
            return None;
        }

        self.index.remove(&(kind, transaction_id));
        self.requests.get_mut(position)?.take()
    }

    /// Remove every request older than the timeout, each paired with its
    /// timeout [Completion].
    pub fn expire<T>(&mut self, now: Instant) -> Vec<(PendingRequest, Completion<T>)> {
        let oldest_expired = self
            .requests
            .iter()
            .flatten()
            .next()
            .map(|request| now.saturating_duration_since(request.sent_at) >= self.timeout)
            .unwrap_or(false);
        let mostly_removed = self.requests.len() > 2 * self.index.len() + 16;

        if !oldest_expired && !mostly_removed {
            return Vec::new();
        }

        let mut expired = Vec::new();
        let mut remaining = Vec::with_capacity(self.index.len());
        self.index.clear();

        for request in self.requests.drain(..).flatten() {
            if now.saturating_duration_since(request.sent_at) >= self.timeout {
                let completion = request.timeout_completion();
                expired.push((request, completion));
            } else {
                self.index
                    .insert((request.kind, request.transaction_id), remaining.len());
                remaining.push(Some(request));
            }
        }

        self.requests = remaining;

        expired
    }

    /// Abandon every pending request without completing any of them.
    pub fn shutdown(&mut self) {
        self.closed = true;
        self.requests.clear();
        self.index.clear();
    }
}
