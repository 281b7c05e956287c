//! Errors surfaced to callers of Dht operations.

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Dht operation errors. Never sent over the wire.
pub enum DhtError {
    /// The routing table is empty, or a lookup found no viable candidates.
    ///
    /// Usually means the node failed to bootstrap; check the machine's access
    /// to UDP, or find better bootstrapping nodes.
    #[error("No nodes available")]
    NoNodesAvailable,

    /// The encoded value exceeds [crate::MAX_ENTRY_SIZE].
    #[error("Maximum value length exceeded ({0} bytes)")]
    ValueTooLarge(usize),

    /// More than [crate::rpc::MAX_VALUES_IN_STORE] values in a single store.
    #[error("Too many values in a single store ({0})")]
    TooManyValues(usize),

    /// No node accepted the store, either for lack of a valid token or timeouts.
    #[error("Value was not stored")]
    StoreFailed,

    /// A single request timed out.
    #[error("Request timed out")]
    Timeout,

    /// The Dht actor thread is no longer running.
    #[error("Dht was shutdown")]
    DhtWasShutdown,
}
