use std::net::SocketAddrV4;

use crate::common::{Id, PublicKey};

use super::Rpc;

/// Information and statistics about this Dht node.
#[derive(Debug, Clone)]
pub struct Info {
    id: Id,
    public_key: PublicKey,
    local_addr: SocketAddrV4,
    routing_table_size: usize,
    stored_keys: usize,
    bootstrapped: Option<bool>,
}

impl Info {
    /// This Node's [Id]
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Local Ipv4 socket address that this node is listening on.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    /// Number of nodes in the routing table.
    pub fn routing_table_size(&self) -> usize {
        self.routing_table_size
    }

    /// Number of keys this node holds values for.
    pub fn stored_keys(&self) -> usize {
        self.stored_keys
    }

    /// `None` until the first bootstrapping attempt concludes.
    pub fn bootstrapped(&self) -> Option<bool> {
        self.bootstrapped
    }
}

impl From<&Rpc> for Info {
    fn from(rpc: &Rpc) -> Self {
        Self {
            id: *rpc.id(),
            public_key: *rpc.public_key(),
            local_addr: rpc.local_addr(),
            routing_table_size: rpc.routing_table().size(),
            stored_keys: rpc.stored_keys(),
            bootstrapped: rpc.bootstrapped(),
        }
    }
}
