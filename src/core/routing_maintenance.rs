//! Periodic maintenance decisions.

use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use crate::common::{Id, NodeStatus, RoutingTable};

/// Interval between liveness pings to nodes that did not respond recently.
pub const PING_INTERVAL: Duration = Duration::from_secs(25);
/// Interval between bucket refreshes and storage sweeps.
pub const VALUE_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Interval between token secret rotations.
pub const TOKEN_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Age after which a bucket that did not change is refreshed with a lookup.
pub const BUCKET_REFRESH_AGE: Duration = Duration::from_secs(15 * 60);
/// Interval between bootstrapping attempts while the routing table is empty.
pub const BOOTSTRAP_INTERVAL: Duration = Duration::from_secs(5);

/// Routing table maintenance state
#[derive(Debug)]
pub struct RoutingMaintenance {
    last_ping: Instant,
    last_value_maintenance: Instant,
    last_token_rotation: Instant,
    last_bootstrap: Option<Instant>,
}

/// Decisions about what maintenance to perform now.
#[derive(Debug, Default)]
pub struct MaintenanceDecisions {
    /// Ping bootstrapping nodes, the routing table is empty.
    pub should_bootstrap: bool,

    /// Rotate token secrets and purge expired received tokens.
    pub should_rotate_tokens: bool,

    /// Node IDs to purge from the routing table.
    pub nodes_to_purge: Vec<Id>,

    /// Nodes to ping.
    pub nodes_to_ping: Vec<(Id, SocketAddrV4)>,

    /// Distances of buckets to refresh with a lookup.
    pub buckets_to_refresh: Vec<u8>,

    /// Remove expired values from storage.
    pub should_sweep_storage: bool,
}

impl RoutingMaintenance {
    /// Create new routing maintenance tracker
    pub fn new() -> Self {
        Self::new_at(Instant::now())
    }

    fn new_at(now: Instant) -> Self {
        RoutingMaintenance {
            last_ping: now,
            last_value_maintenance: now,
            last_token_rotation: now,
            last_bootstrap: None,
        }
    }

    /// Determine what maintenance operations should be performed.
    ///
    /// Computes decisions and resets internal timers when intervals elapse.
    pub fn periodic_maintenance_decisions(
        &mut self,
        routing_table: &RoutingTable,
    ) -> MaintenanceDecisions {
        self.periodic_maintenance_decisions_at(Instant::now(), routing_table)
    }

    pub(crate) fn periodic_maintenance_decisions_at(
        &mut self,
        now: Instant,
        routing_table: &RoutingTable,
    ) -> MaintenanceDecisions {
        let mut decisions = MaintenanceDecisions::default();

        if routing_table.is_empty()
            && self
                .last_bootstrap
                .map(|last| now.saturating_duration_since(last) >= BOOTSTRAP_INTERVAL)
                .unwrap_or(true)
        {
            self.last_bootstrap = Some(now);
            decisions.should_bootstrap = true;
        }

        if now.saturating_duration_since(self.last_token_rotation) >= TOKEN_MAINTENANCE_INTERVAL {
            self.last_token_rotation = now;
            decisions.should_rotate_tokens = true;
        }

        if now.saturating_duration_since(self.last_ping) >= PING_INTERVAL {
            self.last_ping = now;

            let (nodes_to_purge, nodes_to_ping) = purge_and_ping_candidates(now, routing_table);
            decisions.nodes_to_purge = nodes_to_purge;
            decisions.nodes_to_ping = nodes_to_ping;
        }

        if now.saturating_duration_since(self.last_value_maintenance) >= VALUE_MAINTENANCE_INTERVAL
        {
            self.last_value_maintenance = now;

            decisions.buckets_to_refresh = routing_table.stale_buckets(now, BUCKET_REFRESH_AGE);
            decisions.should_sweep_storage = true;
        }

        decisions
    }
}

impl Default for RoutingMaintenance {
    fn default() -> Self {
        Self::new()
    }
}

/// Bad nodes are purged, nodes that did not respond within [PING_INTERVAL] are pinged.
fn purge_and_ping_candidates(
    now: Instant,
    routing_table: &RoutingTable,
) -> (Vec<Id>, Vec<(Id, SocketAddrV4)>) {
    let mut to_purge = Vec::with_capacity(routing_table.size());
    let mut to_ping = Vec::with_capacity(routing_table.size());

    for (node, state) in routing_table.entries() {
        if state.status(now) == NodeStatus::Bad {
            to_purge.push(*node.id());
        } else if state
            .last_response()
            .map(|last| now.saturating_duration_since(last) >= PING_INTERVAL)
            .unwrap_or(true)
        {
            to_ping.push((*node.id(), node.address()));
        }
    }

    (to_purge, to_ping)
}
