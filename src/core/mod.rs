//! Core Dht logic, pure computation with no direct I/O.
//!
//! Contains the query state machines (`iterative_query`, `store_query`), the
//! `server` request handler with its storage and tokens, and the
//! `routing_maintenance` timers. All I/O orchestration lives in `rpc`, which
//! calls into this module.

pub(crate) mod iterative_query;
pub(crate) mod routing_maintenance;
pub(crate) mod server;
pub(crate) mod store_query;
