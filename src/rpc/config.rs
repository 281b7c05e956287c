use std::{net::Ipv4Addr, time::Duration};

use ed25519_dalek::SigningKey;

use super::{transport::Transport, DEFAULT_REQUEST_TIMEOUT};

#[derive(Debug)]
/// Dht Configurations
pub struct Config {
    /// Bootstrap nodes, as `host:port` strings.
    ///
    /// Defaults to an empty list, making this node the first of a new network.
    pub bootstrap: Vec<String>,
    /// Explicit port to listen on.
    ///
    /// Defaults to None, picking a random free port.
    pub port: Option<u16>,
    /// Ipv4 address to bind the UDP socket to.
    ///
    /// Defaults to [Ipv4Addr::UNSPECIFIED]
    pub bind_address: Ipv4Addr,
    /// Request timeout duration.
    ///
    /// The longer this duration is, the longer lookups take until they are deemed "done".
    /// The shorter this duration is, the more responses from busy nodes we miss out on.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// The key pair identifying this node, and signing its messages and signed values.
    ///
    /// Defaults to None, generating a random one.
    pub signing_key: Option<SigningKey>,
    /// Transport to use instead of a UDP socket, `port` and `bind_address` are ignored if set.
    ///
    /// Defaults to None.
    pub transport: Option<Box<dyn Transport>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootstrap: Vec::new(),
            port: None,
            bind_address: Ipv4Addr::UNSPECIFIED,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            signing_key: None,
            transport: None,
        }
    }
}
