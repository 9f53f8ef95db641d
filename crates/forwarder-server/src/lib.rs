//! Multi-port CONNECT proxy server
//!
//! This crate accepts client connections on every port of a [`PortMap`],
//! resolves each destination to an upstream path (sticky entry or route chain)
//! and relays bytes between the client and the dialed stream.

mod port_map;
mod relay;
mod server;

pub use port_map::{split_host_port, PortMap, PortMapError, DEFAULT_TARGET_PORT};
pub use relay::{relay, RelayStats};
pub use server::{
    BoundProxyServer, ConnectionError, ProxyServer, ProxyServerConfig, ProxyServerError,
    DEFAULT_DIAL_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT,
};
