//! Wire framing for the forwarder
//!
//! Handles the HTTP CONNECT handshake in both directions (inbound requests from
//! clients, outbound requests to upstream proxies) and sniffs the destination of
//! transparently redirected traffic from a TLS ClientHello or an HTTP `Host` header.

pub mod authority;
pub mod connect;
pub mod error;
pub mod prebuffered;
pub mod request;
pub mod sni;

pub use authority::Authority;
pub use connect::{write_status, ConnectRequest, ConnectResponse, CONNECTION_ESTABLISHED};
pub use error::ProtoError;
pub use prebuffered::Prebuffered;
pub use request::{InboundRequest, SniffedProtocol};
pub use sni::extract_sni;

/// How much data to read for a header section before it's considered invalid.
/// 8KB should be plenty.
pub const HEADER_SECTION_MAX_LENGTH: usize = 8192;
