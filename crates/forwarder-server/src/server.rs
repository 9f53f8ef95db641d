//! CONNECT proxy server
//!
//! Binds one listener per port of the [`PortMap`], then serves them all. Each
//! accepted connection goes through:
//!
//! 1. handshake: CONNECT request, or a sniffed TLS/HTTP destination
//! 2. route resolution: sticky entry for the client, else the route chain
//! 3. dial through the resolved path
//! 4. relay until either side closes

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use forwarder_proto::{
    write_status, InboundRequest, Prebuffered, ProtoError, SniffedProtocol,
    CONNECTION_ESTABLISHED, HEADER_SECTION_MAX_LENGTH,
};
use forwarder_router::{DialError, Dialer, RouteChain, RouteToken};
use forwarder_sticky::StickyMapper;
use forwarder_tracer::DomainTracker;
use http::StatusCode;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::port_map::PortMap;
use crate::relay::{relay, RelayStats};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

const BIND_ATTEMPTS: u32 = 3;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ProxyServerError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// Why a single connection ended early
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Handshake failed: {0}")]
    Handshake(#[from] ProtoError),

    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Dial to {target} via {route} failed: {source}")]
    Dial {
        target: String,
        route: RouteToken,
        #[source]
        source: DialError,
    },

    #[error("Dial to {target} via {route} timed out after {timeout:?}")]
    DialTimeout {
        target: String,
        route: RouteToken,
        timeout: Duration,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Host every listener binds to. Empty means all interfaces.
    pub bind_host: String,
    pub port_map: PortMap,
    pub handshake_timeout: Duration,
    pub dial_timeout: Duration,
}

impl ProxyServerConfig {
    pub fn new(bind_host: impl Into<String>, port_map: PortMap) -> Self {
        Self {
            bind_host: bind_host.into(),
            port_map,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    fn bind_host(&self) -> &str {
        if self.bind_host.is_empty() {
            "0.0.0.0"
        } else {
            &self.bind_host
        }
    }
}

/// Where a connection's route came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteSource {
    /// Destination is excluded; sticky state is neither read nor written
    Excluded,
    /// The client's sticky entry
    Sticky,
    /// The route chain's decision, pinned once the dial succeeds
    Chain,
}

/// State shared by every connection handler
struct ConnectionContext {
    chain: Arc<RouteChain>,
    sticky: StickyMapper,
    tracker: Arc<dyn DomainTracker>,
    handshake_timeout: Duration,
    dial_timeout: Duration,
}

impl ConnectionContext {
    /// Excluded hosts go direct. Otherwise the client's sticky entry if it
    /// names a configured path, else the route chain's decision for `host`.
    async fn resolve(&self, client_key: &str, host: &str) -> (RouteToken, &Dialer, RouteSource) {
        if self.chain.is_excluded(host) {
            // The exclusion level sits at the root, so this selects Direct
            let (token, path) = self.chain.resolve(host);
            return (token, path, RouteSource::Excluded);
        }

        match self.sticky.lookup(client_key).await {
            Ok(Some(token)) => match self.chain.path(token) {
                Some(path) => return (token, path, RouteSource::Sticky),
                None => debug!(
                    "Sticky route {} for {} is not configured, resolving again",
                    token, client_key
                ),
            },
            Ok(None) => {}
            Err(e) => warn!("Sticky lookup for {} failed: {}", client_key, e),
        }

        let (token, path) = self.chain.resolve(host);
        (token, path, RouteSource::Chain)
    }
}

pub struct ProxyServer {
    config: ProxyServerConfig,
    context: Arc<ConnectionContext>,
}

impl ProxyServer {
    pub fn new(
        config: ProxyServerConfig,
        chain: Arc<RouteChain>,
        sticky: StickyMapper,
        tracker: Arc<dyn DomainTracker>,
    ) -> Self {
        let context = Arc::new(ConnectionContext {
            chain,
            sticky,
            tracker,
            handshake_timeout: config.handshake_timeout,
            dial_timeout: config.dial_timeout,
        });
        Self { config, context }
    }

    /// Binds every listen port of the port map. Nothing is served until all
    /// of them are bound; the first failure is returned.
    pub async fn bind(self) -> Result<BoundProxyServer, ProxyServerError> {
        let host = self.config.bind_host();
        let mut listeners = Vec::new();

        for (listen_port, target_port) in self.config.port_map.listeners() {
            let listener = bind_with_retry(host, listen_port).await?;
            listeners.push(Listener {
                listener,
                target_port,
            });
        }

        Ok(BoundProxyServer {
            listeners,
            context: self.context,
        })
    }

    /// Binds and serves until the future is dropped
    pub async fn start(self) -> Result<(), ProxyServerError> {
        self.bind().await?.serve().await
    }
}

async fn bind_with_retry(host: &str, port: u16) -> Result<TcpListener, ProxyServerError> {
    // Retry to ride out TIME_WAIT after a quick restart
    for attempt in 1..=BIND_ATTEMPTS {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => {
                if attempt > 1 {
                    info!(
                        "Successfully bound to {}:{} on attempt {}/{}",
                        host, port, attempt, BIND_ATTEMPTS
                    );
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                warn!(
                    "Port {} is in use (attempt {}/{}), retrying in {:?}...",
                    port, attempt, BIND_ATTEMPTS, BIND_RETRY_DELAY
                );
                tokio::time::sleep(BIND_RETRY_DELAY).await;
            }
            Err(e) => {
                return Err(ProxyServerError::BindError {
                    address: host.to_string(),
                    port,
                    reason: e.to_string(),
                });
            }
        }
    }

    Err(ProxyServerError::BindError {
        address: host.to_string(),
        port,
        reason: format!("Address in use after {} attempts", BIND_ATTEMPTS),
    })
}

struct Listener {
    listener: TcpListener,
    target_port: u16,
}

/// A server whose listeners are all bound
pub struct BoundProxyServer {
    listeners: Vec<Listener>,
    context: Arc<ConnectionContext>,
}

impl BoundProxyServer {
    /// Actual addresses, in port map order
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.listener.local_addr().ok())
            .collect()
    }

    /// Runs every accept loop concurrently. Dropping the future closes all
    /// listeners; connections already accepted run to completion.
    pub async fn serve(self) -> Result<(), ProxyServerError> {
        let loops = self
            .listeners
            .into_iter()
            .map(|listener| accept_loop(listener, self.context.clone()));
        futures::future::join_all(loops).await;
        Ok(())
    }
}

async fn accept_loop(listener: Listener, context: Arc<ConnectionContext>) {
    let Listener {
        listener,
        target_port,
    } = listener;
    match listener.local_addr() {
        Ok(addr) => info!(
            "Serving CONNECT proxy on {} (target port {})",
            addr, target_port
        ),
        Err(e) => warn!("Serving CONNECT proxy on unknown address: {}", e),
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let context = context.clone();
                let connection_id = uuid::Uuid::new_v4();
                let span = info_span!("connection", id = %connection_id, peer = %peer_addr);

                tokio::spawn(
                    async move {
                        match handle_connection(stream, peer_addr, target_port, &context).await {
                            Ok(stats) => debug!(
                                "Connection closed ({} bytes up, {} bytes down)",
                                stats.client_to_upstream, stats.upstream_to_client
                            ),
                            Err(e @ (ConnectionError::Dial { .. } | ConnectionError::DialTimeout { .. })) => {
                                warn!("{}", e)
                            }
                            Err(e) => debug!("Connection from {} failed: {}", peer_addr, e),
                        }
                    }
                    .instrument(span),
                );
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    target_port: u16,
    context: &ConnectionContext,
) -> Result<RelayStats, ConnectionError> {
    let _ = stream.set_nodelay(true);
    let mut client = Prebuffered::new(stream, HEADER_SECTION_MAX_LENGTH);

    let request = match timeout(
        context.handshake_timeout,
        InboundRequest::read(&mut client, target_port),
    )
    .await
    {
        Ok(Ok(request)) => request,
        Ok(Err(e)) => {
            if e.is_http_framed() {
                reply(&mut client, handshake_status(&e)).await;
            }
            return Err(e.into());
        }
        Err(_) => {
            if looks_like_http(client.buffer()) {
                reply(&mut client, StatusCode::BAD_REQUEST).await;
            }
            return Err(ConnectionError::HandshakeTimeout(context.handshake_timeout));
        }
    };

    let target = request.target().clone();
    let speaks_http = !matches!(
        request,
        InboundRequest::Transparent {
            protocol: SniffedProtocol::Tls,
            ..
        }
    );

    let client_key = StickyMapper::client_key(&peer_addr);
    let (route, path, source) = context.resolve(&client_key, &target.host).await;
    debug!(
        "Resolved {} for {} via {} ({:?})",
        target, client_key, route, source
    );

    let upstream = match timeout(context.dial_timeout, path.dial(&target)).await {
        Ok(Ok(upstream)) => upstream,
        Ok(Err(source)) => {
            if speaks_http {
                reply(&mut client, StatusCode::BAD_GATEWAY).await;
            }
            return Err(ConnectionError::Dial {
                target: target.to_string(),
                route,
                source,
            });
        }
        Err(_) => {
            if speaks_http {
                reply(&mut client, StatusCode::GATEWAY_TIMEOUT).await;
            }
            return Err(ConnectionError::DialTimeout {
                target: target.to_string(),
                route,
                timeout: context.dial_timeout,
            });
        }
    };

    // Committed only once the path is known to work
    if source == RouteSource::Chain {
        if let Err(e) = context.sticky.store(&client_key, route).await {
            warn!("Failed to store sticky route for {}: {}", client_key, e);
        }
    }
    context.tracker.inc(&target.host);

    if request.is_connect() {
        client.write_all(CONNECTION_ESTABLISHED).await?;
        client.flush().await?;
    }

    info!("{} -> {} via {}", peer_addr, target, route);
    Ok(relay(client, upstream).await)
}

fn handshake_status(error: &ProtoError) -> StatusCode {
    match error {
        ProtoError::UnsupportedMethod(_) => StatusCode::METHOD_NOT_ALLOWED,
        _ => StatusCode::BAD_REQUEST,
    }
}

/// An HTTP request line starts with an uppercase method token
fn looks_like_http(buf: &[u8]) -> bool {
    buf.first().is_some_and(u8::is_ascii_uppercase)
}

async fn reply<W: AsyncWrite + Unpin>(writer: &mut W, status: StatusCode) {
    if let Err(e) = write_status(writer, status).await {
        debug!("Failed to write {} response: {}", status, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_server_config() {
        let port_map = PortMap::parse(&["18443:8443"], ":8443").unwrap();
        let config = ProxyServerConfig::new("", port_map)
            .with_dial_timeout(Duration::from_secs(5));

        assert_eq!(config.bind_host(), "0.0.0.0");
        assert_eq!(config.handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT);
        assert_eq!(config.dial_timeout, Duration::from_secs(5));
        assert_eq!(config.port_map.len(), 2);
    }

    #[test]
    fn test_handshake_status() {
        assert_eq!(
            handshake_status(&ProtoError::UnsupportedMethod("GET".into())),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            handshake_status(&ProtoError::MissingHost),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_looks_like_http() {
        assert!(looks_like_http(b"CONNECT exa"));
        assert!(!looks_like_http(b"\x16\x03\x01"));
        assert!(!looks_like_http(b""));
    }
}
