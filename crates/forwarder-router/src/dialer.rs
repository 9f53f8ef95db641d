//! Dialers: direct TCP, HTTP CONNECT tunnels and per-host dispatch
//!
//! A [`Dialer`] is a small immutable tree. `Tunnel` reaches its upstream proxy
//! through its own `via` dialer, which is how multi-hop chains are expressed:
//! `Tunnel(up1, via: Tunnel(up2, via: Direct))` connects to `up2`, asks it to
//! CONNECT to `up1`, then asks `up1` to CONNECT to the destination.

use std::fmt;
use std::io;

use forwarder_proto::{
    Authority, ConnectRequest, ConnectResponse, Prebuffered, ProtoError,
    HEADER_SECTION_MAX_LENGTH,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};
use url::Url;

use crate::{ConfigError, HostMatcher, RouteToken, Tier};

/// Header the routing hint is sent in unless configured otherwise
pub const DEFAULT_HINT_HEADER: &str = "X-Proxy-Country";

/// A connected byte stream, possibly tunneled through several proxies
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

pub type BoxedStream = Box<dyn ProxyStream>;

/// Dial errors
#[derive(Debug, Error)]
pub enum DialError {
    #[error("Failed to connect to {addr}: {source}")]
    Unreachable {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Upstream proxy {proxy} rejected CONNECT to {target}: {status} {reason}")]
    Rejected {
        proxy: String,
        target: String,
        status: u16,
        reason: String,
    },

    #[error("Upstream proxy {proxy} requires authentication")]
    AuthenticationRequired { proxy: String },

    #[error("Upstream proxy {proxy} sent a malformed response: {reason}")]
    MalformedResponse { proxy: String, reason: String },

    #[error("Upstream proxy {proxy} closed the connection during the handshake")]
    UpstreamClosed { proxy: String },

    #[error("I/O error during handshake with {proxy}: {source}")]
    Handshake {
        proxy: String,
        #[source]
        source: io::Error,
    },
}

impl DialError {
    /// The first hop (or the destination itself) could not be reached
    pub fn is_unreachable(&self) -> bool {
        matches!(self, DialError::Unreachable { .. })
    }

    /// An upstream answered but refused the tunnel
    pub fn is_rejected(&self) -> bool {
        matches!(
            self,
            DialError::Rejected { .. } | DialError::AuthenticationRequired { .. }
        )
    }
}

/// One upstream HTTP proxy
#[derive(Clone, PartialEq, Eq)]
pub struct Upstream {
    pub tier: Tier,
    pub address: Authority,
    pub username: Option<String>,
    pub password: Option<String>,
    pub routing_hint: Option<String>,
    pub hint_header: String,
}

impl Upstream {
    pub fn new(tier: Tier, address: Authority) -> Self {
        Self {
            tier,
            address,
            username: None,
            password: None,
            routing_hint: None,
            hint_header: DEFAULT_HINT_HEADER.to_string(),
        }
    }

    /// Parses an upstream proxy URL such as `http://superproxy.com:8080`.
    ///
    /// The scheme may be omitted. Credentials embedded in the URL are used
    /// unless overridden with [`Upstream::with_credentials`].
    pub fn from_url(tier: Tier, url: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidUpstreamUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let raw = url.trim();
        let parsed = if raw.contains("://") {
            Url::parse(raw)
        } else {
            Url::parse(&format!("http://{}", raw))
        }
        .map_err(|e| invalid(&e.to_string()))?;

        if parsed.scheme() != "http" {
            return Err(invalid("only http:// upstream proxies are supported"));
        }

        let host = parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid("missing host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| invalid("missing port"))?;

        let mut upstream = Self::new(tier, Authority::new(host, port));
        if !parsed.username().is_empty() {
            upstream.username = Some(decode_userinfo(parsed.username()));
            upstream.password = parsed.password().map(decode_userinfo);
        }
        Ok(upstream)
    }

    /// Sets Basic credentials. An empty username leaves them unset.
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        if !username.is_empty() {
            self.username = Some(username.to_string());
            self.password = Some(password.to_string());
        }
        self
    }

    /// Sets the routing hint and the header it is sent in. An empty hint leaves it unset.
    pub fn with_routing_hint(mut self, header: &str, hint: &str) -> Self {
        if !header.is_empty() {
            self.hint_header = header.to_string();
        }
        if !hint.is_empty() {
            self.routing_hint = Some(hint.to_string());
        }
        self
    }

    /// Builds the CONNECT request this upstream is sent for `target`
    pub fn connect_request(&self, target: &Authority) -> ConnectRequest {
        let mut request = ConnectRequest::new(target.clone());
        if let Some(username) = &self.username {
            request = request.with_basic_auth(username, self.password.as_deref().unwrap_or(""));
        }
        if let Some(hint) = &self.routing_hint {
            request = request.with_header(self.hint_header.clone(), hint.clone());
        }
        request
    }

    /// Runs the CONNECT handshake on a stream already connected to this upstream
    pub async fn handshake(
        &self,
        mut stream: BoxedStream,
        target: &Authority,
    ) -> Result<BoxedStream, DialError> {
        let proxy = self.address.to_string();
        let request = self.connect_request(target);

        stream
            .write_all(&request.encode())
            .await
            .map_err(|source| DialError::Handshake {
                proxy: proxy.clone(),
                source,
            })?;
        stream.flush().await.map_err(|source| DialError::Handshake {
            proxy: proxy.clone(),
            source,
        })?;

        let mut reader = Prebuffered::new(stream, HEADER_SECTION_MAX_LENGTH);
        let response = ConnectResponse::read(&mut reader)
            .await
            .map_err(|e| match e {
                ProtoError::Io(source) => DialError::Handshake {
                    proxy: proxy.clone(),
                    source,
                },
                ProtoError::UnexpectedEof => DialError::UpstreamClosed {
                    proxy: proxy.clone(),
                },
                other => DialError::MalformedResponse {
                    proxy: proxy.clone(),
                    reason: other.to_string(),
                },
            })?;

        trace!(
            "Upstream {} answered CONNECT {} with {}",
            proxy,
            target,
            response.status
        );

        if response.status.as_u16() == 407 {
            return Err(DialError::AuthenticationRequired { proxy });
        }
        if !response.is_success() {
            return Err(DialError::Rejected {
                proxy,
                target: target.to_string(),
                status: response.status.as_u16(),
                reason: response.reason().to_string(),
            });
        }

        // Keep whatever the upstream already sent past its header section
        if reader.is_empty() {
            let (_, inner) = reader.into_parts();
            Ok(inner)
        } else {
            Ok(Box::new(reader))
        }
    }
}

/// URL userinfo is percent-encoded; credentials go out decoded
fn decode_userinfo(raw: &str) -> String {
    percent_encoding::percent_decode_str(raw)
        .decode_utf8_lossy()
        .into_owned()
}

impl fmt::Debug for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upstream")
            .field("tier", &self.tier)
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("routing_hint", &self.routing_hint)
            .field("hint_header", &self.hint_header)
            .finish()
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}", self.address)
    }
}

/// Dialer tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dialer {
    /// Plain TCP connection to the destination
    Direct,
    /// CONNECT tunnel through `upstream`, which is itself reached through `via`
    Tunnel {
        upstream: Upstream,
        via: Box<Dialer>,
    },
    /// `matched` for hosts in `matcher`, `fallback` for everything else
    Conditional {
        matcher: HostMatcher,
        matched: Box<Dialer>,
        fallback: Box<Dialer>,
    },
}

impl Dialer {
    pub fn tunnel(upstream: Upstream, via: Dialer) -> Self {
        Dialer::Tunnel {
            upstream,
            via: Box::new(via),
        }
    }

    pub fn conditional(matcher: HostMatcher, matched: Dialer, fallback: Dialer) -> Self {
        Dialer::Conditional {
            matcher,
            matched: Box::new(matched),
            fallback: Box::new(fallback),
        }
    }

    /// Walks the conditional levels for `host` and returns the path that would
    /// be dialed, together with its route token.
    pub fn select(&self, host: &str) -> (RouteToken, &Dialer) {
        match self {
            Dialer::Direct => (RouteToken::Direct, self),
            Dialer::Tunnel { upstream, .. } => (RouteToken::Tier(upstream.tier), self),
            Dialer::Conditional {
                matcher,
                matched,
                fallback,
            } => {
                if matcher.matches(host) {
                    matched.select(host)
                } else {
                    fallback.select(host)
                }
            }
        }
    }

    /// Upstreams of a path in the order they are connected to (first hop first).
    ///
    /// Conditional levels contribute nothing; use [`Dialer::select`] first.
    pub fn hops(&self) -> Vec<&Upstream> {
        match self {
            Dialer::Tunnel { upstream, via } => {
                let mut hops = via.hops();
                hops.push(upstream);
                hops
            }
            _ => Vec::new(),
        }
    }

    /// Connects to `target`
    pub fn dial<'a>(
        &'a self,
        target: &'a Authority,
    ) -> BoxFuture<'a, Result<BoxedStream, DialError>> {
        async move {
            match self {
                Dialer::Direct => dial_direct(target).await,
                Dialer::Tunnel { upstream, via } => {
                    let stream = via.dial(&upstream.address).await?;
                    debug!("Tunneling to {} through {}", target, upstream.address);
                    upstream.handshake(stream, target).await
                }
                Dialer::Conditional {
                    matcher,
                    matched,
                    fallback,
                } => {
                    if matcher.matches(&target.host) {
                        matched.dial(target).await
                    } else {
                        fallback.dial(target).await
                    }
                }
            }
        }
        .boxed()
    }
}

async fn dial_direct(target: &Authority) -> Result<BoxedStream, DialError> {
    let stream = TcpStream::connect((target.host.as_str(), target.port))
        .await
        .map_err(|source| DialError::Unreachable {
            addr: target.to_string(),
            source,
        })?;
    // Best effort, the relay works either way
    let _ = stream.set_nodelay(true);
    trace!("Connected directly to {}", target);
    Ok(Box::new(stream))
}
