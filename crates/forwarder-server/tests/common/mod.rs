//! In-process upstream proxies, destinations and a proxy server under test

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// A CONNECT request as seen by a fake upstream proxy
#[derive(Debug, Clone)]
pub struct SeenConnect {
    pub target: String,
    pub headers: Vec<(String, String)>,
}

impl SeenConnect {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// How a fake proxy answers CONNECT
#[derive(Debug, Clone)]
pub enum Behavior {
    Accept,
    Reject(u16),
    /// Accepts but connects to this address instead of the requested target
    Redirect(SocketAddr),
    /// Reads the request and never answers
    Stall,
}

pub struct FakeProxy {
    pub addr: SocketAddr,
    pub seen: Arc<Mutex<Vec<SeenConnect>>>,
}

impl FakeProxy {
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let seen = seen_clone.clone();
                let behavior = behavior.clone();
                tokio::spawn(async move {
                    let _ = handle_proxy_connection(stream, behavior, seen).await;
                });
            }
        });

        Self { addr, seen }
    }

    pub fn seen(&self) -> Vec<SeenConnect> {
        self.seen.lock().unwrap().clone()
    }
}

async fn handle_proxy_connection(
    mut stream: TcpStream,
    behavior: Behavior,
    seen: Arc<Mutex<Vec<SeenConnect>>>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let (header_len, request) = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut req = httparse::Request::new(&mut headers);
        if let Ok(httparse::Status::Complete(len)) = req.parse(&buf) {
            let request = SeenConnect {
                target: req.path.unwrap_or_default().to_string(),
                headers: req
                    .headers
                    .iter()
                    .map(|h| {
                        (
                            h.name.to_string(),
                            String::from_utf8_lossy(h.value).to_string(),
                        )
                    })
                    .collect(),
            };
            break (len, request);
        }
    };
    seen.lock().unwrap().push(request.clone());

    match behavior {
        Behavior::Reject(status) => {
            stream
                .write_all(format!("HTTP/1.1 {} Nope\r\n\r\n", status).as_bytes())
                .await?;
            return Ok(());
        }
        Behavior::Stall => {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            return Ok(());
        }
        Behavior::Accept | Behavior::Redirect(_) => {}
    }

    let mut target = match behavior {
        Behavior::Redirect(addr) => TcpStream::connect(addr).await?,
        _ => TcpStream::connect(request.target.as_str()).await?,
    };
    stream
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await?;
    // Bytes pipelined after the CONNECT header section
    if buf.len() > header_len {
        target.write_all(&buf[header_len..]).await?;
    }
    tokio::io::copy_bidirectional(&mut stream, &mut target).await?;
    Ok(())
}

/// Destination that greets with a banner and then echoes
pub async fn start_echo_server(banner: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                if stream.write_all(banner).await.is_err() {
                    return;
                }
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Port on loopback with nothing listening
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

pub struct TestProxy {
    pub addr: SocketAddr,
    pub sticky: forwarder_sticky::StickyMapper,
    pub tracer: Arc<forwarder_tracer::DomainTracer>,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct TestProxyBuilder {
    routing: forwarder_router::RoutingConfig,
    port_entries: Vec<String>,
    sticky: forwarder_sticky::StickyMapper,
    handshake_timeout: std::time::Duration,
    dial_timeout: std::time::Duration,
}

impl TestProxyBuilder {
    pub fn new(routing: forwarder_router::RoutingConfig) -> Self {
        Self {
            routing,
            port_entries: Vec::new(),
            sticky: forwarder_sticky::StickyMapper::in_memory(),
            handshake_timeout: forwarder_server::DEFAULT_HANDSHAKE_TIMEOUT,
            dial_timeout: forwarder_server::DEFAULT_DIAL_TIMEOUT,
        }
    }

    pub fn port_map(mut self, entry: impl Into<String>) -> Self {
        self.port_entries.push(entry.into());
        self
    }

    pub fn sticky(mut self, sticky: forwarder_sticky::StickyMapper) -> Self {
        self.sticky = sticky;
        self
    }

    pub fn handshake_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn dial_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub async fn start(self) -> TestProxy {
        let port_map =
            forwarder_server::PortMap::parse(&self.port_entries, "127.0.0.1:0").unwrap();
        let config = forwarder_server::ProxyServerConfig::new("127.0.0.1", port_map)
            .with_handshake_timeout(self.handshake_timeout)
            .with_dial_timeout(self.dial_timeout);
        let tracer = Arc::new(forwarder_tracer::DomainTracer::new());
        let chain = Arc::new(forwarder_router::RouteChain::build(self.routing));

        let server = forwarder_server::ProxyServer::new(
            config,
            chain,
            self.sticky.clone(),
            tracer.clone(),
        )
        .bind()
        .await
        .unwrap();
        let addr = server.local_addrs()[0];

        let handle = tokio::spawn(async move {
            let _ = server.serve().await;
        });

        TestProxy {
            addr,
            sticky: self.sticky,
            tracer,
            handle,
        }
    }
}

/// Opens a CONNECT tunnel through the proxy and returns the stream after the 200 reply
pub async fn connect_through(proxy: SocketAddr, target: &str) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", target).as_bytes())
        .await
        .unwrap();

    let mut reply = vec![0u8; forwarder_proto::CONNECTION_ESTABLISHED.len()];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, forwarder_proto::CONNECTION_ESTABLISHED);
    stream
}

/// Sends raw bytes and returns everything the proxy answers before closing
pub async fn exchange(proxy: SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response).await;
    String::from_utf8_lossy(&response).to_string()
}
