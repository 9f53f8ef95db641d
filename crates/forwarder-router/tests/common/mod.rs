//! In-process upstream proxies and destinations for dial tests

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
    /// Answers with the given raw bytes and closes
    Raw(&'static [u8]),
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
        Behavior::Raw(bytes) => {
            stream.write_all(bytes).await?;
            return Ok(());
        }
        Behavior::Accept => {}
    }

    let mut target = TcpStream::connect(request.target.as_str()).await?;
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
