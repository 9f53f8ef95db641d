//! Bidirectional byte relay between a client and its upstream stream

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Copies bytes both ways until one direction ends, then tears down the other.
///
/// Each direction runs in its own task so a stalled writer on one side never
/// holds up the other. When either task finishes (EOF or error) the other is
/// aborted and both streams are dropped before this returns.
pub async fn relay<C, U>(client: C, upstream: U) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let sent = Arc::new(AtomicU64::new(0));
    let received = Arc::new(AtomicU64::new(0));

    let mut client_to_upstream = tokio::spawn(pump(
        client_read,
        upstream_write,
        sent.clone(),
        "client -> upstream",
    ));
    let mut upstream_to_client = tokio::spawn(pump(
        upstream_read,
        client_write,
        received.clone(),
        "upstream -> client",
    ));

    tokio::select! {
        _ = &mut client_to_upstream => {
            upstream_to_client.abort();
            let _ = upstream_to_client.await;
        }
        _ = &mut upstream_to_client => {
            client_to_upstream.abort();
            let _ = client_to_upstream.await;
        }
    }

    let stats = RelayStats {
        client_to_upstream: sent.load(Ordering::Relaxed),
        upstream_to_client: received.load(Ordering::Relaxed),
    };
    debug!(
        "Relay finished: {} bytes client -> upstream, {} bytes upstream -> client",
        stats.client_to_upstream, stats.upstream_to_client
    );
    stats
}

async fn pump<R, W>(mut reader: R, mut writer: W, counter: Arc<AtomicU64>, direction: &'static str)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => {
                debug!("{}: end of stream", direction);
                let _ = writer.shutdown().await;
                break;
            }
            Ok(n) => {
                if let Err(e) = writer.write_all(&buffer[..n]).await {
                    debug!("{}: write failed: {}", direction, e);
                    break;
                }
                if let Err(e) = writer.flush().await {
                    debug!("{}: flush failed: {}", direction, e);
                    break;
                }
                counter.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => {
                debug!("{}: read failed: {}", direction, e);
                break;
            }
        }
    }
}
