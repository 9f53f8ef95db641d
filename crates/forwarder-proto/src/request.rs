//! Inbound handshake: CONNECT requests and transparently redirected traffic

use tokio::io::AsyncRead;
use tracing::trace;

use crate::sni::{tls_record_len, TLS_HANDSHAKE_RECORD};
use crate::{extract_sni, Authority, Prebuffered, ProtoError};

/// How the destination of a transparently redirected connection was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffedProtocol {
    /// SNI of a TLS ClientHello
    Tls,
    /// `Host` header of a plain HTTP request
    Http,
}

/// The first thing a client sends on an accepted connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundRequest {
    /// `CONNECT host:port`. The header section has been consumed; anything the
    /// client pipelined after it is still buffered.
    Connect { target: Authority },
    /// No CONNECT preamble. The destination port comes from the listener and
    /// every byte read so far is still buffered, to be forwarded upstream.
    Transparent {
        target: Authority,
        protocol: SniffedProtocol,
    },
}

impl InboundRequest {
    pub fn target(&self) -> &Authority {
        match self {
            InboundRequest::Connect { target } => target,
            InboundRequest::Transparent { target, .. } => target,
        }
    }

    pub fn is_connect(&self) -> bool {
        matches!(self, InboundRequest::Connect { .. })
    }

    /// Reads until the request is complete.
    ///
    /// `default_port` is the logical target port of the listener the connection
    /// arrived on and only applies to transparent traffic.
    pub async fn read<S: AsyncRead + Unpin>(
        reader: &mut Prebuffered<S>,
        default_port: u16,
    ) -> Result<Self, ProtoError> {
        loop {
            if let Some(request) = Self::parse(reader, default_port)? {
                return Ok(request);
            }
            if reader.is_full() {
                return Err(ProtoError::HeaderTooLarge(reader.max_len()));
            }
            if reader.buffer_more().await? == 0 {
                return Err(ProtoError::UnexpectedEof);
            }
        }
    }

    fn parse<S>(
        reader: &mut Prebuffered<S>,
        default_port: u16,
    ) -> Result<Option<Self>, ProtoError> {
        let buf = reader.buffer();
        let Some(&first) = buf.first() else {
            return Ok(None);
        };

        if first == TLS_HANDSHAKE_RECORD {
            let Some(record_len) = tls_record_len(buf) else {
                return Ok(None);
            };
            if record_len > reader.max_len() {
                return Err(ProtoError::TlsRecordTooLarge(reader.max_len()));
            }
            if buf.len() < record_len {
                return Ok(None);
            }
            let host = extract_sni(&buf[..record_len])?;
            trace!("Sniffed TLS destination {}", host);
            return Ok(Some(InboundRequest::Transparent {
                target: Authority::new(host, default_port),
                protocol: SniffedProtocol::Tls,
            }));
        }

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        let header_len = match req.parse(buf)? {
            httparse::Status::Partial => return Ok(None),
            httparse::Status::Complete(len) => len,
        };

        let method = req.method.unwrap_or_default();
        let path = req.path.unwrap_or_default();

        if method.eq_ignore_ascii_case("CONNECT") {
            let target = Authority::parse(path)?;
            reader.discard(header_len);
            return Ok(Some(InboundRequest::Connect { target }));
        }

        // Absolute-form targets are forward-proxy requests, which we don't serve
        if !path.starts_with('/') {
            return Err(ProtoError::UnsupportedMethod(method.to_string()));
        }

        let host = req
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("host"))
            .and_then(|h| std::str::from_utf8(h.value).ok())
            .ok_or(ProtoError::MissingHost)?;
        let target = Authority::parse_with_default_port(host, default_port)?;

        trace!("Sniffed HTTP destination {}", target);
        Ok(Some(InboundRequest::Transparent {
            target,
            protocol: SniffedProtocol::Http,
        }))
    }
}
