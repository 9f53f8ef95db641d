//! HTTP CONNECT request and response framing

use base64::Engine;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::{Authority, Prebuffered, ProtoError};

/// Reply sent to a client once its tunnel is ready
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Outbound CONNECT request, as sent to an upstream proxy
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    target: Authority,
    headers: Vec<(String, String)>,
}

impl ConnectRequest {
    pub fn new(target: Authority) -> Self {
        Self {
            target,
            headers: Vec::new(),
        }
    }

    /// Adds a `Proxy-Authorization: Basic ...` header
    pub fn with_basic_auth(self, username: &str, password: &str) -> Self {
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", username, password));
        self.with_header("Proxy-Authorization", format!("Basic {}", encoded))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn target(&self) -> &Authority {
        &self.target
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Serializes the request line and header section
    pub fn encode(&self) -> Vec<u8> {
        let target = self.target.to_string();
        let mut out = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// Status line of an upstream proxy's reply to CONNECT
#[derive(Debug, Clone)]
pub struct ConnectResponse {
    pub status: StatusCode,
    pub reason: Option<String>,
}

impl ConnectResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Returns the reason phrase or the canonical one
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or(self.status.canonical_reason())
            .unwrap_or("")
    }

    /// Parses a response from a buffer and returns `None` when incomplete.
    ///
    /// Returns the length of the header section and the response.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>, ProtoError> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut res = httparse::Response::new(&mut headers);
        match res.parse(buf)? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let code = res.code.unwrap_or_default();
                let status =
                    StatusCode::from_u16(code).map_err(|_| ProtoError::InvalidStatus(code))?;
                let reason = res
                    .reason
                    .filter(|reason| !reason.is_empty())
                    .map(ToOwned::to_owned);
                Ok(Some((header_len, Self { status, reason })))
            }
        }
    }

    /// Reads the status line and header section, removing them from `reader`.
    ///
    /// Anything the peer sent after the header section stays buffered.
    pub async fn read<S: AsyncRead + Unpin>(
        reader: &mut Prebuffered<S>,
    ) -> Result<Self, ProtoError> {
        loop {
            if let Some((len, response)) = Self::parse_with_len(reader.buffer())? {
                reader.discard(len);
                return Ok(response);
            }
            if reader.is_full() {
                return Err(ProtoError::HeaderTooLarge(reader.max_len()));
            }
            if reader.buffer_more().await? == 0 {
                return Err(ProtoError::UnexpectedEof);
            }
        }
    }
}

/// Writes a bodiless HTTP/1.1 error response
pub async fn write_status<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: StatusCode,
) -> std::io::Result<()> {
    let line = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_plain() {
        let request = ConnectRequest::new(Authority::new("api.ipify.org", 443));
        assert_eq!(
            request.encode(),
            b"CONNECT api.ipify.org:443 HTTP/1.1\r\nHost: api.ipify.org:443\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn test_encode_with_auth_and_hint() {
        let request = ConnectRequest::new(Authority::new("example.com", 443))
            .with_basic_auth("alice", "secret")
            .with_header("X-Proxy-Country", "us");

        assert_eq!(
            request.header("proxy-authorization"),
            Some("Basic YWxpY2U6c2VjcmV0")
        );
        let encoded = String::from_utf8(request.encode()).unwrap();
        assert!(encoded.contains("Proxy-Authorization: Basic YWxpY2U6c2VjcmV0\r\n"));
        assert!(encoded.contains("X-Proxy-Country: us\r\n"));
        assert!(encoded.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_response() {
        let (len, response) =
            ConnectResponse::parse_with_len(b"HTTP/1.1 200 Connection established\r\n\r\nextra")
                .unwrap()
                .unwrap();
        assert_eq!(len, 39);
        assert!(response.is_success());
        assert_eq!(response.reason(), "Connection established");

        assert!(ConnectResponse::parse_with_len(b"HTTP/1.1 200 OK\r\n")
            .unwrap()
            .is_none());

        let (_, response) =
            ConnectResponse::parse_with_len(b"HTTP/1.0 407 \r\nProxy-Authenticate: Basic\r\n\r\n")
                .unwrap()
                .unwrap();
        assert_eq!(response.status, StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        assert_eq!(response.reason(), "Proxy Authentication Required");
    }

    #[test]
    fn test_parse_garbage() {
        assert!(ConnectResponse::parse_with_len(b"SSH-2.0-OpenSSH\r\n\r\n").is_err());
    }

    #[tokio::test]
    async fn test_read_keeps_trailing_bytes() {
        use tokio::io::AsyncReadExt;

        let data: &[u8] = b"HTTP/1.1 200 OK\r\nVia: upstream\r\n\r\nhello";
        let mut reader = Prebuffered::new(data, 1024);
        let response = ConnectResponse::read(&mut reader).await.unwrap();
        assert!(response.is_success());

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"hello");
    }

    #[tokio::test]
    async fn test_read_eof_and_oversized() {
        let data: &[u8] = b"HTTP/1.1 200";
        let mut reader = Prebuffered::new(data, 1024);
        assert!(matches!(
            ConnectResponse::read(&mut reader).await,
            Err(ProtoError::UnexpectedEof)
        ));

        let data: &[u8] = b"HTTP/1.1 200 OK\r\nX-Padding: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n\r\n";
        let mut reader = Prebuffered::new(data, 16);
        assert!(matches!(
            ConnectResponse::read(&mut reader).await,
            Err(ProtoError::HeaderTooLarge(16))
        ));
    }
}
