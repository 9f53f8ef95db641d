use thiserror::Error;

/// Errors raised while reading or parsing handshake framing
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Header section exceeds {0} bytes")]
    HeaderTooLarge(usize),

    #[error("TLS record exceeds {0} bytes")]
    TlsRecordTooLarge(usize),

    #[error("Connection closed before the header section was complete")]
    UnexpectedEof,

    #[error("Invalid HTTP message: {0}")]
    InvalidHttp(#[from] httparse::Error),

    #[error("Invalid authority: {0}")]
    InvalidAuthority(String),

    #[error("Unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("Request carries no destination host")]
    MissingHost,

    #[error("Invalid status code: {0}")]
    InvalidStatus(u16),

    #[error("SNI extraction failed")]
    SniExtractionFailed,

    #[error("Invalid SNI hostname: {0}")]
    InvalidSni(String),
}

impl ProtoError {
    /// Whether the peer sent something we understood as HTTP, so an HTTP error
    /// status can be written back before closing.
    pub fn is_http_framed(&self) -> bool {
        matches!(
            self,
            ProtoError::HeaderTooLarge(_)
                | ProtoError::InvalidHttp(_)
                | ProtoError::InvalidAuthority(_)
                | ProtoError::UnsupportedMethod(_)
                | ProtoError::MissingHost
        )
    }
}
