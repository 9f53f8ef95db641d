//! `host:port` destinations

use std::fmt;
use std::str::FromStr;

use crate::ProtoError;

/// Host and port of a destination, as carried in a CONNECT request target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Authority {
    /// Hostname or IP literal, without brackets for IPv6.
    pub host: String,
    pub port: u16,
}

impl Authority {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses an authority-form target that must include a port.
    pub fn parse(s: &str) -> Result<Self, ProtoError> {
        Self::parse_inner(s, None)
    }

    /// Parses `host[:port]`, falling back to `default_port` when no port is present.
    ///
    /// Used for `Host` headers, which may omit the port.
    pub fn parse_with_default_port(s: &str, default_port: u16) -> Result<Self, ProtoError> {
        Self::parse_inner(s, Some(default_port))
    }

    fn parse_inner(s: &str, default_port: Option<u16>) -> Result<Self, ProtoError> {
        let invalid = || ProtoError::InvalidAuthority(s.to_string());

        let authority = http::uri::Authority::from_str(s.trim()).map_err(|_| invalid())?;
        if authority.as_str().contains('@') {
            return Err(invalid());
        }

        let host = authority.host().trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }

        let port = match (authority.port_u16(), default_port) {
            (Some(port), _) => port,
            (None, Some(port)) => port,
            (None, None) => return Err(invalid()),
        };

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Authority {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
