//! Listen port to logical target port mapping

use std::collections::BTreeMap;

use thiserror::Error;

/// Target port of the primary bind address
pub const DEFAULT_TARGET_PORT: &str = "443";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortMapError {
    #[error("Failed to parse port mapping: {0} (expected listen:target)")]
    InvalidPair(String),

    #[error("Invalid port {port:?} in {entry}")]
    InvalidPort { entry: String, port: String },

    #[error("Invalid bind address {0:?} (expected host:port)")]
    InvalidBindAddress(String),
}

/// Listen port -> logical target port. One listener is started per key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortMap {
    ports: BTreeMap<String, String>,
}

impl PortMap {
    /// Builds the mapping from the primary bind address (its port maps to 443)
    /// and `listen:target` entries. Entries may be comma separated and win over
    /// the primary mapping for the same listen port.
    pub fn parse<S: AsRef<str>>(entries: &[S], bind_addr: &str) -> Result<Self, PortMapError> {
        let (_, bind_port) = split_host_port(bind_addr)?;

        let mut ports = BTreeMap::new();
        ports.insert(bind_port.to_string(), DEFAULT_TARGET_PORT.to_string());

        for entry in entries
            .iter()
            .flat_map(|e| e.as_ref().split(','))
            .map(str::trim)
            .filter(|e| !e.is_empty())
        {
            let parts: Vec<&str> = entry.split(':').collect();
            let &[listen, target] = parts.as_slice() else {
                return Err(PortMapError::InvalidPair(entry.to_string()));
            };
            for port in [listen, target] {
                if port.parse::<u16>().is_err() {
                    return Err(PortMapError::InvalidPort {
                        entry: entry.to_string(),
                        port: port.to_string(),
                    });
                }
            }
            ports.insert(listen.to_string(), target.to_string());
        }

        Ok(Self { ports })
    }

    pub fn get(&self, listen_port: &str) -> Option<&str> {
        self.ports.get(listen_port).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.ports.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `(listen, target)` pairs as numbers. Keys are validated on parse.
    pub fn listeners(&self) -> Vec<(u16, u16)> {
        self.ports
            .iter()
            .filter_map(|(listen, target)| Some((listen.parse().ok()?, target.parse().ok()?)))
            .collect()
    }
}

/// Splits `host:port`. The host may be empty (`:8443`) or a bracketed IPv6 address.
pub fn split_host_port(addr: &str) -> Result<(&str, u16), PortMapError> {
    let invalid = || PortMapError::InvalidBindAddress(addr.to_string());

    let (host, port) = addr.trim().rsplit_once(':').ok_or_else(invalid)?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.contains(':') && !addr.contains('[') {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host, port))
}
