//! Host and DNS zone matching
//!
//! A [`HostMatcher`] holds exact hostnames and zones. A zone of `example.com`
//! matches `example.com` itself and every subdomain of it, on a label boundary:
//!
//! - `example.com` - matches `example.com`, `api.example.com`, `a.b.example.com`
//! - it does NOT match `notexample.com`
//!
//! Matching is ASCII case-insensitive and ignores a trailing dot.

use std::collections::HashSet;
use thiserror::Error;

/// Errors that can occur when adding hosts or zones
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ZoneError {
    #[error("Empty host or zone")]
    Empty,

    #[error("Domain parts cannot be empty: {0}")]
    EmptyLabel(String),

    #[error("Wildcards are only allowed as a leading *. on zones: {0}")]
    MisplacedWildcard(String),
}

/// Set of exact hostnames plus zones
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostMatcher {
    hosts: HashSet<String>,
    zones: HashSet<String>,
}

impl HostMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a matcher from host and zone lists, skipping blank entries
    pub fn from_lists<H, Z>(hosts: H, zones: Z) -> Result<Self, ZoneError>
    where
        H: IntoIterator,
        H::Item: AsRef<str>,
        Z: IntoIterator,
        Z::Item: AsRef<str>,
    {
        let mut matcher = Self::new();
        for host in hosts {
            let host = host.as_ref();
            if !host.trim().is_empty() {
                matcher.add_host(host)?;
            }
        }
        for zone in zones {
            let zone = zone.as_ref();
            if !zone.trim().is_empty() {
                matcher.add_zone(zone)?;
            }
        }
        Ok(matcher)
    }

    /// Adds an exact hostname
    pub fn add_host(&mut self, host: &str) -> Result<(), ZoneError> {
        let host = normalize(host)?;
        self.hosts.insert(host);
        Ok(())
    }

    /// Adds a zone. `*.example.com` and `.example.com` are accepted as
    /// spellings of `example.com`.
    pub fn add_zone(&mut self, zone: &str) -> Result<(), ZoneError> {
        let trimmed = zone.trim();
        let trimmed = trimmed
            .strip_prefix("*.")
            .or_else(|| trimmed.strip_prefix('.'))
            .unwrap_or(trimmed);
        let zone = normalize(trimmed)?;
        self.zones.insert(zone);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty() && self.zones.is_empty()
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.hosts.iter().map(String::as_str)
    }

    pub fn zones(&self) -> impl Iterator<Item = &str> {
        self.zones.iter().map(String::as_str)
    }

    /// Check if a hostname is an exact entry or falls inside one of the zones
    pub fn matches(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        if host.is_empty() {
            return false;
        }

        if self.hosts.contains(&host) || self.zones.contains(&host) {
            return true;
        }

        if self.zones.is_empty() {
            return false;
        }

        // Walk parent domains at label boundaries: a.b.example.com -> b.example.com -> example.com
        host.match_indices('.')
            .any(|(i, _)| self.zones.contains(&host[i + 1..]))
    }
}

fn normalize(entry: &str) -> Result<String, ZoneError> {
    let entry = entry.trim().trim_end_matches('.');
    if entry.is_empty() {
        return Err(ZoneError::Empty);
    }
    if entry.contains('*') {
        return Err(ZoneError::MisplacedWildcard(entry.to_string()));
    }
    if entry.split('.').any(str::is_empty) {
        return Err(ZoneError::EmptyLabel(entry.to_string()));
    }
    Ok(entry.to_ascii_lowercase())
}
