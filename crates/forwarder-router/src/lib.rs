//! Routing logic for the forwarder
//!
//! Decides, per destination host, which upstream path a connection takes: direct,
//! or a chain of up to three HTTP CONNECT proxies. The decision tree is built once
//! from [`RoutingConfig`] and shared read-only by every connection.

pub mod chain;
pub mod dialer;
pub mod zone;

pub use chain::{RouteChain, RoutingConfig, TierConfig};
pub use dialer::{BoxedStream, DialError, Dialer, ProxyStream, Upstream, DEFAULT_HINT_HEADER};
pub use zone::{HostMatcher, ZoneError};

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Upstream tier, numbered by priority. Tier 1 is evaluated first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    One,
    Two,
    Three,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::One, Tier::Two, Tier::Three];

    pub fn number(self) -> u8 {
        match self {
            Tier::One => 1,
            Tier::Two => 2,
            Tier::Three => 3,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier{}", self.number())
    }
}

/// Names the path the decision tree selected for a connection.
///
/// This is what the sticky store persists; [`RouteChain::path`] turns it back
/// into the full dialer chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteToken {
    Direct,
    Tier(Tier),
}

impl fmt::Display for RouteToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteToken::Direct => write!(f, "direct"),
            RouteToken::Tier(tier) => tier.fmt(f),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown route token: {0}")]
pub struct UnknownRouteToken(pub String);

impl FromStr for RouteToken {
    type Err = UnknownRouteToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(RouteToken::Direct),
            "tier1" => Ok(RouteToken::Tier(Tier::One)),
            "tier2" => Ok(RouteToken::Tier(Tier::Two)),
            "tier3" => Ok(RouteToken::Tier(Tier::Three)),
            other => Err(UnknownRouteToken(other.to_string())),
        }
    }
}

/// Configuration errors, fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid upstream URL {url}: {reason}")]
    InvalidUpstreamUrl { url: String, reason: String },

    #[error("Invalid filter for {tier}: {source}")]
    InvalidFilter {
        tier: String,
        #[source]
        source: ZoneError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_token_round_trip() {
        for token in [
            RouteToken::Direct,
            RouteToken::Tier(Tier::One),
            RouteToken::Tier(Tier::Two),
            RouteToken::Tier(Tier::Three),
        ] {
            assert_eq!(token.to_string().parse::<RouteToken>(), Ok(token));
        }
        assert!("tier4".parse::<RouteToken>().is_err());
    }
}
