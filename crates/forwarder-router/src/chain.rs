//! Route chain construction
//!
//! Up to three tiers, each an upstream proxy with an optional host/zone filter,
//! plus an exclusion filter. The tree is built innermost first:
//!
//! 1. tier 3: `filter3 ? Tunnel(up3) : Direct`
//! 2. tier 2: `filter2 ? Tunnel(up2 via up3) : <tier 3>`
//! 3. tier 1: `filter1 ? Tunnel(up1 via up2 via up3) : <tier 2>`
//! 4. exclusions: `excluded ? Direct : <tier 1>`
//!
//! So the outermost level wins: exclusions beat every tier, and a host matching
//! several tier filters goes through the lowest-numbered tier. A tier without a
//! filter catches every host that reaches its level. A tier that is not
//! configured adds neither a hop nor a level.

use std::collections::HashMap;

use tracing::info;

use crate::{Dialer, HostMatcher, RouteToken, Tier, Upstream};

/// One configured tier
#[derive(Debug, Clone)]
pub struct TierConfig {
    pub upstream: Upstream,
    /// Empty means every host
    pub filter: HostMatcher,
}

impl TierConfig {
    pub fn new(upstream: Upstream) -> Self {
        Self {
            upstream,
            filter: HostMatcher::new(),
        }
    }

    pub fn with_filter(mut self, filter: HostMatcher) -> Self {
        self.filter = filter;
        self
    }
}

/// Everything the route chain is built from
#[derive(Debug, Clone, Default)]
pub struct RoutingConfig {
    pub tier1: Option<TierConfig>,
    pub tier2: Option<TierConfig>,
    pub tier3: Option<TierConfig>,
    pub exclusion: HostMatcher,
}

impl RoutingConfig {
    pub fn tier(&self, tier: Tier) -> Option<&TierConfig> {
        match tier {
            Tier::One => self.tier1.as_ref(),
            Tier::Two => self.tier2.as_ref(),
            Tier::Three => self.tier3.as_ref(),
        }
    }
}

/// Immutable routing decision tree plus the dialer path behind each route token
#[derive(Debug, Clone)]
pub struct RouteChain {
    root: Dialer,
    paths: HashMap<RouteToken, Dialer>,
    exclusion: HostMatcher,
}

impl RouteChain {
    pub fn build(config: RoutingConfig) -> Self {
        let mut paths = HashMap::new();
        paths.insert(RouteToken::Direct, Dialer::Direct);

        // Path the next tier up chains onto
        let mut upstream_path = Dialer::Direct;
        let mut decision = Dialer::Direct;

        for tier in [Tier::Three, Tier::Two, Tier::One] {
            let Some(tier_config) = config.tier(tier) else {
                continue;
            };
            let upstream = tier_config.upstream.clone();
            let path = Dialer::tunnel(upstream.clone(), upstream_path);
            paths.insert(RouteToken::Tier(tier), path.clone());

            decision = if tier_config.filter.is_empty() {
                info!("Redirecting: * -> {} ({})", upstream, tier);
                path.clone()
            } else {
                for host in tier_config.filter.hosts() {
                    info!("Redirecting: {} -> {} ({})", host, upstream, tier);
                }
                for zone in tier_config.filter.zones() {
                    info!("Redirecting: *.{} -> {} ({})", zone, upstream, tier);
                }
                Dialer::conditional(tier_config.filter.clone(), path.clone(), decision)
            };

            upstream_path = path;
        }

        if !config.exclusion.is_empty() {
            for host in config.exclusion.hosts() {
                info!("Excluding: {} -> direct", host);
            }
            for zone in config.exclusion.zones() {
                info!("Excluding: *.{} -> direct", zone);
            }
            decision = Dialer::conditional(config.exclusion.clone(), Dialer::Direct, decision);
        }

        Self {
            root: decision,
            paths,
            exclusion: config.exclusion,
        }
    }

    /// The full decision tree
    pub fn root(&self) -> &Dialer {
        &self.root
    }

    /// Runs the decision tree for `host`
    pub fn resolve(&self, host: &str) -> (RouteToken, &Dialer) {
        self.root.select(host)
    }

    /// Whether `host` is always dialed directly, whatever else applies to it
    pub fn is_excluded(&self, host: &str) -> bool {
        self.exclusion.matches(host)
    }

    /// Reconstructs the path behind a previously selected route token.
    ///
    /// Returns `None` for tokens naming a tier that is not configured.
    pub fn path(&self, token: RouteToken) -> Option<&Dialer> {
        self.paths.get(&token)
    }

    pub fn routes(&self) -> impl Iterator<Item = RouteToken> + '_ {
        self.paths.keys().copied()
    }
}
