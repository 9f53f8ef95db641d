//! Forwarder
//!
//! TLS-forwarding CONNECT proxy. Routes each client connection directly or
//! through a chain of up to three upstream HTTP proxies, picked per destination
//! host, and pins clients to the route they were first given.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use forwarder_api::{ApiServer, ApiServerConfig};
use forwarder_router::{
    ConfigError, HostMatcher, RouteChain, RoutingConfig, Tier, TierConfig, Upstream,
    DEFAULT_HINT_HEADER,
};
use forwarder_server::{split_host_port, PortMap, ProxyServer, ProxyServerConfig};
use forwarder_sticky::{StickyMapper, MEMORY_STORAGE};

/// TLS-forwarding CONNECT proxy with tiered upstream routing
#[derive(Parser, Debug)]
#[command(name = "forwarder")]
#[command(about = "Forward client connections through tiered upstream proxies", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Primary listen address; its port maps to target port 443
    #[arg(long = "proxy.bind", env = "PROXY_BIND", default_value = ":8443")]
    proxy_bind: String,

    /// Management API bind address
    #[arg(long = "proxy.api-bind", env = "PROXY_API_BIND", default_value = ":8000")]
    api_bind: String,

    /// Tier 1 upstream proxy URL (e.g. http://superproxy.com:8080)
    #[arg(long = "proxy.upstream-url1", env = "PROXY_UPSTREAM_URL1", default_value = "")]
    upstream_url1: String,

    #[arg(long = "proxy.user1", env = "PROXY_USER1", default_value = "")]
    user1: String,

    #[arg(long = "proxy.pass1", env = "PROXY_PASS1", default_value = "", hide_env_values = true)]
    pass1: String,

    /// Tier 2 upstream proxy URL; tier 1 is reached through it
    #[arg(long = "proxy.upstream-url2", env = "PROXY_UPSTREAM_URL2", default_value = "")]
    upstream_url2: String,

    #[arg(long = "proxy.user2", env = "PROXY_USER2", default_value = "")]
    user2: String,

    #[arg(long = "proxy.pass2", env = "PROXY_PASS2", default_value = "", hide_env_values = true)]
    pass2: String,

    /// Tier 3 upstream proxy URL; tiers 1 and 2 are reached through it
    #[arg(long = "proxy.upstream-url3", env = "PROXY_UPSTREAM_URL3", default_value = "")]
    upstream_url3: String,

    #[arg(long = "proxy.user3", env = "PROXY_USER3", default_value = "")]
    user3: String,

    #[arg(long = "proxy.pass3", env = "PROXY_PASS3", default_value = "", hide_env_values = true)]
    pass3: String,

    /// Routing hint (e.g. exit country) sent to every upstream
    #[arg(long = "proxy.country", env = "PROXY_COUNTRY", default_value = "")]
    country: String,

    /// Header the routing hint is sent in
    #[arg(long = "proxy.country-header", env = "PROXY_COUNTRY_HEADER", default_value = DEFAULT_HINT_HEADER)]
    country_header: String,

    /// Extra listen:target port pairs, comma separated (e.g. 8443:443,18443:8443)
    #[arg(long = "proxy.port-map", env = "PROXY_PORT_MAP", value_delimiter = ',')]
    port_map: Vec<String>,

    /// Hostnames routed through tier 1 (empty: every host)
    #[arg(long = "filter.hostnames1", env = "FILTER_HOSTNAMES1", value_delimiter = ',')]
    filter_hostnames1: Vec<String>,

    /// Zones routed through tier 1
    #[arg(long = "filter.zones1", env = "FILTER_ZONES1", value_delimiter = ',')]
    filter_zones1: Vec<String>,

    #[arg(long = "filter.hostnames2", env = "FILTER_HOSTNAMES2", value_delimiter = ',')]
    filter_hostnames2: Vec<String>,

    #[arg(long = "filter.zones2", env = "FILTER_ZONES2", value_delimiter = ',')]
    filter_zones2: Vec<String>,

    #[arg(long = "filter.hostnames3", env = "FILTER_HOSTNAMES3", value_delimiter = ',')]
    filter_hostnames3: Vec<String>,

    #[arg(long = "filter.zones3", env = "FILTER_ZONES3", value_delimiter = ',')]
    filter_zones3: Vec<String>,

    /// Hostnames always dialed directly
    #[arg(long = "exclude.hostnames", env = "EXCLUDE_HOSTNAMES", value_delimiter = ',')]
    exclude_hostnames: Vec<String>,

    /// Zones always dialed directly
    #[arg(long = "exclude.zones", env = "EXCLUDE_ZONES", value_delimiter = ',')]
    exclude_zones: Vec<String>,

    /// SQLite file for sticky mappings, or ":memory:" to keep them in memory
    #[arg(long = "stickiness-db-path", env = "STICKINESS_DB_PATH", default_value = MEMORY_STORAGE)]
    stickiness_db_path: String,

    /// Count connections per destination domain
    #[arg(long = "enable-domain-tracer", env = "ENABLE_DOMAIN_TRACER")]
    enable_domain_tracer: bool,

    /// Seconds a client has to send its CONNECT request
    #[arg(long, env = "HANDSHAKE_TIMEOUT", default_value = "30")]
    handshake_timeout: u64,

    /// Seconds allowed for reaching the destination through the upstream chain
    #[arg(long, env = "DIAL_TIMEOUT", default_value = "30")]
    dial_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn routing_config(&self) -> Result<RoutingConfig, ConfigError> {
        Ok(RoutingConfig {
            tier1: self.tier_config(
                Tier::One,
                &self.upstream_url1,
                &self.user1,
                &self.pass1,
                &self.filter_hostnames1,
                &self.filter_zones1,
            )?,
            tier2: self.tier_config(
                Tier::Two,
                &self.upstream_url2,
                &self.user2,
                &self.pass2,
                &self.filter_hostnames2,
                &self.filter_zones2,
            )?,
            tier3: self.tier_config(
                Tier::Three,
                &self.upstream_url3,
                &self.user3,
                &self.pass3,
                &self.filter_hostnames3,
                &self.filter_zones3,
            )?,
            exclusion: HostMatcher::from_lists(&self.exclude_hostnames, &self.exclude_zones)
                .map_err(|source| ConfigError::InvalidFilter {
                    tier: "exclusions".to_string(),
                    source,
                })?,
        })
    }

    fn tier_config(
        &self,
        tier: Tier,
        url: &str,
        user: &str,
        pass: &str,
        hostnames: &[String],
        zones: &[String],
    ) -> Result<Option<TierConfig>, ConfigError> {
        if url.trim().is_empty() {
            if !hostnames.is_empty() || !zones.is_empty() {
                warn!("Ignoring {} filter: no upstream URL configured", tier);
            }
            return Ok(None);
        }

        let upstream = Upstream::from_url(tier, url)?
            .with_credentials(user, pass)
            .with_routing_hint(&self.country_header, &self.country);
        let filter = HostMatcher::from_lists(hostnames, zones).map_err(|source| {
            ConfigError::InvalidFilter {
                tier: tier.to_string(),
                source,
            }
        })?;

        Ok(Some(TierConfig::new(upstream).with_filter(filter)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    info!("Starting forwarder {}", env!("GIT_TAG"));

    // Everything below is validated before any listener is bound
    let routing = cli.routing_config().context("Invalid routing configuration")?;
    let port_map = PortMap::parse(&cli.port_map, &cli.proxy_bind)
        .context("Invalid --proxy.port-map or --proxy.bind")?;
    let (bind_host, _) = split_host_port(&cli.proxy_bind)?;
    let api_addr = resolve_bind_addr(&cli.api_bind)
        .await
        .context("Invalid --proxy.api-bind")?;

    let chain = Arc::new(RouteChain::build(routing));
    let sticky = StickyMapper::open(&cli.stickiness_db_path)
        .await
        .with_context(|| format!("Failed to open sticky storage {}", cli.stickiness_db_path))?;
    let tracker = forwarder_tracer::tracker(cli.enable_domain_tracer);

    let config = ProxyServerConfig::new(bind_host, port_map)
        .with_handshake_timeout(Duration::from_secs(cli.handshake_timeout))
        .with_dial_timeout(Duration::from_secs(cli.dial_timeout));
    let server = ProxyServer::new(config, chain, sticky.clone(), tracker.clone())
        .bind()
        .await?;
    for addr in server.local_addrs() {
        info!("Listening on {}", addr);
    }

    let api = ApiServer::new(ApiServerConfig { bind_addr: api_addr }, sticky.clone(), tracker);

    let mut proxy_handle = tokio::spawn(server.serve());
    let mut api_handle = tokio::spawn(api.start());

    info!("Press Ctrl+C to stop");

    tokio::select! {
        result = signal::ctrl_c() => match result {
            Ok(()) => info!("Shutdown signal received, stopping servers..."),
            Err(err) => error!("Error listening for shutdown signal: {}", err),
        },
        result = &mut proxy_handle => {
            api_handle.abort();
            result??;
            anyhow::bail!("Proxy server stopped unexpectedly");
        }
        result = &mut api_handle => {
            proxy_handle.abort();
            result??;
            anyhow::bail!("API server stopped unexpectedly");
        }
    }

    proxy_handle.abort();
    api_handle.abort();

    if let Err(e) = sticky.close().await {
        warn!("Failed to close sticky storage: {}", e);
    }

    info!("Forwarder stopped");
    Ok(())
}

/// Resolves `host:port`, where an empty host means all interfaces
async fn resolve_bind_addr(addr: &str) -> Result<SocketAddr> {
    let (host, port) = split_host_port(addr)?;
    let host = if host.is_empty() { "0.0.0.0" } else { host };

    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .with_context(|| format!("{} did not resolve to an address", addr))
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
