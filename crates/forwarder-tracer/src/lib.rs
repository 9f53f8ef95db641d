//! Per-domain connection counters
//!
//! [`DomainTracer`] counts successful connections per destination host.
//! [`NoopTracer`] is used when counting is disabled and records nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace};

pub trait DomainTracker: Send + Sync {
    /// Counts one more connection to `domain`
    fn inc(&self, domain: &str);

    /// Snapshot of every counter
    fn dump(&self) -> HashMap<String, u64>;
}

/// Counter table keyed by host
#[derive(Debug, Default)]
pub struct DomainTracer {
    counters: DashMap<String, AtomicU64>,
}

impl DomainTracer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DomainTracker for DomainTracer {
    fn inc(&self, domain: &str) {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();

        // Existing hosts only need the shard read lock
        if let Some(counter) = self.counters.get(&domain) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }

        trace!("Tracking new domain {}", domain);
        self.counters
            .entry(domain)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    fn dump(&self) -> HashMap<String, u64> {
        self.counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl DomainTracker for NoopTracer {
    fn inc(&self, _domain: &str) {}

    fn dump(&self) -> HashMap<String, u64> {
        HashMap::new()
    }
}

/// Picks the tracker for the `enable-domain-tracer` setting
pub fn tracker(enabled: bool) -> Arc<dyn DomainTracker> {
    if enabled {
        debug!("Domain tracer enabled");
        Arc::new(DomainTracer::new())
    } else {
        Arc::new(NoopTracer)
    }
}
