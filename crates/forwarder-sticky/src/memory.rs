//! In-memory sticky storage

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use forwarder_router::RouteToken;

use crate::{StickyEntry, StickyError, StickyStorage};

/// Process-lifetime storage backed by a concurrent map
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: DashMap<String, StickyEntry>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StickyStorage for MemoryStorage {
    async fn load(&self, client_key: &str) -> Result<Option<RouteToken>, StickyError> {
        Ok(self.entries.get(client_key).map(|entry| entry.route))
    }

    async fn save(&self, client_key: &str, route: RouteToken) -> Result<(), StickyError> {
        let now = Utc::now();
        self.entries
            .entry(client_key.to_string())
            .and_modify(|entry| {
                entry.route = route;
                entry.updated_at = now;
            })
            .or_insert_with(|| StickyEntry {
                client_key: client_key.to_string(),
                route,
                created_at: now,
                updated_at: now,
            });
        Ok(())
    }

    async fn list(&self) -> Result<Vec<StickyEntry>, StickyError> {
        let mut entries: Vec<StickyEntry> =
            self.entries.iter().map(|entry| entry.value().clone()).collect();
        entries.sort_by(|a, b| a.client_key.cmp(&b.client_key));
        Ok(entries)
    }
}
