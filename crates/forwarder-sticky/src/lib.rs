//! Sticky session store
//!
//! Pins a client to the route it was given on its first successful connection.
//! Two backends sit behind [`StickyStorage`]:
//! - **Memory** (`":memory:"`, the default): entries live as long as the process
//! - **SQLite file**: entries survive restarts; one process owns the file at a time

pub mod database;
pub mod entities;
pub mod memory;
pub mod migrator;

pub use database::DatabaseStorage;
pub use memory::MemoryStorage;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forwarder_router::{RouteToken, UnknownRouteToken};
use sea_orm::DbErr;
use thiserror::Error;
use tracing::info;

/// Location value that selects the in-memory backend
pub const MEMORY_STORAGE: &str = ":memory:";

#[derive(Debug, Error)]
pub enum StickyError {
    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error("Failed to open sticky database {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: DbErr,
    },

    #[error("Sticky database {path} is locked by another process: {source}")]
    Locked {
        path: String,
        #[source]
        source: DbErr,
    },

    #[error("Stored route for {client_key} is invalid: {source}")]
    InvalidRoute {
        client_key: String,
        #[source]
        source: UnknownRouteToken,
    },
}

/// One client's pinned route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StickyEntry {
    pub client_key: String,
    pub route: RouteToken,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Backend for sticky entries. Implementations synchronise internally.
#[async_trait]
pub trait StickyStorage: Send + Sync {
    async fn load(&self, client_key: &str) -> Result<Option<RouteToken>, StickyError>;

    /// Inserts or overwrites the entry for `client_key`
    async fn save(&self, client_key: &str, route: RouteToken) -> Result<(), StickyError>;

    /// All entries, ordered by client key
    async fn list(&self) -> Result<Vec<StickyEntry>, StickyError>;

    /// Releases whatever the backend holds open
    async fn close(&self) -> Result<(), StickyError> {
        Ok(())
    }
}

/// Shared handle to the configured sticky backend
#[derive(Clone)]
pub struct StickyMapper {
    storage: Arc<dyn StickyStorage>,
}

impl StickyMapper {
    pub fn new(storage: Arc<dyn StickyStorage>) -> Self {
        Self { storage }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    /// Opens the backend named by `location`: [`MEMORY_STORAGE`] (or an empty
    /// string) for memory, anything else is a SQLite file path.
    pub async fn open(location: &str) -> Result<Self, StickyError> {
        let location = location.trim();
        if location.is_empty() || location == MEMORY_STORAGE {
            info!("Using in-memory sticky storage");
            return Ok(Self::in_memory());
        }

        let storage = DatabaseStorage::open(location).await?;
        Ok(Self::new(Arc::new(storage)))
    }

    /// Key a client is tracked under: its IP address, without the port
    pub fn client_key(peer: &SocketAddr) -> String {
        peer.ip().to_canonical().to_string()
    }

    pub async fn lookup(&self, client_key: &str) -> Result<Option<RouteToken>, StickyError> {
        self.storage.load(client_key).await
    }

    pub async fn store(&self, client_key: &str, route: RouteToken) -> Result<(), StickyError> {
        self.storage.save(client_key, route).await
    }

    pub async fn entries(&self) -> Result<Vec<StickyEntry>, StickyError> {
        self.storage.list().await
    }

    /// Closes the backend. Later calls on any clone of this mapper fail.
    pub async fn close(&self) -> Result<(), StickyError> {
        self.storage.close().await
    }
}

impl std::fmt::Debug for StickyMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StickyMapper").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_key_drops_port() {
        let v4: SocketAddr = "203.0.113.7:51234".parse().unwrap();
        assert_eq!(StickyMapper::client_key(&v4), "203.0.113.7");

        let mapped: SocketAddr = "[::ffff:203.0.113.7]:443".parse().unwrap();
        assert_eq!(StickyMapper::client_key(&mapped), "203.0.113.7");

        let v6: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        assert_eq!(StickyMapper::client_key(&v6), "2001:db8::1");
    }
}
