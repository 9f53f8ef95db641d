//! SQLite sticky storage
//!
//! The database is opened through a pool of exactly one connection in
//! exclusive locking mode. That connection takes the file's exclusive lock
//! right after connecting and never gives it back, so a second process (or a
//! second storage in this process) pointed at the same file fails to open.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use forwarder_router::RouteToken;
use sea_orm::sea_query::OnConflict;
use sea_orm::sqlx::sqlite::{SqliteJournalMode, SqliteLockingMode};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, EntityTrait,
    QueryOrder, Set,
};
use sea_orm_migration::MigratorTrait;
use tracing::{debug, info};

use crate::entities::sticky_mapping;
use crate::migrator::Migrator;
use crate::{StickyEntry, StickyError, StickyStorage};

/// Keeps the single connection (and with it the file lock) for a year
const CONNECTION_LIFETIME: Duration = Duration::from_secs(365 * 24 * 60 * 60);

pub struct DatabaseStorage {
    db: DatabaseConnection,
    location: String,
}

impl DatabaseStorage {
    /// Opens (creating if needed) the SQLite file at `path`
    pub async fn open(path: &str) -> Result<Self, StickyError> {
        Self::connect(&format!("sqlite://{}?mode=rwc", path), path).await
    }

    /// Opens any SQLite URL, e.g. `"sqlite::memory:"`
    pub async fn connect(database_url: &str, location: &str) -> Result<Self, StickyError> {
        let mut options = ConnectOptions::new(database_url.to_string());
        options
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(CONNECTION_LIFETIME)
            .max_lifetime(CONNECTION_LIFETIME)
            .sqlx_logging(false)
            .map_sqlx_sqlite_opts(|opts| {
                opts.journal_mode(SqliteJournalMode::Delete)
                    .locking_mode(SqliteLockingMode::Exclusive)
                    // Fail immediately instead of waiting for the lock holder
                    .busy_timeout(Duration::ZERO)
            });

        let db = Database::connect(options)
            .await
            .map_err(|source| StickyError::Open {
                path: location.to_string(),
                source,
            })?;

        lock(&db).await.map_err(|source| StickyError::Locked {
            path: location.to_string(),
            source,
        })?;

        info!("Running sticky database migrations...");
        Migrator::up(&db, None).await?;
        info!("Opened sticky database {}", location);

        Ok(Self {
            db,
            location: location.to_string(),
        })
    }

}

/// Takes the exclusive file lock. In exclusive locking mode SQLite keeps it
/// after the transaction ends.
async fn lock(db: &DatabaseConnection) -> Result<(), DbErr> {
    db.execute_unprepared("BEGIN EXCLUSIVE").await?;
    db.execute_unprepared("COMMIT").await?;
    Ok(())
}

fn to_entry(model: sticky_mapping::Model) -> Result<StickyEntry, StickyError> {
    let route = model
        .route
        .parse::<RouteToken>()
        .map_err(|source| StickyError::InvalidRoute {
            client_key: model.client_key.clone(),
            source,
        })?;
    Ok(StickyEntry {
        client_key: model.client_key,
        route,
        created_at: model.created_at,
        updated_at: model.updated_at,
    })
}

#[async_trait]
impl StickyStorage for DatabaseStorage {
    async fn load(&self, client_key: &str) -> Result<Option<RouteToken>, StickyError> {
        let model = sticky_mapping::Entity::find_by_id(client_key.to_string())
            .one(&self.db)
            .await?;

        model.map(|m| to_entry(m).map(|entry| entry.route)).transpose()
    }

    async fn save(&self, client_key: &str, route: RouteToken) -> Result<(), StickyError> {
        let now = Utc::now();
        let mapping = sticky_mapping::ActiveModel {
            client_key: Set(client_key.to_string()),
            route: Set(route.to_string()),
            created_at: Set(now),
            updated_at: Set(now),
        };

        sticky_mapping::Entity::insert(mapping)
            .on_conflict(
                OnConflict::column(sticky_mapping::Column::ClientKey)
                    .update_columns([
                        sticky_mapping::Column::Route,
                        sticky_mapping::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;

        debug!("Stored sticky route {} for {}", route, client_key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<StickyEntry>, StickyError> {
        sticky_mapping::Entity::find()
            .order_by_asc(sticky_mapping::Column::ClientKey)
            .all(&self.db)
            .await?
            .into_iter()
            .map(to_entry)
            .collect()
    }

    async fn close(&self) -> Result<(), StickyError> {
        // Clones share the pool, so this closes the one connection
        self.db.clone().close().await?;
        info!("Closed sticky database {}", self.location);
        Ok(())
    }
}
