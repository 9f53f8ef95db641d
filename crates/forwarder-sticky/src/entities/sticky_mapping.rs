//! StickyMapping entity: one pinned route per client

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sticky_mappings")]
pub struct Model {
    /// Client IP address (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub client_key: String,

    /// Route token: direct, tier1, tier2 or tier3
    pub route: String,

    /// When the client was first pinned
    pub created_at: ChronoDateTimeUtc,

    /// When the route was last written
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
