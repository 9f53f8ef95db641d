//! Migration to create the sticky_mappings table

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(StickyMappings::Table)
                    .if_not_exists()
                    .col(string_len(StickyMappings::ClientKey, 64).primary_key())
                    .col(string_len(StickyMappings::Route, 16).not_null())
                    .col(
                        timestamp_with_time_zone(StickyMappings::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(StickyMappings::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(StickyMappings::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum StickyMappings {
    #[sea_orm(iden = "sticky_mappings")]
    Table,
    ClientKey,
    Route,
    CreatedAt,
    UpdatedAt,
}
