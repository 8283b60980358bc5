//! Creates external_mappings and canonical_records.
//!
//! A mapping links one external marketplace entity (product or order) to an
//! internal canonical record and keeps the last external snapshot seen for it.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CanonicalRecords::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CanonicalRecords::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(CanonicalRecords::TenantId).uuid().not_null())
                    .col(
                        ColumnDef::new(CanonicalRecords::EntityType)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(CanonicalRecords::Sku).text().null())
                    .col(ColumnDef::new(CanonicalRecords::Data).json_binary().not_null())
                    .col(
                        ColumnDef::new(CanonicalRecords::DeletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CanonicalRecords::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(CanonicalRecords::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ExternalMappings::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ExternalMappings::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ExternalMappings::TenantId).uuid().not_null())
                    .col(
                        ColumnDef::new(ExternalMappings::ConnectionId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ExternalMappings::EntityType)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(ExternalMappings::InternalId).uuid().null())
                    .col(
                        ColumnDef::new(ExternalMappings::ExternalId)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(ExternalMappings::ExternalSku).text().null())
                    .col(
                        ColumnDef::new(ExternalMappings::ExternalData)
                            .json_binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ExternalMappings::ExternalUpdatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ExternalMappings::LastSyncedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ExternalMappings::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ExternalMappings::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_external_mappings_connection_id")
                            .from(ExternalMappings::Table, ExternalMappings::ConnectionId)
                            .to(MarketplaceConnections::Table, MarketplaceConnections::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_external_mappings_external")
                    .table(ExternalMappings::Table)
                    .col(ExternalMappings::ConnectionId)
                    .col(ExternalMappings::EntityType)
                    .col(ExternalMappings::ExternalId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_external_mappings_sku")
                    .table(ExternalMappings::Table)
                    .col(ExternalMappings::ConnectionId)
                    .col(ExternalMappings::ExternalSku)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ExternalMappings::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(CanonicalRecords::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum CanonicalRecords {
    Table,
    Id,
    TenantId,
    EntityType,
    Sku,
    Data,
    DeletedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum ExternalMappings {
    Table,
    Id,
    TenantId,
    ConnectionId,
    EntityType,
    InternalId,
    ExternalId,
    ExternalSku,
    ExternalData,
    ExternalUpdatedAt,
    LastSyncedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum MarketplaceConnections {
    Table,
    Id,
}
