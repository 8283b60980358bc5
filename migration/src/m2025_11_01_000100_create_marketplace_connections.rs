//! Creates the marketplace_connections table.
//!
//! A connection is one tenant's authorization against one external store
//! (Shopify shop, Amazon seller account, Dukaan store). Sync jobs, mappings
//! and webhook events all hang off a connection.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(MarketplaceConnections::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(MarketplaceConnections::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(MarketplaceConnections::TenantId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(MarketplaceConnections::MarketplaceType)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(MarketplaceConnections::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(MarketplaceConnections::DisplayName)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(MarketplaceConnections::ExternalStoreId)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(MarketplaceConnections::Credentials)
                            .json_binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(MarketplaceConnections::WebhookSecret)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(MarketplaceConnections::DefaultLocationId)
                            .uuid()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(MarketplaceConnections::LastSyncAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(MarketplaceConnections::Metadata)
                            .json_binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(MarketplaceConnections::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(MarketplaceConnections::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_marketplace_connections_tenant_id")
                            .from(
                                MarketplaceConnections::Table,
                                MarketplaceConnections::TenantId,
                            )
                            .to(Tenants::Table, Tenants::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Webhook intake resolves the connection by (marketplace, store id)
        manager
            .create_index(
                Index::create()
                    .name("idx_marketplace_connections_store")
                    .table(MarketplaceConnections::Table)
                    .col(MarketplaceConnections::MarketplaceType)
                    .col(MarketplaceConnections::ExternalStoreId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_marketplace_connections_tenant_status")
                    .table(MarketplaceConnections::Table)
                    .col(MarketplaceConnections::TenantId)
                    .col(MarketplaceConnections::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(
                Table::drop()
                    .table(MarketplaceConnections::Table)
                    .to_owned(),
            )
            .await
    }
}

#[derive(DeriveIden)]
enum MarketplaceConnections {
    Table,
    Id,
    TenantId,
    MarketplaceType,
    Status,
    DisplayName,
    ExternalStoreId,
    Credentials,
    WebhookSecret,
    DefaultLocationId,
    LastSyncAt,
    Metadata,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Tenants {
    Table,
    Id,
}
