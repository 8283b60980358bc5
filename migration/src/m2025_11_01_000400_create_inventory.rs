//! Creates inventory_current and the append-only inventory_ledger.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(InventoryCurrent::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(InventoryCurrent::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(InventoryCurrent::TenantId).uuid().not_null())
                    .col(ColumnDef::new(InventoryCurrent::OfferId).uuid().not_null())
                    .col(
                        ColumnDef::new(InventoryCurrent::LocationId)
                            .uuid()
                            .not_null(),
                    )
                    .col(ColumnDef::new(InventoryCurrent::Sku).text().null())
                    .col(
                        ColumnDef::new(InventoryCurrent::QuantityOnHand)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(InventoryCurrent::QuantityReserved)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(InventoryCurrent::LowStockThreshold)
                            .big_integer()
                            .not_null()
                            .default(10),
                    )
                    .col(
                        ColumnDef::new(InventoryCurrent::ReorderPoint)
                            .big_integer()
                            .not_null()
                            .default(20),
                    )
                    .col(
                        ColumnDef::new(InventoryCurrent::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(InventoryCurrent::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_inventory_current_tenant_id")
                            .from(InventoryCurrent::Table, InventoryCurrent::TenantId)
                            .to(Tenants::Table, Tenants::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_inventory_current_offer_location")
                    .table(InventoryCurrent::Table)
                    .col(InventoryCurrent::TenantId)
                    .col(InventoryCurrent::OfferId)
                    .col(InventoryCurrent::LocationId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(InventoryLedger::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(InventoryLedger::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(InventoryLedger::TenantId).uuid().not_null())
                    .col(
                        ColumnDef::new(InventoryLedger::InventoryId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InventoryLedger::Sequence)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InventoryLedger::TransactionType)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(InventoryLedger::Bucket).text().not_null())
                    .col(
                        ColumnDef::new(InventoryLedger::QuantityChange)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InventoryLedger::RequestedChange)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InventoryLedger::QuantityBefore)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InventoryLedger::QuantityAfter)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(InventoryLedger::Source).text().not_null())
                    .col(ColumnDef::new(InventoryLedger::ReferenceType).text().null())
                    .col(ColumnDef::new(InventoryLedger::ReferenceId).text().null())
                    .col(ColumnDef::new(InventoryLedger::Notes).text().null())
                    .col(ColumnDef::new(InventoryLedger::CreatedBy).text().null())
                    .col(
                        ColumnDef::new(InventoryLedger::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_inventory_ledger_inventory_id")
                            .from(InventoryLedger::Table, InventoryLedger::InventoryId)
                            .to(InventoryCurrent::Table, InventoryCurrent::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_inventory_ledger_inventory_sequence")
                    .table(InventoryLedger::Table)
                    .col(InventoryLedger::InventoryId)
                    .col(InventoryLedger::Sequence)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(InventoryLedger::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(InventoryCurrent::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum InventoryCurrent {
    Table,
    Id,
    TenantId,
    OfferId,
    LocationId,
    Sku,
    QuantityOnHand,
    QuantityReserved,
    LowStockThreshold,
    ReorderPoint,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum InventoryLedger {
    Table,
    Id,
    TenantId,
    InventoryId,
    Sequence,
    TransactionType,
    Bucket,
    QuantityChange,
    RequestedChange,
    QuantityBefore,
    QuantityAfter,
    Source,
    ReferenceType,
    ReferenceId,
    Notes,
    CreatedBy,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Tenants {
    Table,
    Id,
}
