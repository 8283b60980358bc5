//! Creates the event_versions and out_of_order_events tables backing the
//! webhook event ordering guard.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(EventVersions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(EventVersions::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(EventVersions::TenantId).uuid().not_null())
                    .col(ColumnDef::new(EventVersions::EntityType).text().not_null())
                    .col(ColumnDef::new(EventVersions::EntityId).text().not_null())
                    .col(
                        ColumnDef::new(EventVersions::Version)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(EventVersions::LastEventTime)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(EventVersions::LastEventId).text().not_null())
                    .col(
                        ColumnDef::new(EventVersions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(EventVersions::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_event_versions_entity")
                    .table(EventVersions::Table)
                    .col(EventVersions::TenantId)
                    .col(EventVersions::EntityType)
                    .col(EventVersions::EntityId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(OutOfOrderEvents::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(OutOfOrderEvents::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(OutOfOrderEvents::TenantId).uuid().not_null())
                    .col(
                        ColumnDef::new(OutOfOrderEvents::EntityType)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(OutOfOrderEvents::EntityId).text().not_null())
                    .col(ColumnDef::new(OutOfOrderEvents::EventId).text().not_null())
                    .col(
                        ColumnDef::new(OutOfOrderEvents::EventTime)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(OutOfOrderEvents::Version).big_integer().null())
                    .col(
                        ColumnDef::new(OutOfOrderEvents::ExpectedVersion)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OutOfOrderEvents::Payload)
                            .json_binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(OutOfOrderEvents::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(OutOfOrderEvents::Resolution).text().null())
                    .col(
                        ColumnDef::new(OutOfOrderEvents::ProcessedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(OutOfOrderEvents::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_out_of_order_events_pending")
                    .table(OutOfOrderEvents::Table)
                    .col(OutOfOrderEvents::Status)
                    .col(OutOfOrderEvents::TenantId)
                    .col(OutOfOrderEvents::EntityType)
                    .col(OutOfOrderEvents::EntityId)
                    .col(OutOfOrderEvents::EventTime)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(OutOfOrderEvents::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(EventVersions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum EventVersions {
    Table,
    Id,
    TenantId,
    EntityType,
    EntityId,
    Version,
    LastEventTime,
    LastEventId,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum OutOfOrderEvents {
    Table,
    Id,
    TenantId,
    EntityType,
    EntityId,
    EventId,
    EventTime,
    Version,
    ExpectedVersion,
    Payload,
    Status,
    Resolution,
    ProcessedAt,
    CreatedAt,
}
