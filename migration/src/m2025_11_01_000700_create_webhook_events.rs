//! Creates the webhook_events table used by the webhook intake queue.
//!
//! Rows record every accepted delivery together with its processing state so
//! the retry sweep can resubmit unprocessed events.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(WebhookEvents::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(WebhookEvents::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(WebhookEvents::TenantId).uuid().not_null())
                    .col(
                        ColumnDef::new(WebhookEvents::ConnectionId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WebhookEvents::MarketplaceType)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WebhookEvents::IdempotencyKey)
                            .text()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(WebhookEvents::EventId).text().not_null())
                    .col(ColumnDef::new(WebhookEvents::EventType).text().not_null())
                    .col(
                        ColumnDef::new(WebhookEvents::ResourceType)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(WebhookEvents::ResourceId).text().null())
                    .col(ColumnDef::new(WebhookEvents::Version).big_integer().null())
                    .col(
                        ColumnDef::new(WebhookEvents::EventTime)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(WebhookEvents::Payload).json_binary().null())
                    .col(
                        ColumnDef::new(WebhookEvents::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(WebhookEvents::Processed)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(WebhookEvents::RetryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(WebhookEvents::MaxRetries)
                            .integer()
                            .not_null()
                            .default(5),
                    )
                    .col(
                        ColumnDef::new(WebhookEvents::ProcessingError)
                            .text()
                            .null(),
                    )
                    .col(ColumnDef::new(WebhookEvents::SyncJobId).uuid().null())
                    .col(
                        ColumnDef::new(WebhookEvents::ProcessedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(WebhookEvents::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(WebhookEvents::UpdatedAt)
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
                    .name("idx_webhook_events_retry")
                    .table(WebhookEvents::Table)
                    .col(WebhookEvents::Processed)
                    .col(WebhookEvents::Status)
                    .col(WebhookEvents::UpdatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(WebhookEvents::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum WebhookEvents {
    Table,
    Id,
    TenantId,
    ConnectionId,
    MarketplaceType,
    IdempotencyKey,
    EventId,
    EventType,
    ResourceType,
    ResourceId,
    Version,
    EventTime,
    Payload,
    Status,
    Processed,
    RetryCount,
    MaxRetries,
    ProcessingError,
    SyncJobId,
    ProcessedAt,
    CreatedAt,
    UpdatedAt,
}
