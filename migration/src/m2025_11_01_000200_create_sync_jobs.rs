//! Creates the sync_jobs and sync_logs tables.
//!
//! Progress counters are explicit integer columns. The idempotency key is
//! globally unique, and a partial unique index keeps at most one running job
//! per connection.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncJobs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(SyncJobs::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(SyncJobs::TenantId).uuid().not_null())
                    .col(ColumnDef::new(SyncJobs::ConnectionId).uuid().not_null())
                    .col(ColumnDef::new(SyncJobs::JobType).text().not_null())
                    .col(ColumnDef::new(SyncJobs::Domain).text().not_null())
                    .col(
                        ColumnDef::new(SyncJobs::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::TriggeredBy)
                            .text()
                            .not_null()
                            .default("manual"),
                    )
                    .col(ColumnDef::new(SyncJobs::CreatedBy).text().null())
                    .col(
                        ColumnDef::new(SyncJobs::TotalItems)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::ProcessedItems)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::SucceededItems)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::FailedItems)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::SkippedItems)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::ProgressPercentage)
                            .double()
                            .not_null()
                            .default(0.0),
                    )
                    .col(ColumnDef::new(SyncJobs::Cursor).json_binary().null())
                    .col(
                        ColumnDef::new(SyncJobs::IdempotencyKey)
                            .text()
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::Priority)
                            .small_integer()
                            .not_null()
                            .default(5),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::RetryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::MaxRetries)
                            .integer()
                            .not_null()
                            .default(3),
                    )
                    .col(ColumnDef::new(SyncJobs::ParentJobId).uuid().null())
                    .col(ColumnDef::new(SyncJobs::TargetEntityId).text().null())
                    .col(ColumnDef::new(SyncJobs::ErrorMessage).text().null())
                    .col(
                        ColumnDef::new(SyncJobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sync_jobs_tenant_id")
                            .from(SyncJobs::Table, SyncJobs::TenantId)
                            .to(Tenants::Table, Tenants::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sync_jobs_connection_id")
                            .from(SyncJobs::Table, SyncJobs::ConnectionId)
                            .to(MarketplaceConnections::Table, MarketplaceConnections::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_jobs_tenant_status_created")
                    .table(SyncJobs::Table)
                    .col(SyncJobs::TenantId)
                    .col(SyncJobs::Status)
                    .col(SyncJobs::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_jobs_connection_status")
                    .table(SyncJobs::Table)
                    .col(SyncJobs::ConnectionId)
                    .col(SyncJobs::Status)
                    .to_owned(),
            )
            .await?;

        // Single running job per connection, enforced by the store as well as the orchestrator
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_jobs_one_running_per_connection \
                 ON sync_jobs (connection_id) WHERE status = 'running'"
                    .to_string(),
            ))
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(SyncLogs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(SyncLogs::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(SyncLogs::SyncJobId).uuid().not_null())
                    .col(ColumnDef::new(SyncLogs::TenantId).uuid().not_null())
                    .col(ColumnDef::new(SyncLogs::Level).text().not_null())
                    .col(ColumnDef::new(SyncLogs::Message).text().not_null())
                    .col(ColumnDef::new(SyncLogs::Data).json_binary().null())
                    .col(
                        ColumnDef::new(SyncLogs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sync_logs_sync_job_id")
                            .from(SyncLogs::Table, SyncLogs::SyncJobId)
                            .to(SyncJobs::Table, SyncJobs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_logs_job_created")
                    .table(SyncLogs::Table)
                    .col(SyncLogs::SyncJobId)
                    .col(SyncLogs::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SyncLogs::Table).to_owned())
            .await?;

        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "DROP INDEX IF EXISTS idx_sync_jobs_one_running_per_connection".to_string(),
            ))
            .await?;

        manager
            .drop_table(Table::drop().table(SyncJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncJobs {
    Table,
    Id,
    TenantId,
    ConnectionId,
    JobType,
    Domain,
    Status,
    TriggeredBy,
    CreatedBy,
    TotalItems,
    ProcessedItems,
    SucceededItems,
    FailedItems,
    SkippedItems,
    ProgressPercentage,
    Cursor,
    IdempotencyKey,
    Priority,
    RetryCount,
    MaxRetries,
    ParentJobId,
    TargetEntityId,
    ErrorMessage,
    StartedAt,
    CompletedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum SyncLogs {
    Table,
    Id,
    SyncJobId,
    TenantId,
    Level,
    Message,
    Data,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Tenants {
    Table,
    Id,
}

#[derive(DeriveIden)]
enum MarketplaceConnections {
    Table,
    Id,
}
