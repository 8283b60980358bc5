//! Creates reconciliation_jobs and reconciliation_discrepancies.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ReconciliationJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ReconciliationJobs::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ReconciliationJobs::TenantId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ReconciliationJobs::ConnectionId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ReconciliationJobs::ReconciliationType)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ReconciliationJobs::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(ReconciliationJobs::DryRun)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(ReconciliationJobs::AutoRepair)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(counter(ReconciliationJobs::TotalChecked))
                    .col(counter(ReconciliationJobs::Matched))
                    .col(counter(ReconciliationJobs::Mismatched))
                    .col(counter(ReconciliationJobs::MissingInternal))
                    .col(counter(ReconciliationJobs::MissingExternal))
                    .col(counter(ReconciliationJobs::Repaired))
                    .col(counter(ReconciliationJobs::FailedRepairs))
                    .col(
                        ColumnDef::new(ReconciliationJobs::TriggeredBy)
                            .text()
                            .not_null()
                            .default("manual"),
                    )
                    .col(
                        ColumnDef::new(ReconciliationJobs::ErrorMessage)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ReconciliationJobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ReconciliationJobs::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ReconciliationJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_reconciliation_jobs_connection_id")
                            .from(ReconciliationJobs::Table, ReconciliationJobs::ConnectionId)
                            .to(MarketplaceConnections::Table, MarketplaceConnections::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ReconciliationDiscrepancies::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ReconciliationDiscrepancies::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ReconciliationDiscrepancies::ReconciliationJobId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ReconciliationDiscrepancies::TenantId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ReconciliationDiscrepancies::ConnectionId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ReconciliationDiscrepancies::EntityType)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ReconciliationDiscrepancies::InternalId)
                            .uuid()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ReconciliationDiscrepancies::ExternalId)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ReconciliationDiscrepancies::Kind)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ReconciliationDiscrepancies::InternalValue)
                            .json_binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ReconciliationDiscrepancies::ExternalValue)
                            .json_binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ReconciliationDiscrepancies::ResolutionState)
                            .text()
                            .not_null()
                            .default("unresolved"),
                    )
                    .col(
                        ColumnDef::new(ReconciliationDiscrepancies::ResolutionNote)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ReconciliationDiscrepancies::ResolvedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ReconciliationDiscrepancies::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_reconciliation_discrepancies_job_id")
                            .from(
                                ReconciliationDiscrepancies::Table,
                                ReconciliationDiscrepancies::ReconciliationJobId,
                            )
                            .to(ReconciliationJobs::Table, ReconciliationJobs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_reconciliation_discrepancies_job_state")
                    .table(ReconciliationDiscrepancies::Table)
                    .col(ReconciliationDiscrepancies::ReconciliationJobId)
                    .col(ReconciliationDiscrepancies::ResolutionState)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(
                Table::drop()
                    .table(ReconciliationDiscrepancies::Table)
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(ReconciliationJobs::Table).to_owned())
            .await
    }
}

fn counter(column: ReconciliationJobs) -> ColumnDef {
    ColumnDef::new(column)
        .big_integer()
        .not_null()
        .default(0)
        .to_owned()
}

#[derive(DeriveIden, Clone, Copy)]
enum ReconciliationJobs {
    Table,
    Id,
    TenantId,
    ConnectionId,
    ReconciliationType,
    Status,
    DryRun,
    AutoRepair,
    TotalChecked,
    Matched,
    Mismatched,
    MissingInternal,
    MissingExternal,
    Repaired,
    FailedRepairs,
    TriggeredBy,
    ErrorMessage,
    StartedAt,
    CompletedAt,
    CreatedAt,
}

#[derive(DeriveIden)]
enum ReconciliationDiscrepancies {
    Table,
    Id,
    ReconciliationJobId,
    TenantId,
    ConnectionId,
    EntityType,
    InternalId,
    ExternalId,
    Kind,
    InternalValue,
    ExternalValue,
    ResolutionState,
    ResolutionNote,
    ResolvedAt,
    CreatedAt,
}

#[derive(DeriveIden)]
enum MarketplaceConnections {
    Table,
    Id,
}
