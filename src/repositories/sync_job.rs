//! # SyncJob Repository
//!
//! Tenant-aware reads over `sync_jobs` and `sync_logs`, and the append-only
//! log writer used while jobs execute.

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::sync_job::{self, Column, Entity as SyncJob, JobStatus, SyncDomain};
use crate::models::sync_log::{self, Entity as SyncLog, LogLevel};

/// Filters for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub connection_id: Option<Uuid>,
    pub status: Option<JobStatus>,
    pub domain: Option<SyncDomain>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Job counts per status for one tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct JobCounts {
    pub total: i64,
    pub pending: i64,
    pub running: i64,
    pub paused: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

/// Repository for sync job database operations
#[derive(Debug, Clone)]
pub struct SyncJobRepository {
    db: DatabaseConnection,
}

impl SyncJobRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<sync_job::Model>, DbErr> {
        SyncJob::find()
            .filter(Column::IdempotencyKey.eq(key))
            .one(&self.db)
            .await
    }

    /// Find a sync job by ID, ensuring it belongs to the specified tenant
    pub async fn find_for_tenant(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
    ) -> Result<Option<sync_job::Model>, DbErr> {
        SyncJob::find_by_id(job_id)
            .filter(Column::TenantId.eq(tenant_id))
            .one(&self.db)
            .await
    }

    pub async fn running_for_connection(
        &self,
        connection_id: Uuid,
    ) -> Result<Option<sync_job::Model>, DbErr> {
        SyncJob::find()
            .filter(Column::ConnectionId.eq(connection_id))
            .filter(Column::Status.eq(JobStatus::Running.as_str()))
            .one(&self.db)
            .await
    }

    /// Newest first.
    pub async fn list(
        &self,
        tenant_id: Uuid,
        filter: &JobFilter,
    ) -> Result<Vec<sync_job::Model>, DbErr> {
        let mut query = SyncJob::find()
            .filter(Column::TenantId.eq(tenant_id))
            .order_by_desc(Column::CreatedAt);

        if let Some(connection_id) = filter.connection_id {
            query = query.filter(Column::ConnectionId.eq(connection_id));
        }
        if let Some(status) = filter.status {
            query = query.filter(Column::Status.eq(status.as_str()));
        }
        if let Some(domain) = filter.domain {
            query = query.filter(Column::Domain.eq(domain.as_str()));
        }

        query
            .offset(filter.offset.unwrap_or(0))
            .limit(filter.limit.unwrap_or(50).min(500))
            .all(&self.db)
            .await
    }

    pub async fn counts(&self, tenant_id: Uuid) -> Result<JobCounts, DbErr> {
        let rows: Vec<(String, i64)> = SyncJob::find()
            .select_only()
            .column(Column::Status)
            .column_as(Expr::col(Column::Id).count(), "count")
            .filter(Column::TenantId.eq(tenant_id))
            .group_by(Column::Status)
            .into_tuple()
            .all(&self.db)
            .await?;

        let mut counts = JobCounts::default();
        for (status, count) in rows {
            counts.total += count;
            match status.parse::<JobStatus>() {
                Ok(JobStatus::Pending) => counts.pending = count,
                Ok(JobStatus::Running) => counts.running = count,
                Ok(JobStatus::Paused) => counts.paused = count,
                Ok(JobStatus::Completed) => counts.completed = count,
                Ok(JobStatus::Failed) => counts.failed = count,
                Ok(JobStatus::Cancelled) => counts.cancelled = count,
                Err(_) => {}
            }
        }
        Ok(counts)
    }

    /// Log lines for a job, oldest first. Returns `None` if the job is not the tenant's.
    pub async fn logs(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
        limit: Option<u64>,
    ) -> Result<Option<Vec<sync_log::Model>>, DbErr> {
        if self.find_for_tenant(tenant_id, job_id).await?.is_none() {
            return Ok(None);
        }
        let logs = SyncLog::find()
            .filter(sync_log::Column::SyncJobId.eq(job_id))
            .order_by_asc(sync_log::Column::CreatedAt)
            .limit(limit.unwrap_or(200).min(1000))
            .all(&self.db)
            .await?;
        Ok(Some(logs))
    }

    pub async fn append_log(
        &self,
        job: &sync_job::Model,
        level: LogLevel,
        message: &str,
        data: Option<JsonValue>,
    ) -> Result<(), DbErr> {
        sync_log::ActiveModel {
            id: Set(Uuid::new_v4()),
            sync_job_id: Set(job.id),
            tenant_id: Set(job.tenant_id),
            level: Set(level.as_str().to_string()),
            message: Set(message.to_string()),
            data: Set(data),
            created_at: Set(Utc::now().fixed_offset()),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    /// Fails every job still marked running. Only safe before this process
    /// has started any job of its own.
    pub async fn fail_running_jobs(&self, message: &str) -> Result<u64, DbErr> {
        let now = Utc::now().fixed_offset();
        let result = SyncJob::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Failed.as_str()))
            .col_expr(Column::ErrorMessage, Expr::value(message))
            .col_expr(Column::CompletedAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Status.eq(JobStatus::Running.as_str()))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }
}
