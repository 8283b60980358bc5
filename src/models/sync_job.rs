//! SyncJob entity model
//!
//! A sync job is one run of the orchestrator against a connection. Progress is
//! stored as explicit counter columns; the resumption cursor is opaque JSON
//! shaped as [`JobCursor`].

use std::fmt;
use std::str::FromStr;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub tenant_id: Uuid,

    pub connection_id: Uuid,

    /// See [`JobType`]
    pub job_type: String,

    /// See [`SyncDomain`]
    pub domain: String,

    /// See [`JobStatus`]
    pub status: String,

    /// See [`TriggerSource`]
    pub triggered_by: String,

    pub created_by: Option<String>,

    pub total_items: i64,
    pub processed_items: i64,
    pub succeeded_items: i64,
    pub failed_items: i64,
    pub skipped_items: i64,
    pub progress_percentage: f64,

    #[sea_orm(column_type = "JsonBinary")]
    pub cursor: Option<JsonValue>,

    #[sea_orm(unique)]
    pub idempotency_key: String,

    pub priority: i16,

    pub retry_count: i32,

    pub max_retries: i32,

    /// Parent job for repair runs
    pub parent_job_id: Option<Uuid>,

    /// External id fetched by `fetch_entity` jobs
    pub target_entity_id: Option<String>,

    pub error_message: Option<String>,

    pub started_at: Option<DateTimeWithTimeZone>,

    pub completed_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    pub fn job_status(&self) -> Option<JobStatus> {
        self.status.parse().ok()
    }

    pub fn progress(&self) -> JobProgress {
        JobProgress {
            total: self.total_items,
            processed: self.processed_items,
            succeeded: self.succeeded_items,
            failed: self.failed_items,
            skipped: self.skipped_items,
        }
    }

    pub fn job_cursor(&self) -> Option<JobCursor> {
        self.cursor
            .clone()
            .and_then(|value| serde_json::from_value(value).ok())
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::marketplace_connection::Entity",
        from = "Column::ConnectionId",
        to = "super::marketplace_connection::Column::Id"
    )]
    Connection,
    #[sea_orm(has_many = "super::sync_log::Entity")]
    SyncLog,
}

impl Related<super::marketplace_connection::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Connection.def()
    }
}

impl Related<super::sync_log::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SyncLog.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Job lifecycle. `Completed`, `Failed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Allowed forward transitions; terminal states accept none.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Pending => matches!(
                next,
                JobStatus::Running | JobStatus::Cancelled | JobStatus::Failed
            ),
            JobStatus::Running => matches!(
                next,
                JobStatus::Paused | JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
            ),
            JobStatus::Paused => matches!(
                next,
                JobStatus::Running | JobStatus::Cancelled | JobStatus::Failed
            ),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    FullImport,
    DeltaSync,
    FetchEntity,
    Reconcile,
    Repair,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::FullImport => "full_import",
            JobType::DeltaSync => "delta_sync",
            JobType::FetchEntity => "fetch_entity",
            JobType::Reconcile => "reconcile",
            JobType::Repair => "repair",
        }
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "full_import" => Ok(JobType::FullImport),
            "delta_sync" => Ok(JobType::DeltaSync),
            "fetch_entity" => Ok(JobType::FetchEntity),
            "reconcile" => Ok(JobType::Reconcile),
            "repair" => Ok(JobType::Repair),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}

/// Data set a job synchronizes. `Full` runs the three concrete domains in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SyncDomain {
    Products,
    Orders,
    Inventory,
    Full,
}

impl SyncDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDomain::Products => "products",
            SyncDomain::Orders => "orders",
            SyncDomain::Inventory => "inventory",
            SyncDomain::Full => "full",
        }
    }

    /// Concrete domains executed for this domain, in order.
    pub fn phases(&self) -> &'static [SyncDomain] {
        match self {
            SyncDomain::Products => &[SyncDomain::Products],
            SyncDomain::Orders => &[SyncDomain::Orders],
            SyncDomain::Inventory => &[SyncDomain::Inventory],
            SyncDomain::Full => &[
                SyncDomain::Products,
                SyncDomain::Orders,
                SyncDomain::Inventory,
            ],
        }
    }
}

impl fmt::Display for SyncDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncDomain {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "products" => Ok(SyncDomain::Products),
            "orders" => Ok(SyncDomain::Orders),
            "inventory" => Ok(SyncDomain::Inventory),
            "full" => Ok(SyncDomain::Full),
            other => Err(format!("unknown sync domain: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Manual,
    Scheduled,
    Webhook,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Manual => "manual",
            TriggerSource::Scheduled => "scheduled",
            TriggerSource::Webhook => "webhook",
        }
    }
}

/// Progress counters for a job run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct JobProgress {
    pub total: i64,
    pub processed: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub skipped: i64,
}

impl JobProgress {
    pub fn percentage(&self) -> f64 {
        if self.total <= 0 {
            return 0.0;
        }
        ((self.processed as f64 / self.total as f64) * 100.0).min(100.0)
    }

    /// True when at least one item was attempted and none succeeded or were skipped.
    pub fn all_failed(&self) -> bool {
        self.processed > 0 && self.failed == self.processed
    }
}

/// Resumption point persisted on a job: the domain being paged and the
/// adapter's opaque page token within it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCursor {
    pub domain: SyncDomain,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}
