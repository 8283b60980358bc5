//! Reconciliation run with aggregate counters.

use std::fmt;
use std::str::FromStr;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "reconciliation_jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub connection_id: Uuid,
    /// See [`ReconciliationType`]
    pub reconciliation_type: String,
    /// `pending`, `running`, `completed` or `failed`
    pub status: String,
    pub dry_run: bool,
    pub auto_repair: bool,
    pub total_checked: i64,
    pub matched: i64,
    pub mismatched: i64,
    pub missing_internal: i64,
    pub missing_external: i64,
    pub repaired: i64,
    pub failed_repairs: i64,
    pub triggered_by: String,
    pub error_message: Option<String>,
    pub started_at: Option<DateTimeWithTimeZone>,
    pub completed_at: Option<DateTimeWithTimeZone>,
    pub created_at: DateTimeWithTimeZone,
}

impl Model {
    pub fn counts(&self) -> ReconciliationCounts {
        ReconciliationCounts {
            total_checked: self.total_checked,
            matched: self.matched,
            mismatched: self.mismatched,
            missing_internal: self.missing_internal,
            missing_external: self.missing_external,
            repaired: self.repaired,
            failed_repairs: self.failed_repairs,
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::discrepancy::Entity")]
    Discrepancy,
}

impl Related<super::discrepancy::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Discrepancy.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ReconciliationType {
    Inventory,
    Products,
    Orders,
    Full,
}

impl ReconciliationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationType::Inventory => "inventory",
            ReconciliationType::Products => "products",
            ReconciliationType::Orders => "orders",
            ReconciliationType::Full => "full",
        }
    }
}

impl fmt::Display for ReconciliationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReconciliationType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "inventory" => Ok(ReconciliationType::Inventory),
            "products" => Ok(ReconciliationType::Products),
            "orders" => Ok(ReconciliationType::Orders),
            "full" => Ok(ReconciliationType::Full),
            other => Err(format!("unknown reconciliation type: {other}")),
        }
    }
}

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_RUNNING: &str = "running";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";

/// Aggregate counters for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ReconciliationCounts {
    pub total_checked: i64,
    pub matched: i64,
    pub mismatched: i64,
    pub missing_internal: i64,
    pub missing_external: i64,
    pub repaired: i64,
    pub failed_repairs: i64,
}

impl ReconciliationCounts {
    pub fn merge(&mut self, other: &ReconciliationCounts) {
        self.total_checked += other.total_checked;
        self.matched += other.matched;
        self.mismatched += other.mismatched;
        self.missing_internal += other.missing_internal;
        self.missing_external += other.missing_external;
        self.repaired += other.repaired;
        self.failed_repairs += other.failed_repairs;
    }
}

/// API view of a reconciliation run.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReconciliationJobInfo {
    pub id: Uuid,
    pub connection_id: Uuid,
    #[schema(example = "inventory")]
    pub reconciliation_type: String,
    #[schema(example = "completed")]
    pub status: String,
    pub dry_run: bool,
    pub auto_repair: bool,
    pub counts: ReconciliationCounts,
    pub triggered_by: String,
    pub error_message: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
}

impl From<Model> for ReconciliationJobInfo {
    fn from(model: Model) -> Self {
        Self {
            counts: model.counts(),
            id: model.id,
            connection_id: model.connection_id,
            reconciliation_type: model.reconciliation_type,
            status: model.status,
            dry_run: model.dry_run,
            auto_repair: model.auto_repair,
            triggered_by: model.triggered_by,
            error_message: model.error_message,
            started_at: model.started_at.map(|dt| dt.to_rfc3339()),
            completed_at: model.completed_at.map(|dt| dt.to_rfc3339()),
            created_at: model.created_at.to_rfc3339(),
        }
    }
}
