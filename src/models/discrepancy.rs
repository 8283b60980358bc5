//! A single difference between internal and external state found by reconciliation.

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
#[sea_orm(table_name = "reconciliation_discrepancies")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub reconciliation_job_id: Uuid,
    pub tenant_id: Uuid,
    pub connection_id: Uuid,
    pub entity_type: String,
    pub internal_id: Option<Uuid>,
    pub external_id: Option<String>,
    /// See [`DiscrepancyKind`]
    pub kind: String,
    #[sea_orm(column_type = "JsonBinary")]
    pub internal_value: Option<JsonValue>,
    #[sea_orm(column_type = "JsonBinary")]
    pub external_value: Option<JsonValue>,
    /// See [`ResolutionState`]
    pub resolution_state: String,
    pub resolution_note: Option<String>,
    pub resolved_at: Option<DateTimeWithTimeZone>,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::reconciliation_job::Entity",
        from = "Column::ReconciliationJobId",
        to = "super::reconciliation_job::Column::Id"
    )]
    ReconciliationJob,
}

impl Related<super::reconciliation_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ReconciliationJob.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscrepancyKind {
    QuantityMismatch,
    Missing,
    Orphan,
}

impl DiscrepancyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscrepancyKind::QuantityMismatch => "QUANTITY_MISMATCH",
            DiscrepancyKind::Missing => "MISSING",
            DiscrepancyKind::Orphan => "ORPHAN",
        }
    }
}

impl fmt::Display for DiscrepancyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiscrepancyKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "QUANTITY_MISMATCH" => Ok(DiscrepancyKind::QuantityMismatch),
            "MISSING" => Ok(DiscrepancyKind::Missing),
            "ORPHAN" => Ok(DiscrepancyKind::Orphan),
            other => Err(format!("unknown discrepancy kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionState {
    Unresolved,
    Resolved,
    Ignored,
    AutoFixed,
}

impl ResolutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionState::Unresolved => "unresolved",
            ResolutionState::Resolved => "resolved",
            ResolutionState::Ignored => "ignored",
            ResolutionState::AutoFixed => "auto_fixed",
        }
    }
}

impl FromStr for ResolutionState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "unresolved" => Ok(ResolutionState::Unresolved),
            "resolved" => Ok(ResolutionState::Resolved),
            "ignored" => Ok(ResolutionState::Ignored),
            "auto_fixed" => Ok(ResolutionState::AutoFixed),
            other => Err(format!("unknown resolution state: {other}")),
        }
    }
}

/// API view of a discrepancy.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DiscrepancyInfo {
    pub id: Uuid,
    pub reconciliation_job_id: Uuid,
    #[schema(example = "product")]
    pub entity_type: String,
    pub internal_id: Option<Uuid>,
    pub external_id: Option<String>,
    #[schema(example = "QUANTITY_MISMATCH")]
    pub kind: String,
    pub internal_value: Option<JsonValue>,
    pub external_value: Option<JsonValue>,
    #[schema(example = "unresolved")]
    pub resolution_state: String,
    pub resolution_note: Option<String>,
    pub resolved_at: Option<String>,
    pub created_at: String,
}

impl From<Model> for DiscrepancyInfo {
    fn from(model: Model) -> Self {
        Self {
            id: model.id,
            reconciliation_job_id: model.reconciliation_job_id,
            entity_type: model.entity_type,
            internal_id: model.internal_id,
            external_id: model.external_id,
            kind: model.kind,
            internal_value: model.internal_value,
            external_value: model.external_value,
            resolution_state: model.resolution_state,
            resolution_note: model.resolution_note,
            resolved_at: model.resolved_at.map(|dt| dt.to_rfc3339()),
            created_at: model.created_at.to_rfc3339(),
        }
    }
}
