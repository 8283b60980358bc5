//! Append-only inventory ledger entries.

use std::fmt;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "inventory_ledger")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub inventory_id: Uuid,
    /// Strictly increasing per inventory row
    pub sequence: i64,
    pub transaction_type: String,
    /// `on_hand` or `reserved`
    pub bucket: String,
    /// Delta actually applied to the bucket
    pub quantity_change: i64,
    /// Delta the caller asked for; differs from `quantity_change` when clamped
    pub requested_change: i64,
    pub quantity_before: i64,
    pub quantity_after: i64,
    pub source: String,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
    pub notes: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::inventory_current::Entity",
        from = "Column::InventoryId",
        to = "super::inventory_current::Column::Id"
    )]
    Inventory,
}

impl Related<super::inventory_current::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Inventory.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Receive,
    Adjust,
    Reserve,
    Release,
    Sync,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Receive => "RECEIVE",
            TransactionType::Adjust => "ADJUST",
            TransactionType::Reserve => "RESERVE",
            TransactionType::Release => "RELEASE",
            TransactionType::Sync => "SYNC",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    OnHand,
    Reserved,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::OnHand => "on_hand",
            Bucket::Reserved => "reserved",
        }
    }
}

/// API view of a ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LedgerEntryInfo {
    pub sequence: i64,
    #[schema(example = "ADJUST")]
    pub transaction_type: String,
    pub bucket: String,
    pub quantity_change: i64,
    pub requested_change: i64,
    pub quantity_before: i64,
    pub quantity_after: i64,
    pub source: String,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
    pub notes: Option<String>,
    pub created_at: String,
}

impl From<Model> for LedgerEntryInfo {
    fn from(model: Model) -> Self {
        Self {
            sequence: model.sequence,
            transaction_type: model.transaction_type,
            bucket: model.bucket,
            quantity_change: model.quantity_change,
            requested_change: model.requested_change,
            quantity_before: model.quantity_before,
            quantity_after: model.quantity_after,
            source: model.source,
            reference_type: model.reference_type,
            reference_id: model.reference_id,
            notes: model.notes,
            created_at: model.created_at.to_rfc3339(),
        }
    }
}
