//! Current stock snapshot per (tenant, offer, location).
//!
//! Rows are only written by the inventory ledger, together with a ledger
//! entry in the same transaction.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "inventory_current")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub offer_id: Uuid,
    pub location_id: Uuid,
    pub sku: Option<String>,
    pub quantity_on_hand: i64,
    pub quantity_reserved: i64,
    pub low_stock_threshold: i64,
    pub reorder_point: i64,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Never negative, even if reserved somehow exceeds on hand.
    pub fn available(&self) -> i64 {
        (self.quantity_on_hand - self.quantity_reserved).max(0)
    }

    pub fn is_low_stock(&self) -> bool {
        self.available() <= self.low_stock_threshold
    }

    pub fn needs_reorder(&self) -> bool {
        self.available() <= self.reorder_point
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::inventory_ledger::Entity")]
    Ledger,
}

impl Related<super::inventory_ledger::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Ledger.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// API view of a stock row.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InventoryLevelInfo {
    pub id: Uuid,
    pub offer_id: Uuid,
    pub location_id: Uuid,
    #[schema(example = "SKU-001")]
    pub sku: Option<String>,
    pub quantity_on_hand: i64,
    pub quantity_reserved: i64,
    pub quantity_available: i64,
    pub is_low_stock: bool,
    pub needs_reorder: bool,
    pub updated_at: String,
}

impl From<Model> for InventoryLevelInfo {
    fn from(model: Model) -> Self {
        Self {
            quantity_available: model.available(),
            is_low_stock: model.is_low_stock(),
            needs_reorder: model.needs_reorder(),
            id: model.id,
            offer_id: model.offer_id,
            location_id: model.location_id,
            sku: model.sku,
            quantity_on_hand: model.quantity_on_hand,
            quantity_reserved: model.quantity_reserved,
            updated_at: model.updated_at.to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn row(on_hand: i64, reserved: i64) -> Model {
        let now = Utc::now().into();
        Model {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            offer_id: Uuid::new_v4(),
            location_id: Uuid::new_v4(),
            sku: None,
            quantity_on_hand: on_hand,
            quantity_reserved: reserved,
            low_stock_threshold: 10,
            reorder_point: 20,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn available_is_floored_at_zero() {
        assert_eq!(row(5, 8).available(), 0);
        assert_eq!(row(50, 8).available(), 42);
    }

    #[test]
    fn low_stock_and_reorder_thresholds_are_inclusive() {
        let r = row(10, 0);
        assert!(r.is_low_stock());
        assert!(r.needs_reorder());

        let r = row(20, 0);
        assert!(!r.is_low_stock());
        assert!(r.needs_reorder());

        assert!(!row(21, 0).needs_reorder());
    }
}
