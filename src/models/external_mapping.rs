//! Link between an external marketplace entity and its canonical record.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "external_mappings")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub connection_id: Uuid,
    /// `product` or `order`
    pub entity_type: String,
    /// Canonical record id; for products this doubles as the offer id
    pub internal_id: Option<Uuid>,
    pub external_id: String,
    pub external_sku: Option<String>,
    #[sea_orm(column_type = "JsonBinary")]
    pub external_data: Option<JsonValue>,
    /// Marketplace-side update timestamp of the last applied snapshot
    pub external_updated_at: Option<DateTimeWithTimeZone>,
    pub last_synced_at: Option<DateTimeWithTimeZone>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::marketplace_connection::Entity",
        from = "Column::ConnectionId",
        to = "super::marketplace_connection::Column::Id"
    )]
    Connection,
}

impl Related<super::marketplace_connection::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Connection.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

pub const ENTITY_PRODUCT: &str = "product";
pub const ENTITY_ORDER: &str = "order";
