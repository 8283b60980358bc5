//! Tenant entity model
//!
//! Every connection, job, ledger row and mapping is owned by exactly one tenant.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "tenants")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Display name for the tenant (optional)
    pub name: Option<String>,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::marketplace_connection::Entity")]
    MarketplaceConnection,
}

impl Related<super::marketplace_connection::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::MarketplaceConnection.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
