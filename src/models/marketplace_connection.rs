//! Marketplace connection entity model
//!
//! A connection is a tenant's authorization against one external store. The
//! orchestrator only runs jobs for connections in the `connected` state.

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
#[sea_orm(table_name = "marketplace_connections")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub tenant_id: Uuid,

    /// One of `amazon`, `shopify`, `dukaan`
    pub marketplace_type: String,

    /// One of `connected`, `disconnected`, `error`, `pending`
    pub status: String,

    pub display_name: Option<String>,

    /// Store identifier as sent by the marketplace in webhook headers
    pub external_store_id: String,

    /// Adapter credentials handed to `MarketplaceAdapter::initialize`
    #[sea_orm(column_type = "JsonBinary")]
    pub credentials: Option<JsonValue>,

    /// Shared secret for webhook signature verification
    pub webhook_secret: Option<String>,

    /// Location that marketplace-reported stock is booked against
    pub default_location_id: Option<Uuid>,

    /// Timestamp of the last successfully completed sync job
    pub last_sync_at: Option<DateTimeWithTimeZone>,

    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: Option<JsonValue>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Parsed marketplace type, if the stored value is recognised.
    pub fn marketplace(&self) -> Option<MarketplaceType> {
        self.marketplace_type.parse().ok()
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected.as_str()
    }

    /// Location used for inventory rows created from marketplace data.
    pub fn inventory_location(&self) -> Uuid {
        self.default_location_id.unwrap_or(self.id)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::tenant::Entity",
        from = "Column::TenantId",
        to = "super::tenant::Column::Id"
    )]
    Tenant,
}

impl Related<super::tenant::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tenant.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Supported external marketplaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum MarketplaceType {
    Amazon,
    Shopify,
    Dukaan,
}

impl MarketplaceType {
    pub const ALL: [MarketplaceType; 3] = [
        MarketplaceType::Amazon,
        MarketplaceType::Shopify,
        MarketplaceType::Dukaan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketplaceType::Amazon => "amazon",
            MarketplaceType::Shopify => "shopify",
            MarketplaceType::Dukaan => "dukaan",
        }
    }
}

impl fmt::Display for MarketplaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketplaceType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "amazon" => Ok(MarketplaceType::Amazon),
            "shopify" => Ok(MarketplaceType::Shopify),
            "dukaan" => Ok(MarketplaceType::Dukaan),
            other => Err(format!("unsupported marketplace: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
    Pending,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Pending => "pending",
        }
    }
}
