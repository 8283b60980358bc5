//! Events that arrived behind the stored version, buffered for replay.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "out_of_order_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub event_id: String,
    pub event_time: DateTimeWithTimeZone,
    pub version: Option<i64>,
    /// Stored version at the time the event was buffered
    pub expected_version: i64,
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: Option<JsonValue>,
    /// `pending` or `processed`
    pub status: String,
    /// `applied` or `superseded` once processed
    pub resolution: Option<String>,
    pub processed_at: Option<DateTimeWithTimeZone>,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_PROCESSED: &str = "processed";
pub const RESOLUTION_APPLIED: &str = "applied";
pub const RESOLUTION_SUPERSEDED: &str = "superseded";
