//! Inbound webhook deliveries and their processing state.

use std::fmt;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "webhook_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub connection_id: Uuid,
    pub marketplace_type: String,
    /// `{marketplace}-{event_id}`
    #[sea_orm(unique)]
    pub idempotency_key: String,
    pub event_id: String,
    pub event_type: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub version: Option<i64>,
    pub event_time: DateTimeWithTimeZone,
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: Option<JsonValue>,
    /// See [`WebhookOutcome`]; `pending` until first attempt
    pub status: String,
    pub processed: bool,
    pub retry_count: i32,
    pub max_retries: i32,
    pub processing_error: Option<String>,
    pub sync_job_id: Option<Uuid>,
    pub processed_at: Option<DateTimeWithTimeZone>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

pub const STATUS_PENDING: &str = "pending";

/// Terminal or retryable result of processing one webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// A sync job was created (or already existed) for the event
    Processed,
    /// Same version as already applied
    Duplicate,
    /// Older than the applied version; buffered for replay
    OutOfOrder,
    /// Event type the engine does not act on
    Ignored,
    /// Attempt failed and will be retried by the sweep
    Failed,
    /// Retries exhausted
    Dead,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::Processed => "processed",
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::OutOfOrder => "out_of_order",
            WebhookOutcome::Ignored => "ignored",
            WebhookOutcome::Failed => "failed",
            WebhookOutcome::Dead => "dead",
        }
    }

    /// Whether the row is finished and must not be retried.
    pub fn is_final(&self) -> bool {
        !matches!(self, WebhookOutcome::Failed)
    }
}

impl fmt::Display for WebhookOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
