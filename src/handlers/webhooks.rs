//! # Webhook Handlers
//!
//! Public intake endpoint for marketplace webhooks plus an operator view of
//! stored deliveries. Intake answers as soon as the event is stored; the
//! processing outcome lands on the stored row.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::{OperatorAuth, TenantExtension};
use crate::error::{ApiError, validation_error};
use crate::models::marketplace_connection::MarketplaceType;
use crate::models::webhook_event;
use crate::server::AppState;
use crate::webhook_worker::{IngestResult, IngestStatus};

/// Stored webhook delivery and its processing state
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WebhookEventInfo {
    pub id: Uuid,
    pub connection_id: Uuid,
    #[schema(example = "shopify")]
    pub marketplace_type: String,
    pub event_id: String,
    #[schema(example = "products/update")]
    pub event_type: String,
    #[schema(example = "product")]
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub version: Option<i64>,
    /// pending, processed, duplicate, out_of_order, ignored, failed or dead
    #[schema(example = "processed")]
    pub status: String,
    pub processed: bool,
    pub retry_count: i32,
    pub max_retries: i32,
    pub processing_error: Option<String>,
    pub sync_job_id: Option<Uuid>,
    pub processed_at: Option<String>,
    pub created_at: String,
}

impl From<webhook_event::Model> for WebhookEventInfo {
    fn from(model: webhook_event::Model) -> Self {
        Self {
            id: model.id,
            connection_id: model.connection_id,
            marketplace_type: model.marketplace_type,
            event_id: model.event_id,
            event_type: model.event_type,
            resource_type: model.resource_type,
            resource_id: model.resource_id,
            version: model.version,
            status: model.status,
            processed: model.processed,
            retry_count: model.retry_count,
            max_retries: model.max_retries,
            processing_error: model.processing_error,
            sync_job_id: model.sync_job_id,
            processed_at: model.processed_at.map(|dt| dt.to_rfc3339()),
            created_at: model.created_at.to_rfc3339(),
        }
    }
}

/// Receive a marketplace webhook
///
/// The sending store is identified by its marketplace's store header
/// (`X-Shopify-Shop-Domain`, `X-Amz-Seller-Id` or `X-Store-Id`) and the body
/// must carry a valid HMAC-SHA256 signature for that connection's secret.
#[utoipa::path(
    post,
    path = "/webhooks/{marketplace}",
    params(("marketplace" = String, Path, description = "shopify, dukaan or amazon")),
    request_body(content = String, description = "Raw marketplace payload", content_type = "application/json"),
    responses(
        (status = 202, description = "Webhook stored and queued", body = IngestResult),
        (status = 200, description = "Duplicate delivery", body = IngestResult),
        (status = 400, description = "Missing header or unparseable payload", body = ApiError),
        (status = 401, description = "Signature verification failed", body = ApiError),
        (status = 404, description = "No connection for the store", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(marketplace): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<IngestResult>), ApiError> {
    let marketplace: MarketplaceType = marketplace.parse().map_err(|_| {
        validation_error(
            "Unsupported marketplace",
            serde_json::json!({ "marketplace": "Must be one of: shopify, dukaan, amazon" }),
        )
    })?;

    let result = state.webhooks.ingest(marketplace, &headers, &body).await?;
    let status = match result.status {
        IngestStatus::Duplicate => StatusCode::OK,
        IngestStatus::Queued | IngestStatus::Deferred => StatusCode::ACCEPTED,
    };
    Ok((status, Json(result)))
}

#[utoipa::path(
    get,
    path = "/api/v1/webhook-events/{event_id}",
    security(("bearer_auth" = [])),
    params(crate::handlers::TenantHeader, ("event_id" = Uuid, Path, description = "Stored webhook event id")),
    responses(
        (status = 200, description = "Stored webhook event", body = WebhookEventInfo),
        (status = 404, description = "Event not found", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn get_webhook_event(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
    Path(event_id): Path<Uuid>,
) -> Result<Json<WebhookEventInfo>, ApiError> {
    let event = state.webhooks.get(tenant.id(), event_id).await?;
    Ok(Json(event.into()))
}
