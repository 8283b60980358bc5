//! # Inventory API Handlers
//!
//! Thin wrappers over [`InventoryLedger`](crate::inventory::InventoryLedger).
//! Every mutation answers with the row after the change and the ledger entry
//! it appended.

use axum::{
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::{OperatorAuth, TenantExtension};
use crate::error::{ApiError, validation_error};
use crate::handlers::types::PageQuery;
use crate::inventory::{LedgerContext, LedgerMutation, NewInventory, SOURCE_MANUAL};
use crate::models::inventory_current::InventoryLevelInfo;
use crate::models::inventory_ledger::{LedgerEntryInfo, TransactionType};
use crate::server::AppState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateInventoryBody {
    pub offer_id: Uuid,
    pub location_id: Uuid,
    #[schema(example = "SKU-001")]
    pub sku: Option<String>,
    /// Booked as a RECEIVE entry when positive
    #[serde(default)]
    pub initial_quantity: i64,
    #[serde(default)]
    pub low_stock_threshold: i64,
    #[serde(default)]
    pub reorder_point: i64,
    pub created_by: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AdjustInventoryBody {
    /// Signed change to on-hand
    #[schema(example = -3)]
    pub delta: i64,
    /// RECEIVE or ADJUST; defaults to ADJUST
    pub transaction_type: Option<TransactionType>,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
    pub notes: Option<String>,
    pub created_by: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct QuantityBody {
    #[schema(example = 5)]
    pub quantity: i64,
    /// e.g. `order`
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
    pub notes: Option<String>,
    pub created_by: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LedgerMutationResponse {
    pub inventory: InventoryLevelInfo,
    pub entry: Option<LedgerEntryInfo>,
}

impl From<LedgerMutation> for LedgerMutationResponse {
    fn from(mutation: LedgerMutation) -> Self {
        Self {
            inventory: mutation.inventory.into(),
            entry: mutation.entry.map(LedgerEntryInfo::from),
        }
    }
}

fn context(
    reference_type: Option<String>,
    reference_id: Option<String>,
    notes: Option<String>,
    created_by: Option<String>,
) -> LedgerContext {
    LedgerContext {
        source: SOURCE_MANUAL.to_string(),
        reference_type,
        reference_id,
        notes,
        created_by,
    }
}

/// Create a stock row for an offer at a location
#[utoipa::path(
    post,
    path = "/api/v1/inventory",
    security(("bearer_auth" = [])),
    params(crate::handlers::TenantHeader),
    request_body = CreateInventoryBody,
    responses(
        (status = 201, description = "Inventory row created", body = LedgerMutationResponse),
        (status = 400, description = "Negative quantity or threshold", body = ApiError),
        (status = 409, description = "Row already exists for the offer and location", body = ApiError)
    ),
    tag = "inventory"
)]
pub async fn create_inventory(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
    payload: Result<Json<CreateInventoryBody>, JsonRejection>,
) -> Result<(StatusCode, Json<LedgerMutationResponse>), ApiError> {
    let Json(body) = payload?;
    let params = NewInventory {
        tenant_id: tenant.id(),
        offer_id: body.offer_id,
        location_id: body.location_id,
        sku: body.sku,
        initial_quantity: body.initial_quantity,
        low_stock_threshold: body.low_stock_threshold,
        reorder_point: body.reorder_point,
    };
    let mutation = state
        .ledger
        .create(params, context(None, None, None, body.created_by))
        .await?;
    Ok((StatusCode::CREATED, Json(mutation.into())))
}

#[utoipa::path(
    get,
    path = "/api/v1/inventory/{inventory_id}",
    security(("bearer_auth" = [])),
    params(crate::handlers::TenantHeader, ("inventory_id" = Uuid, Path, description = "Inventory row id")),
    responses(
        (status = 200, description = "Current stock level", body = InventoryLevelInfo),
        (status = 404, description = "Inventory row not found", body = ApiError)
    ),
    tag = "inventory"
)]
pub async fn get_inventory(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
    Path(inventory_id): Path<Uuid>,
) -> Result<Json<InventoryLevelInfo>, ApiError> {
    let row = state.ledger.get(tenant.id(), inventory_id).await?;
    Ok(Json(row.into()))
}

/// Apply a signed change to on-hand stock
#[utoipa::path(
    post,
    path = "/api/v1/inventory/{inventory_id}/adjust",
    security(("bearer_auth" = [])),
    params(crate::handlers::TenantHeader, ("inventory_id" = Uuid, Path, description = "Inventory row id")),
    request_body = AdjustInventoryBody,
    responses(
        (status = 200, description = "Adjustment applied", body = LedgerMutationResponse),
        (status = 400, description = "Zero delta or unsupported transaction type", body = ApiError),
        (status = 404, description = "Inventory row not found", body = ApiError)
    ),
    tag = "inventory"
)]
pub async fn adjust_inventory(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
    Path(inventory_id): Path<Uuid>,
    payload: Result<Json<AdjustInventoryBody>, JsonRejection>,
) -> Result<Json<LedgerMutationResponse>, ApiError> {
    let Json(body) = payload?;
    let transaction_type = body.transaction_type.unwrap_or(TransactionType::Adjust);
    if !matches!(transaction_type, TransactionType::Adjust | TransactionType::Receive) {
        return Err(validation_error(
            "Invalid transaction_type",
            serde_json::json!({ "transaction_type": "Must be one of: ADJUST, RECEIVE" }),
        ));
    }

    let ctx = context(body.reference_type, body.reference_id, body.notes, body.created_by);
    let mutation = state
        .ledger
        .adjust(tenant.id(), inventory_id, body.delta, transaction_type, ctx)
        .await?;
    Ok(Json(mutation.into()))
}

/// Reserve available stock
#[utoipa::path(
    post,
    path = "/api/v1/inventory/{inventory_id}/reserve",
    security(("bearer_auth" = [])),
    params(crate::handlers::TenantHeader, ("inventory_id" = Uuid, Path, description = "Inventory row id")),
    request_body = QuantityBody,
    responses(
        (status = 200, description = "Stock reserved", body = LedgerMutationResponse),
        (status = 400, description = "Non-positive quantity", body = ApiError),
        (status = 404, description = "Inventory row not found", body = ApiError),
        (status = 409, description = "Not enough available stock", body = ApiError)
    ),
    tag = "inventory"
)]
pub async fn reserve_inventory(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
    Path(inventory_id): Path<Uuid>,
    payload: Result<Json<QuantityBody>, JsonRejection>,
) -> Result<Json<LedgerMutationResponse>, ApiError> {
    let Json(body) = payload?;
    let ctx = context(body.reference_type, body.reference_id, body.notes, body.created_by);
    let mutation = state
        .ledger
        .reserve(tenant.id(), inventory_id, body.quantity, ctx)
        .await?;
    Ok(Json(mutation.into()))
}

/// Release previously reserved stock
#[utoipa::path(
    post,
    path = "/api/v1/inventory/{inventory_id}/release",
    security(("bearer_auth" = [])),
    params(crate::handlers::TenantHeader, ("inventory_id" = Uuid, Path, description = "Inventory row id")),
    request_body = QuantityBody,
    responses(
        (status = 200, description = "Reservation released", body = LedgerMutationResponse),
        (status = 400, description = "Non-positive quantity", body = ApiError),
        (status = 404, description = "Inventory row not found", body = ApiError)
    ),
    tag = "inventory"
)]
pub async fn release_inventory(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
    Path(inventory_id): Path<Uuid>,
    payload: Result<Json<QuantityBody>, JsonRejection>,
) -> Result<Json<LedgerMutationResponse>, ApiError> {
    let Json(body) = payload?;
    let ctx = context(body.reference_type, body.reference_id, body.notes, body.created_by);
    let mutation = state
        .ledger
        .release(tenant.id(), inventory_id, body.quantity, ctx)
        .await?;
    Ok(Json(mutation.into()))
}

/// Ledger entries for one row, in sequence order
#[utoipa::path(
    get,
    path = "/api/v1/inventory/{inventory_id}/ledger",
    security(("bearer_auth" = [])),
    params(
        crate::handlers::TenantHeader,
        ("inventory_id" = Uuid, Path, description = "Inventory row id"),
        PageQuery
    ),
    responses(
        (status = 200, description = "Ledger entries", body = [LedgerEntryInfo]),
        (status = 404, description = "Inventory row not found", body = ApiError)
    ),
    tag = "inventory"
)]
pub async fn list_ledger(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
    Path(inventory_id): Path<Uuid>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<LedgerEntryInfo>>, ApiError> {
    let (limit, offset) = page.resolve()?;
    let entries = state
        .ledger
        .list_ledger(tenant.id(), inventory_id, Some(limit), Some(offset))
        .await?;
    Ok(Json(entries.into_iter().map(LedgerEntryInfo::from).collect()))
}
