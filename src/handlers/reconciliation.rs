//! # Reconciliation API Handlers

use axum::{
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::auth::{OperatorAuth, TenantExtension};
use crate::error::ApiError;
use crate::handlers::types::{PageQuery, parse_optional, parse_uuid};
use crate::models::discrepancy::{DiscrepancyInfo, DiscrepancyKind, ResolutionState};
use crate::models::reconciliation_job::{ReconciliationJobInfo, ReconciliationType};
use crate::reconciliation::{DiscrepancyFilter, ReconciliationRequest};
use crate::server::AppState;

/// Request body for starting a reconciliation run
#[derive(Debug, Deserialize, ToSchema)]
pub struct StartReconciliationBody {
    pub connection_id: Uuid,
    pub reconciliation_type: ReconciliationType,
    /// Record discrepancies only; defaults to true
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
    /// Converge internal state to the marketplace when not a dry run
    #[serde(default)]
    pub auto_repair: bool,
    /// Re-read marketplace inventory before comparing
    #[serde(default)]
    pub live_refresh: bool,
}

fn default_dry_run() -> bool {
    true
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct ResolutionBody {
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListReconciliationsQuery {
    /// Filter by connection ID (UUID)
    pub connection_id: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DiscrepancyQuery {
    /// QUANTITY_MISMATCH, MISSING or ORPHAN
    pub kind: Option<String>,
    /// unresolved, resolved, ignored or auto_fixed
    pub state: Option<String>,
}

/// Start a reconciliation run in the background
#[utoipa::path(
    post,
    path = "/api/v1/reconciliations",
    security(("bearer_auth" = [])),
    params(crate::handlers::TenantHeader),
    request_body = StartReconciliationBody,
    responses(
        (status = 202, description = "Run created and started", body = ReconciliationJobInfo),
        (status = 400, description = "Invalid request", body = ApiError),
        (status = 404, description = "Connection not found", body = ApiError)
    ),
    tag = "reconciliation"
)]
pub async fn start_reconciliation(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
    payload: Result<Json<StartReconciliationBody>, JsonRejection>,
) -> Result<(StatusCode, Json<ReconciliationJobInfo>), ApiError> {
    let Json(body) = payload?;

    let mut request = ReconciliationRequest::new(tenant.id(), body.connection_id, body.reconciliation_type);
    request.dry_run = body.dry_run;
    request.auto_repair = body.auto_repair;
    request.live_refresh = body.live_refresh;

    let job = state.reconciliation.start(request).await?;
    Ok((StatusCode::ACCEPTED, Json(job.into())))
}

/// List reconciliation runs, newest first
#[utoipa::path(
    get,
    path = "/api/v1/reconciliations",
    security(("bearer_auth" = [])),
    params(crate::handlers::TenantHeader, ListReconciliationsQuery),
    responses(
        (status = 200, description = "Reconciliation runs", body = [ReconciliationJobInfo]),
        (status = 400, description = "Invalid query parameters", body = ApiError)
    ),
    tag = "reconciliation"
)]
pub async fn list_reconciliations(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
    Query(params): Query<ListReconciliationsQuery>,
) -> Result<Json<Vec<ReconciliationJobInfo>>, ApiError> {
    let (limit, offset) = PageQuery {
        limit: params.limit,
        offset: params.offset,
    }
    .resolve()?;
    let connection_id = parse_uuid("connection_id", params.connection_id.as_deref())?;

    let jobs = state
        .reconciliation
        .list(tenant.id(), connection_id, Some(limit), Some(offset))
        .await?;
    Ok(Json(jobs.into_iter().map(ReconciliationJobInfo::from).collect()))
}

#[utoipa::path(
    get,
    path = "/api/v1/reconciliations/{job_id}",
    security(("bearer_auth" = [])),
    params(crate::handlers::TenantHeader, ("job_id" = Uuid, Path, description = "Reconciliation run id")),
    responses(
        (status = 200, description = "Reconciliation run", body = ReconciliationJobInfo),
        (status = 404, description = "Run not found", body = ApiError)
    ),
    tag = "reconciliation"
)]
pub async fn get_reconciliation(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
    Path(job_id): Path<Uuid>,
) -> Result<Json<ReconciliationJobInfo>, ApiError> {
    let job = state.reconciliation.get(tenant.id(), job_id).await?;
    Ok(Json(job.into()))
}

/// Discrepancies recorded by one run
#[utoipa::path(
    get,
    path = "/api/v1/reconciliations/{job_id}/discrepancies",
    security(("bearer_auth" = [])),
    params(
        crate::handlers::TenantHeader,
        ("job_id" = Uuid, Path, description = "Reconciliation run id"),
        DiscrepancyQuery
    ),
    responses(
        (status = 200, description = "Discrepancies", body = [DiscrepancyInfo]),
        (status = 400, description = "Invalid filter", body = ApiError),
        (status = 404, description = "Run not found", body = ApiError)
    ),
    tag = "reconciliation"
)]
pub async fn list_discrepancies(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
    Path(job_id): Path<Uuid>,
    Query(params): Query<DiscrepancyQuery>,
) -> Result<Json<Vec<DiscrepancyInfo>>, ApiError> {
    let filter = DiscrepancyFilter {
        kind: parse_optional::<DiscrepancyKind>(
            "kind",
            params.kind.as_deref(),
            "Must be one of: QUANTITY_MISMATCH, MISSING, ORPHAN",
        )?,
        state: parse_optional::<ResolutionState>(
            "state",
            params.state.as_deref(),
            "Must be one of: unresolved, resolved, ignored, auto_fixed",
        )?,
    };

    let discrepancies = state
        .reconciliation
        .discrepancies(tenant.id(), job_id, &filter)
        .await?;
    Ok(Json(discrepancies.into_iter().map(DiscrepancyInfo::from).collect()))
}

#[utoipa::path(
    post,
    path = "/api/v1/discrepancies/{discrepancy_id}/resolve",
    security(("bearer_auth" = [])),
    params(crate::handlers::TenantHeader, ("discrepancy_id" = Uuid, Path, description = "Discrepancy id")),
    request_body = ResolutionBody,
    responses(
        (status = 200, description = "Discrepancy resolved", body = DiscrepancyInfo),
        (status = 404, description = "Discrepancy not found", body = ApiError),
        (status = 409, description = "Discrepancy is no longer unresolved", body = ApiError)
    ),
    tag = "reconciliation"
)]
pub async fn resolve_discrepancy(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
    Path(discrepancy_id): Path<Uuid>,
    payload: Result<Json<ResolutionBody>, JsonRejection>,
) -> Result<Json<DiscrepancyInfo>, ApiError> {
    let Json(body) = payload?;
    let discrepancy = state
        .reconciliation
        .resolve_discrepancy(tenant.id(), discrepancy_id, body.note)
        .await?;
    Ok(Json(discrepancy.into()))
}

#[utoipa::path(
    post,
    path = "/api/v1/discrepancies/{discrepancy_id}/ignore",
    security(("bearer_auth" = [])),
    params(crate::handlers::TenantHeader, ("discrepancy_id" = Uuid, Path, description = "Discrepancy id")),
    request_body = ResolutionBody,
    responses(
        (status = 200, description = "Discrepancy ignored", body = DiscrepancyInfo),
        (status = 404, description = "Discrepancy not found", body = ApiError),
        (status = 409, description = "Discrepancy is no longer unresolved", body = ApiError)
    ),
    tag = "reconciliation"
)]
pub async fn ignore_discrepancy(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
    Path(discrepancy_id): Path<Uuid>,
    payload: Result<Json<ResolutionBody>, JsonRejection>,
) -> Result<Json<DiscrepancyInfo>, ApiError> {
    let Json(body) = payload?;
    let discrepancy = state
        .reconciliation
        .ignore_discrepancy(tenant.id(), discrepancy_id, body.note)
        .await?;
    Ok(Json(discrepancy.into()))
}
