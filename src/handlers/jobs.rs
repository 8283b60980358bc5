//! # Jobs API Handlers
//!
//! Create, inspect, cancel and retry sync jobs.

use axum::{
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::auth::{OperatorAuth, TenantExtension};
use crate::error::ApiError;
use crate::handlers::types::{PageQuery, parse_optional, parse_uuid};
use crate::models::sync_job::{self, JobProgress, JobStatus, JobType, SyncDomain, TriggerSource};
use crate::models::sync_log;
use crate::orchestrator::{CreateJobRequest, OrchestratorStats};
use crate::repositories::JobFilter;
use crate::server::AppState;

/// Request body for creating a sync job
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateJobBody {
    pub connection_id: Uuid,
    pub job_type: JobType,
    pub domain: SyncDomain,
    /// Reuses the existing job when a job with this key exists
    pub idempotency_key: Option<String>,
    #[schema(example = 5)]
    pub priority: Option<i16>,
    /// External id to fetch; required for `fetch_entity`
    pub target_entity_id: Option<String>,
    pub created_by: Option<String>,
}

/// Job information response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobInfo {
    pub id: Uuid,
    pub connection_id: Uuid,
    #[schema(example = "delta_sync")]
    pub job_type: String,
    #[schema(example = "products")]
    pub domain: String,
    #[schema(example = "running")]
    pub status: String,
    #[schema(example = "manual")]
    pub triggered_by: String,
    pub created_by: Option<String>,
    pub progress: JobProgress,
    #[schema(example = 42.5)]
    pub progress_percentage: f64,
    pub cursor: Option<JsonValue>,
    pub idempotency_key: String,
    pub priority: i16,
    pub retry_count: i32,
    pub max_retries: i32,
    pub parent_job_id: Option<Uuid>,
    pub target_entity_id: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
}

impl From<sync_job::Model> for JobInfo {
    fn from(model: sync_job::Model) -> Self {
        Self {
            progress: model.progress(),
            id: model.id,
            connection_id: model.connection_id,
            job_type: model.job_type,
            domain: model.domain,
            status: model.status,
            triggered_by: model.triggered_by,
            created_by: model.created_by,
            progress_percentage: model.progress_percentage,
            cursor: model.cursor,
            idempotency_key: model.idempotency_key,
            priority: model.priority,
            retry_count: model.retry_count,
            max_retries: model.max_retries,
            parent_job_id: model.parent_job_id,
            target_entity_id: model.target_entity_id,
            error_message: model.error_message,
            started_at: model.started_at.map(|dt| dt.to_rfc3339()),
            completed_at: model.completed_at.map(|dt| dt.to_rfc3339()),
            created_at: model.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateJobResponse {
    pub job: JobInfo,
    /// False when an existing job was returned for the idempotency key
    pub created: bool,
}

/// Response payload for jobs listing endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobsResponse {
    pub jobs: Vec<JobInfo>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobLogInfo {
    pub id: Uuid,
    #[schema(example = "warn")]
    pub level: String,
    pub message: String,
    pub data: Option<JsonValue>,
    pub created_at: String,
}

impl From<sync_log::Model> for JobLogInfo {
    fn from(model: sync_log::Model) -> Self {
        Self {
            id: model.id,
            level: model.level,
            message: model.message,
            data: model.data,
            created_at: model.created_at.to_rfc3339(),
        }
    }
}

/// Query parameters for listing jobs
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListJobsQuery {
    /// Filter by status (pending, running, paused, completed, failed, cancelled)
    pub status: Option<String>,
    /// Filter by connection ID (UUID)
    pub connection_id: Option<String>,
    /// Filter by domain (products, orders, inventory, full)
    pub domain: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct LogsQuery {
    /// Maximum number of log lines (default 100, max 1000)
    pub limit: Option<u64>,
}

/// Create a sync job and start executing it
#[utoipa::path(
    post,
    path = "/api/v1/jobs",
    security(("bearer_auth" = [])),
    params(crate::handlers::TenantHeader),
    request_body = CreateJobBody,
    responses(
        (status = 201, description = "Job created and started", body = CreateJobResponse),
        (status = 200, description = "Existing job returned for the idempotency key", body = CreateJobResponse),
        (status = 400, description = "Invalid request", body = ApiError),
        (status = 404, description = "Connection not found", body = ApiError),
        (status = 409, description = "Connection already has a running job", body = ApiError),
        (status = 429, description = "Concurrency limit reached", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn create_job(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
    payload: Result<Json<CreateJobBody>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateJobResponse>), ApiError> {
    let Json(body) = payload?;

    let mut request = CreateJobRequest::new(tenant.id(), body.connection_id, body.job_type, body.domain);
    request.idempotency_key = body.idempotency_key.filter(|key| !key.trim().is_empty());
    request.priority = body.priority;
    request.target_entity_id = body.target_entity_id;
    request.triggered_by = TriggerSource::Manual;
    request.created_by = body.created_by;

    let created = state.orchestrator.create_job(request).await?;
    let status = if created.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(CreateJobResponse {
            job: created.job.into(),
            created: created.created,
        }),
    ))
}

/// List jobs for the tenant, newest first
#[utoipa::path(
    get,
    path = "/api/v1/jobs",
    security(("bearer_auth" = [])),
    params(crate::handlers::TenantHeader, ListJobsQuery),
    responses(
        (status = 200, description = "Jobs for the tenant", body = JobsResponse),
        (status = 400, description = "Invalid query parameters", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
    Query(params): Query<ListJobsQuery>,
) -> Result<Json<JobsResponse>, ApiError> {
    let (limit, offset) = PageQuery {
        limit: params.limit,
        offset: params.offset,
    }
    .resolve()?;

    let filter = JobFilter {
        status: parse_optional::<JobStatus>(
            "status",
            params.status.as_deref(),
            "Must be one of: pending, running, paused, completed, failed, cancelled",
        )?,
        connection_id: parse_uuid("connection_id", params.connection_id.as_deref())?,
        domain: parse_optional::<SyncDomain>(
            "domain",
            params.domain.as_deref(),
            "Must be one of: products, orders, inventory, full",
        )?,
        limit: Some(limit),
        offset: Some(offset),
    };

    let jobs = state.orchestrator.list_jobs(tenant.id(), &filter).await?;
    Ok(Json(JobsResponse {
        jobs: jobs.into_iter().map(JobInfo::from).collect(),
    }))
}

/// Get one job
#[utoipa::path(
    get,
    path = "/api/v1/jobs/{job_id}",
    security(("bearer_auth" = [])),
    params(crate::handlers::TenantHeader, ("job_id" = Uuid, Path, description = "Sync job id")),
    responses(
        (status = 200, description = "Job", body = JobInfo),
        (status = 404, description = "Job not found", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn get_job(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobInfo>, ApiError> {
    let job = state.orchestrator.get_job(tenant.id(), job_id).await?;
    Ok(Json(job.into()))
}

/// Log lines recorded while the job ran, oldest first
#[utoipa::path(
    get,
    path = "/api/v1/jobs/{job_id}/logs",
    security(("bearer_auth" = [])),
    params(
        crate::handlers::TenantHeader,
        ("job_id" = Uuid, Path, description = "Sync job id"),
        LogsQuery
    ),
    responses(
        (status = 200, description = "Job log lines", body = [JobLogInfo]),
        (status = 404, description = "Job not found", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn get_job_logs(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
    Path(job_id): Path<Uuid>,
    Query(params): Query<LogsQuery>,
) -> Result<Json<Vec<JobLogInfo>>, ApiError> {
    let limit = params.limit.unwrap_or(100).clamp(1, 1000);
    let logs = state
        .orchestrator
        .get_job_logs(tenant.id(), job_id, Some(limit))
        .await?;
    Ok(Json(logs.into_iter().map(JobLogInfo::from).collect()))
}

/// Cancel a pending or running job
#[utoipa::path(
    post,
    path = "/api/v1/jobs/{job_id}/cancel",
    security(("bearer_auth" = [])),
    params(crate::handlers::TenantHeader, ("job_id" = Uuid, Path, description = "Sync job id")),
    responses(
        (status = 200, description = "Job cancelled", body = JobInfo),
        (status = 404, description = "Job not found", body = ApiError),
        (status = 409, description = "Job already finished", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn cancel_job(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobInfo>, ApiError> {
    let job = state.orchestrator.cancel_job(tenant.id(), job_id).await?;
    Ok(Json(job.into()))
}

/// Start a repair job that resumes a finished job from its cursor
#[utoipa::path(
    post,
    path = "/api/v1/jobs/{job_id}/retry",
    security(("bearer_auth" = [])),
    params(crate::handlers::TenantHeader, ("job_id" = Uuid, Path, description = "Parent sync job id")),
    responses(
        (status = 201, description = "Repair job created", body = CreateJobResponse),
        (status = 200, description = "Existing repair job returned", body = CreateJobResponse),
        (status = 404, description = "Job not found", body = ApiError),
        (status = 409, description = "Job is still active or out of retries", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn retry_job(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
    Path(job_id): Path<Uuid>,
) -> Result<(StatusCode, Json<CreateJobResponse>), ApiError> {
    let created = state.orchestrator.retry_job(tenant.id(), job_id).await?;
    let status = if created.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(CreateJobResponse {
            job: created.job.into(),
            created: created.created,
        }),
    ))
}

/// Job counts plus limiter and breaker occupancy
#[utoipa::path(
    get,
    path = "/api/v1/jobs/stats",
    security(("bearer_auth" = [])),
    params(crate::handlers::TenantHeader),
    responses(
        (status = 200, description = "Orchestrator statistics", body = OrchestratorStats)
    ),
    tag = "jobs"
)]
pub async fn get_stats(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    tenant: TenantExtension,
) -> Result<Json<OrchestratorStats>, ApiError> {
    Ok(Json(state.orchestrator.get_stats(tenant.id()).await?))
}
