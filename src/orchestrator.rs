//! # Job Orchestrator
//!
//! Creates sync jobs, admits them through the [`ConcurrencyLimiter`], and runs
//! each one as its own task. A run pages through the marketplace adapter with
//! every call wrapped by the [`Retrier`] and the connection's circuit breaker,
//! processes items one at a time with partial-failure semantics, and persists
//! progress and the resumption cursor at a bounded cadence.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{Duration as ChronoDuration, Utc};
use metrics::{counter, gauge, histogram};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
};
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::adapters::{
    AdapterError, AdapterFactory, ExternalOrder, ExternalProduct, ListOptions, MarketplaceAdapter,
    OrderListOptions, SyncError,
};
use crate::concurrency::{AdmissionError, AdmissionPermit, ConcurrencyLimiter, LimiterStats};
use crate::config::{ConcurrencyConfig, SyncConfig};
use crate::inventory::{InventoryLedger, LedgerContext, SOURCE_MARKETPLACE_SYNC};
use crate::models::external_mapping::{ENTITY_ORDER, ENTITY_PRODUCT};
use crate::models::marketplace_connection::{self, MarketplaceType};
use crate::models::sync_job::{
    self, Entity as SyncJob, JobCursor, JobProgress, JobStatus, JobType, SyncDomain, TriggerSource,
};
use crate::models::sync_log::LogLevel;
use crate::repositories::{
    ConnectionRepository, JobCounts, JobFilter, MappingRepository, SyncJobRepository,
    UpsertOutcome,
};
use crate::resilience::{BreakerRegistry, CircuitBreaker, CircuitState, RetryError, Retrier};
use crate::schema_mapper::SchemaMapper;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("connection {0} not found")]
    ConnectionNotFound(Uuid),
    #[error("connection {0} is not in the connected state")]
    ConnectionNotConnected(Uuid),
    #[error("sync job {0} not found")]
    JobNotFound(Uuid),
    #[error("connection {connection_id} already has running job {job_id}")]
    JobAlreadyRunning { connection_id: Uuid, job_id: Uuid },
    #[error("idempotency key {0} is already used by another tenant")]
    IdempotencyConflict(String),
    #[error("invalid job request: {0}")]
    Validation(String),
    #[error("job {job_id} is {status} and cannot be {action}")]
    InvalidState {
        job_id: Uuid,
        status: String,
        action: &'static str,
    },
    #[error("job {job_id} reached its retry limit of {max_retries}")]
    RetryLimitReached { job_id: Uuid, max_retries: i32 },
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error("job store error: {0}")]
    Database(#[from] DbErr),
}

/// Caller-facing job creation request.
#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub tenant_id: Uuid,
    pub connection_id: Uuid,
    pub job_type: JobType,
    pub domain: SyncDomain,
    pub idempotency_key: Option<String>,
    pub priority: Option<i16>,
    /// Required for `fetch_entity` jobs
    pub target_entity_id: Option<String>,
    pub triggered_by: TriggerSource,
    pub created_by: Option<String>,
}

impl CreateJobRequest {
    pub fn new(tenant_id: Uuid, connection_id: Uuid, job_type: JobType, domain: SyncDomain) -> Self {
        Self {
            tenant_id,
            connection_id,
            job_type,
            domain,
            idempotency_key: None,
            priority: None,
            target_entity_id: None,
            triggered_by: TriggerSource::Manual,
            created_by: None,
        }
    }
}

/// Result of [`JobOrchestrator::create_job`].
#[derive(Debug, Clone)]
pub struct CreatedJob {
    pub job: sync_job::Model,
    /// False when the idempotency key matched an existing job
    pub created: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct OrchestratorStats {
    pub jobs: JobCounts,
    pub limiter: LimiterStats,
    /// Jobs executing in this process
    pub active_executions: usize,
    pub open_circuits: usize,
}

/// Fully resolved job row to insert.
struct NewJob {
    tenant_id: Uuid,
    connection_id: Uuid,
    job_type: JobType,
    domain: SyncDomain,
    idempotency_key: String,
    priority: i16,
    target_entity_id: Option<String>,
    triggered_by: TriggerSource,
    created_by: Option<String>,
    cursor: Option<JobCursor>,
    retry_count: i32,
    max_retries: i32,
    parent_job_id: Option<Uuid>,
}

struct Execution {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// Why a run stopped before finishing its phases.
#[derive(Debug)]
enum Stop {
    Cancelled,
    Failed(String),
}

/// Mutable state of one executing job.
struct JobRun {
    job: sync_job::Model,
    connection: marketplace_connection::Model,
    marketplace: MarketplaceType,
    adapter: Arc<dyn MarketplaceAdapter>,
    breaker: Arc<CircuitBreaker>,
    token: CancellationToken,
    progress: JobProgress,
    cursor: Option<JobCursor>,
    unflushed: u32,
}

struct OrchestratorInner {
    db: DatabaseConnection,
    jobs: SyncJobRepository,
    connections: ConnectionRepository,
    mappings: MappingRepository,
    ledger: InventoryLedger,
    factory: AdapterFactory,
    mapper: Arc<dyn SchemaMapper>,
    limiter: ConcurrencyLimiter,
    retrier: Retrier,
    breakers: Arc<BreakerRegistry>,
    sync: SyncConfig,
    concurrency: ConcurrencyConfig,
    executions: Mutex<HashMap<Uuid, Execution>>,
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<OrchestratorInner>,
}

/// Collaborators the orchestrator needs.
pub struct OrchestratorDeps {
    pub db: DatabaseConnection,
    pub factory: AdapterFactory,
    pub mapper: Arc<dyn SchemaMapper>,
    pub limiter: ConcurrencyLimiter,
    pub retrier: Retrier,
    pub breakers: Arc<BreakerRegistry>,
    pub ledger: InventoryLedger,
    pub sync: SyncConfig,
    pub concurrency: ConcurrencyConfig,
}

impl JobOrchestrator {
    pub fn new(deps: OrchestratorDeps) -> Self {
        let OrchestratorDeps {
            db,
            factory,
            mapper,
            limiter,
            retrier,
            breakers,
            ledger,
            sync,
            concurrency,
        } = deps;
        Self {
            inner: Arc::new(OrchestratorInner {
                jobs: SyncJobRepository::new(db.clone()),
                connections: ConnectionRepository::new(db.clone()),
                mappings: MappingRepository::new(db.clone()),
                db,
                ledger,
                factory,
                mapper,
                limiter,
                retrier,
                breakers,
                sync,
                concurrency,
                executions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.inner.limiter
    }

    /// Creates a job and starts executing it, or returns the existing job
    /// when the idempotency key was already used.
    #[instrument(skip(self, request), fields(tenant_id = %request.tenant_id, connection_id = %request.connection_id, domain = %request.domain))]
    pub async fn create_job(&self, request: CreateJobRequest) -> Result<CreatedJob, OrchestratorError> {
        match request.job_type {
            JobType::Reconcile => {
                return Err(OrchestratorError::Validation(
                    "reconcile jobs are created through the reconciliation engine".into(),
                ));
            }
            JobType::Repair => {
                return Err(OrchestratorError::Validation(
                    "repair jobs are created by retrying a failed job".into(),
                ));
            }
            JobType::FetchEntity => {
                if request
                    .target_entity_id
                    .as_deref()
                    .is_none_or(|id| id.trim().is_empty())
                {
                    return Err(OrchestratorError::Validation(
                        "fetch_entity jobs require target_entity_id".into(),
                    ));
                }
                if !matches!(request.domain, SyncDomain::Products | SyncDomain::Orders) {
                    return Err(OrchestratorError::Validation(
                        "fetch_entity supports the products and orders domains".into(),
                    ));
                }
            }
            JobType::FullImport | JobType::DeltaSync => {}
        }

        let idempotency_key = match request.idempotency_key {
            Some(key) if !key.trim().is_empty() => key,
            Some(_) => {
                return Err(OrchestratorError::Validation(
                    "idempotency_key must not be blank".into(),
                ));
            }
            None => format!(
                "{}-{}-{}-{}",
                request.tenant_id,
                request.connection_id,
                request.domain,
                Utc::now().timestamp()
            ),
        };

        self.submit(NewJob {
            tenant_id: request.tenant_id,
            connection_id: request.connection_id,
            job_type: request.job_type,
            domain: request.domain,
            idempotency_key,
            priority: request.priority.unwrap_or(self.inner.sync.default_priority),
            target_entity_id: request.target_entity_id,
            triggered_by: request.triggered_by,
            created_by: request.created_by,
            cursor: None,
            retry_count: 0,
            max_retries: self.inner.sync.default_max_retries,
            parent_job_id: None,
        })
        .await
    }

    /// Creates a `repair` child of a failed or cancelled job that resumes from
    /// the parent's cursor.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %job_id))]
    pub async fn retry_job(&self, tenant_id: Uuid, job_id: Uuid) -> Result<CreatedJob, OrchestratorError> {
        let parent = self.get_job(tenant_id, job_id).await?;
        let status = parent.job_status();
        if !matches!(status, Some(JobStatus::Failed) | Some(JobStatus::Cancelled)) {
            return Err(OrchestratorError::InvalidState {
                job_id,
                status: parent.status.clone(),
                action: "retried",
            });
        }
        if parent.retry_count >= parent.max_retries {
            return Err(OrchestratorError::RetryLimitReached {
                job_id,
                max_retries: parent.max_retries,
            });
        }

        let domain = parent
            .domain
            .parse::<SyncDomain>()
            .map_err(OrchestratorError::Validation)?;
        let retry_count = parent.retry_count + 1;

        self.submit(NewJob {
            tenant_id,
            connection_id: parent.connection_id,
            job_type: JobType::Repair,
            domain,
            idempotency_key: format!("retry-{}-{}", parent.id, retry_count),
            priority: parent.priority,
            target_entity_id: parent.target_entity_id.clone(),
            triggered_by: TriggerSource::Manual,
            created_by: parent.created_by.clone(),
            cursor: parent.job_cursor(),
            retry_count,
            max_retries: parent.max_retries,
            parent_job_id: Some(parent.id),
        })
        .await
    }

    async fn submit(&self, new_job: NewJob) -> Result<CreatedJob, OrchestratorError> {
        let inner = &self.inner;

        if let Some(existing) = inner.jobs.find_by_idempotency_key(&new_job.idempotency_key).await? {
            return Self::existing_job(existing, new_job.tenant_id);
        }

        let connection = inner
            .connections
            .find_for_tenant(new_job.tenant_id, new_job.connection_id)
            .await?
            .ok_or(OrchestratorError::ConnectionNotFound(new_job.connection_id))?;
        if !connection.is_connected() {
            return Err(OrchestratorError::ConnectionNotConnected(connection.id));
        }
        let marketplace = connection.marketplace().ok_or_else(|| {
            OrchestratorError::Validation(format!(
                "connection has unsupported marketplace {}",
                connection.marketplace_type
            ))
        })?;
        if !inner.factory.supports(marketplace) {
            return Err(OrchestratorError::Validation(format!(
                "no adapter registered for {marketplace}"
            )));
        }

        if let Some(running) = inner.jobs.running_for_connection(connection.id).await? {
            // A concurrent submission with the same key got there first.
            if running.idempotency_key == new_job.idempotency_key {
                return Self::existing_job(running, new_job.tenant_id);
            }
            return Err(OrchestratorError::JobAlreadyRunning {
                connection_id: connection.id,
                job_id: running.id,
            });
        }

        let permit = match new_job.triggered_by {
            TriggerSource::Manual => {
                if !inner.limiter.can_accept_job(new_job.tenant_id, connection.id) {
                    debug!("limiter at capacity; queueing for admission");
                }
                inner.limiter.acquire(new_job.tenant_id, connection.id).await?
            }
            TriggerSource::Scheduled | TriggerSource::Webhook => {
                inner.limiter.try_acquire(new_job.tenant_id, connection.id)?
            }
        };

        let job = match self.insert_running(&new_job).await {
            Ok(job) => job,
            Err(err) if crate::error::is_unique_violation(&err) => {
                drop(permit);
                if let Some(existing) =
                    inner.jobs.find_by_idempotency_key(&new_job.idempotency_key).await?
                {
                    return Self::existing_job(existing, new_job.tenant_id);
                }
                let running = inner.jobs.running_for_connection(connection.id).await?;
                return Err(OrchestratorError::JobAlreadyRunning {
                    connection_id: connection.id,
                    job_id: running.map(|job| job.id).unwrap_or_default(),
                });
            }
            Err(err) => return Err(err.into()),
        };

        counter!("sync_jobs_created_total", "type" => new_job.job_type.as_str()).increment(1);
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            triggered_by = %job.triggered_by,
            "sync job created"
        );

        self.spawn_execution(job.clone(), connection, marketplace, permit);
        Ok(CreatedJob { job, created: true })
    }

    fn existing_job(existing: sync_job::Model, tenant_id: Uuid) -> Result<CreatedJob, OrchestratorError> {
        if existing.tenant_id != tenant_id {
            return Err(OrchestratorError::IdempotencyConflict(existing.idempotency_key));
        }
        debug!(job_id = %existing.id, "idempotency key matched existing job");
        Ok(CreatedJob {
            job: existing,
            created: false,
        })
    }

    async fn insert_running(&self, new_job: &NewJob) -> Result<sync_job::Model, DbErr> {
        let now = Utc::now().fixed_offset();
        let cursor = match &new_job.cursor {
            Some(cursor) => Some(serde_json::to_value(cursor).map_err(|e| DbErr::Custom(e.to_string()))?),
            None => None,
        };
        sync_job::ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(new_job.tenant_id),
            connection_id: Set(new_job.connection_id),
            job_type: Set(new_job.job_type.as_str().to_string()),
            domain: Set(new_job.domain.as_str().to_string()),
            status: Set(JobStatus::Running.as_str().to_string()),
            triggered_by: Set(new_job.triggered_by.as_str().to_string()),
            created_by: Set(new_job.created_by.clone()),
            total_items: Set(0),
            processed_items: Set(0),
            succeeded_items: Set(0),
            failed_items: Set(0),
            skipped_items: Set(0),
            progress_percentage: Set(0.0),
            cursor: Set(cursor),
            idempotency_key: Set(new_job.idempotency_key.clone()),
            priority: Set(new_job.priority),
            retry_count: Set(new_job.retry_count),
            max_retries: Set(new_job.max_retries),
            parent_job_id: Set(new_job.parent_job_id),
            target_entity_id: Set(new_job.target_entity_id.clone()),
            error_message: Set(None),
            started_at: Set(Some(now)),
            completed_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&self.inner.db)
        .await
    }

    fn spawn_execution(
        &self,
        job: sync_job::Model,
        connection: marketplace_connection::Model,
        marketplace: MarketplaceType,
        permit: AdmissionPermit,
    ) {
        let token = CancellationToken::new();
        let job_id = job.id;
        self.executions().insert(
            job_id,
            Execution {
                token: token.clone(),
                handle: None,
            },
        );

        let span = info_span!(
            "sync_job",
            job_id = %job.id,
            tenant_id = %job.tenant_id,
            connection_id = %job.connection_id
        );
        let this = self.clone();
        let handle = tokio::spawn(
            async move {
                this.execute(job, connection, marketplace, token).await;
                drop(permit);
                this.executions().remove(&job_id);
                gauge!("sync_jobs_executing").set(this.executions().len() as f64);
            }
            .instrument(span),
        );

        if let Some(execution) = self.executions().get_mut(&job_id) {
            execution.handle = Some(handle);
        }
        gauge!("sync_jobs_executing").set(self.executions().len() as f64);
    }

    fn executions(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Execution>> {
        self.inner
            .executions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    async fn execute(
        &self,
        job: sync_job::Model,
        connection: marketplace_connection::Model,
        marketplace: MarketplaceType,
        token: CancellationToken,
    ) {
        let started = std::time::Instant::now();
        let credentials = connection.credentials.clone().unwrap_or_else(|| json!({}));

        let adapter = match self.inner.factory.create(marketplace, &credentials).await {
            Ok(adapter) => adapter,
            Err(err) => {
                let message = format!("adapter initialization failed: {err}");
                self.log(&job, LogLevel::Error, &message, None).await;
                self.finish(&job, &JobProgress::default(), None, JobStatus::Failed, Some(message))
                    .await;
                return;
            }
        };

        let mut run = JobRun {
            cursor: job.job_cursor(),
            breaker: self.inner.breakers.for_connection(connection.id),
            job,
            connection,
            marketplace,
            adapter,
            token,
            progress: JobProgress::default(),
            unflushed: 0,
        };

        self.log(
            &run.job,
            LogLevel::Info,
            "job started",
            Some(json!({
                "job_type": run.job.job_type,
                "domain": run.job.domain,
                "resume_cursor": run.job.cursor,
            })),
        )
        .await;

        let job_timeout = self.inner.concurrency.job_timeout();
        let outcome = match tokio::time::timeout(job_timeout, self.run_phases(&mut run)).await {
            Ok(result) => result,
            Err(_) => Err(Stop::Failed(format!(
                "job exceeded timeout of {}s",
                job_timeout.as_secs()
            ))),
        };

        let (status, message) = match outcome {
            Ok(()) if run.progress.all_failed() => (
                JobStatus::Failed,
                Some(format!("all {} items failed", run.progress.failed)),
            ),
            Ok(()) => (JobStatus::Completed, None),
            Err(Stop::Cancelled) => (JobStatus::Cancelled, None),
            Err(Stop::Failed(message)) => (JobStatus::Failed, Some(message)),
        };

        match &message {
            Some(message) => self.log(&run.job, LogLevel::Error, message, None).await,
            None => {
                self.log(
                    &run.job,
                    LogLevel::Info,
                    &format!("job {status}"),
                    serde_json::to_value(run.progress).ok(),
                )
                .await
            }
        }

        let completed = self
            .finish(&run.job, &run.progress, run.cursor.as_ref(), status, message)
            .await;

        if completed && status == JobStatus::Completed {
            if let Err(err) = self
                .inner
                .connections
                .mark_synced(run.connection.id, Utc::now())
                .await
            {
                warn!(error = %err, "failed to record connection sync time");
            }
        }

        histogram!("sync_job_duration_seconds", "status" => status.as_str())
            .record(started.elapsed().as_secs_f64());
        counter!("sync_jobs_finished_total", "status" => status.as_str()).increment(1);
        info!(
            status = %status,
            processed = run.progress.processed,
            succeeded = run.progress.succeeded,
            failed = run.progress.failed,
            skipped = run.progress.skipped,
            "sync job finished"
        );
    }

    async fn run_phases(&self, run: &mut JobRun) -> Result<(), Stop> {
        let job_type = run
            .job
            .job_type
            .parse::<JobType>()
            .map_err(Stop::Failed)?;
        let domain = run.job.domain.parse::<SyncDomain>().map_err(Stop::Failed)?;

        if job_type == JobType::FetchEntity {
            return self.fetch_entity(run, domain).await;
        }

        let phases = domain.phases();
        let resume = run.cursor.clone();
        let start = resume
            .as_ref()
            .and_then(|cursor| phases.iter().position(|phase| *phase == cursor.domain))
            .unwrap_or(0);

        for (index, phase) in phases.iter().enumerate().skip(start) {
            let page_token = if index == start {
                resume.as_ref().and_then(|cursor| cursor.token.clone())
            } else {
                None
            };

            self.log(
                &run.job,
                LogLevel::Info,
                &format!("syncing {phase}"),
                page_token.as_ref().map(|token| json!({ "resume_from": token })),
            )
            .await;

            match phase {
                SyncDomain::Products => self.sync_products(run, job_type, page_token).await?,
                SyncDomain::Orders => self.sync_orders(run, job_type, page_token).await?,
                SyncDomain::Inventory => self.sync_inventory(run).await?,
                SyncDomain::Full => {}
            }

            if let Some(next) = phases.get(index + 1) {
                run.cursor = Some(JobCursor {
                    domain: *next,
                    token: None,
                });
                self.flush(run).await;
            }
        }
        Ok(())
    }

    async fn sync_products(
        &self,
        run: &mut JobRun,
        job_type: JobType,
        mut page_token: Option<String>,
    ) -> Result<(), Stop> {
        let updated_after = match job_type {
            JobType::DeltaSync => run.connection.last_sync_at.map(|t| t.with_timezone(&Utc)),
            _ => None,
        };
        let base = run.progress.processed;

        loop {
            if run.token.is_cancelled() {
                return Err(Stop::Cancelled);
            }

            let options = ListOptions {
                limit: self.inner.sync.page_size,
                cursor: page_token.clone(),
                updated_after,
                status: None,
            };
            let adapter = run.adapter.clone();
            let adapter_ref: &dyn MarketplaceAdapter = adapter.as_ref();
            let options_ref = &options;
            let page = self
                .call(&run.token, &run.breaker, move || adapter_ref.get_products(options_ref))
                .await?;

            grow_total(&mut run.progress, base, page.total, page.items.len());
            for product in &page.items {
                self.process_product(run, product).await;
            }

            run.cursor = Some(JobCursor {
                domain: SyncDomain::Products,
                token: page.next_cursor.clone(),
            });
            self.flush(run).await;

            match page.next_cursor {
                Some(next) if page.has_more => page_token = Some(next),
                _ => return Ok(()),
            }
        }
    }

    async fn sync_orders(
        &self,
        run: &mut JobRun,
        job_type: JobType,
        mut page_token: Option<String>,
    ) -> Result<(), Stop> {
        let mut updated_after = None;
        let mut created_after = None;
        if job_type == JobType::DeltaSync {
            match run.connection.last_sync_at {
                Some(last) => updated_after = Some(last.with_timezone(&Utc)),
                None => {
                    created_after = Some(
                        Utc::now() - ChronoDuration::days(self.inner.sync.order_lookback_days),
                    )
                }
            }
        }
        let base = run.progress.processed;

        loop {
            if run.token.is_cancelled() {
                return Err(Stop::Cancelled);
            }

            let options = OrderListOptions {
                limit: self.inner.sync.page_size,
                cursor: page_token.clone(),
                created_after,
                updated_after,
                ..Default::default()
            };
            let adapter = run.adapter.clone();
            let adapter_ref: &dyn MarketplaceAdapter = adapter.as_ref();
            let options_ref = &options;
            let page = self
                .call(&run.token, &run.breaker, move || adapter_ref.get_orders(options_ref))
                .await?;

            grow_total(&mut run.progress, base, page.total, page.items.len());
            for order in &page.items {
                self.process_order(run, order).await;
            }

            run.cursor = Some(JobCursor {
                domain: SyncDomain::Orders,
                token: page.next_cursor.clone(),
            });
            self.flush(run).await;

            match page.next_cursor {
                Some(next) if page.has_more => page_token = Some(next),
                _ => return Ok(()),
            }
        }
    }

    /// Pulls stock levels for every mapped SKU and books them into the ledger.
    async fn sync_inventory(&self, run: &mut JobRun) -> Result<(), Stop> {
        let mappings = self
            .inner
            .mappings
            .list_for_connection(run.job.tenant_id, run.job.connection_id, ENTITY_PRODUCT)
            .await
            .map_err(|err| Stop::Failed(format!("failed to load product mappings: {err}")))?;

        run.progress.total += mappings.len() as i64;
        let (candidates, unmapped): (Vec<_>, Vec<_>) = mappings
            .into_iter()
            .partition(|m| m.internal_id.is_some() && m.external_sku.as_deref().is_some_and(|s| !s.is_empty()));
        for mapping in &unmapped {
            debug!(external_id = %mapping.external_id, "skipping mapping without sku");
            self.count_item(run, Ok(UpsertOutcome::Skipped), ENTITY_PRODUCT, &mapping.external_id)
                .await;
        }

        let location_id = run.connection.inventory_location();
        for chunk in candidates.chunks(self.inner.sync.inventory_batch_size.max(1)) {
            if run.token.is_cancelled() {
                return Err(Stop::Cancelled);
            }

            let skus: Vec<String> = chunk
                .iter()
                .filter_map(|m| m.external_sku.clone())
                .collect();
            let adapter = run.adapter.clone();
            let adapter_ref: &dyn MarketplaceAdapter = adapter.as_ref();
            let skus_ref = skus.as_slice();
            let levels = self
                .call(&run.token, &run.breaker, move || adapter_ref.get_inventory(skus_ref))
                .await?;

            for mapping in chunk {
                let (Some(offer_id), Some(sku)) = (mapping.internal_id, mapping.external_sku.as_deref()) else {
                    continue;
                };
                let Some(level) = levels.get(sku) else {
                    self.count_item(run, Ok(UpsertOutcome::Skipped), ENTITY_PRODUCT, &mapping.external_id)
                        .await;
                    continue;
                };

                let result = async {
                    let row = self
                        .inner
                        .ledger
                        .ensure_row(run.job.tenant_id, offer_id, location_id, Some(sku.to_string()))
                        .await?;
                    let mutation = self
                        .inner
                        .ledger
                        .sync_from_marketplace(
                            run.job.tenant_id,
                            row.id,
                            level.quantity,
                            LedgerContext::new(SOURCE_MARKETPLACE_SYNC)
                                .with_reference("sync_job", run.job.id.to_string()),
                        )
                        .await?;
                    self.inner
                        .mappings
                        .update_snapshot_quantity(mapping, level.quantity)
                        .await?;
                    Ok::<_, anyhow::Error>(if mutation.entry.is_some() {
                        UpsertOutcome::Updated
                    } else {
                        UpsertOutcome::Skipped
                    })
                }
                .await
                .map_err(|err| err.to_string());

                self.count_item(run, result, ENTITY_PRODUCT, &mapping.external_id).await;
            }

            run.cursor = Some(JobCursor {
                domain: SyncDomain::Inventory,
                token: None,
            });
            self.flush(run).await;
        }
        Ok(())
    }

    async fn fetch_entity(&self, run: &mut JobRun, domain: SyncDomain) -> Result<(), Stop> {
        let target = run
            .job
            .target_entity_id
            .clone()
            .ok_or_else(|| Stop::Failed("fetch_entity job has no target_entity_id".into()))?;
        run.progress.total = 1;

        let adapter = run.adapter.clone();
        let adapter_ref: &dyn MarketplaceAdapter = adapter.as_ref();
        let target_ref = target.as_str();
        match domain {
            SyncDomain::Products => {
                let product = self
                    .call(&run.token, &run.breaker, move || adapter_ref.get_product(target_ref))
                    .await?;
                self.process_product(run, &product).await;
            }
            SyncDomain::Orders => {
                let order = self
                    .call(&run.token, &run.breaker, move || adapter_ref.get_order(target_ref))
                    .await?;
                self.process_order(run, &order).await;
            }
            other => {
                return Err(Stop::Failed(format!(
                    "fetch_entity does not support the {other} domain"
                )));
            }
        }
        self.flush(run).await;
        Ok(())
    }

    async fn process_product(&self, run: &mut JobRun, product: &ExternalProduct) {
        let outcome = match self.inner.mapper.map_product(run.marketplace, product) {
            Ok(entity) => self
                .inner
                .mappings
                .upsert_entity(run.job.tenant_id, run.job.connection_id, &entity)
                .await
                .map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };
        self.count_item(run, outcome, ENTITY_PRODUCT, &product.id).await;
    }

    async fn process_order(&self, run: &mut JobRun, order: &ExternalOrder) {
        let outcome = match self.inner.mapper.map_order(run.marketplace, order) {
            Ok(entity) => self
                .inner
                .mappings
                .upsert_entity(run.job.tenant_id, run.job.connection_id, &entity)
                .await
                .map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };
        self.count_item(run, outcome, ENTITY_ORDER, &order.id).await;
    }

    /// Accounts for one processed item and flushes progress every N items.
    async fn count_item(
        &self,
        run: &mut JobRun,
        outcome: Result<UpsertOutcome, String>,
        entity_type: &str,
        external_id: &str,
    ) {
        run.progress.processed += 1;
        match outcome {
            Ok(UpsertOutcome::Skipped) => run.progress.skipped += 1,
            Ok(UpsertOutcome::Created | UpsertOutcome::Updated) => run.progress.succeeded += 1,
            Err(message) => {
                run.progress.failed += 1;
                counter!("sync_items_failed_total", "entity" => entity_type.to_string()).increment(1);
                self.log(
                    &run.job,
                    LogLevel::Warn,
                    "item failed",
                    Some(json!({
                        "entity_type": entity_type,
                        "external_id": external_id,
                        "error": message,
                    })),
                )
                .await;
            }
        }
        if run.progress.processed > run.progress.total {
            run.progress.total = run.progress.processed;
        }

        run.unflushed += 1;
        if run.unflushed >= self.inner.sync.progress_flush_every.max(1) {
            self.flush(run).await;
        }
    }

    /// Routes one adapter call through the retrier and the connection breaker.
    async fn call<T, F, Fut>(
        &self,
        token: &CancellationToken,
        breaker: &CircuitBreaker,
        op: F,
    ) -> Result<T, Stop>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        self.inner
            .retrier
            .execute(token, Some(breaker), op)
            .await
            .map_err(|err| match err {
                RetryError::Cancelled => Stop::Cancelled,
                RetryError::CircuitOpen => {
                    Stop::Failed("circuit breaker open for connection".to_string())
                }
                other => {
                    let kind = other.last_error().map(SyncError::from);
                    match kind {
                        Some(kind) => Stop::Failed(format!("{other} ({kind})")),
                        None => Stop::Failed(other.to_string()),
                    }
                }
            })
    }

    /// Persists progress and cursor while the job is still running.
    async fn flush(&self, run: &mut JobRun) {
        run.unflushed = 0;
        let cursor = run
            .cursor
            .as_ref()
            .and_then(|cursor| serde_json::to_value(cursor).ok());
        let result = progress_update(&run.progress, cursor)
            .filter(sync_job::Column::Id.eq(run.job.id))
            .filter(sync_job::Column::Status.eq(JobStatus::Running.as_str()))
            .exec(&self.inner.db)
            .await;
        if let Err(err) = result {
            warn!(error = %err, "failed to persist job progress");
        }
    }

    /// Writes final counters and moves the job to `status` if it is still
    /// running. Returns whether the status transition happened.
    async fn finish(
        &self,
        job: &sync_job::Model,
        progress: &JobProgress,
        cursor: Option<&JobCursor>,
        status: JobStatus,
        message: Option<String>,
    ) -> bool {
        let now = Utc::now().fixed_offset();
        let cursor = cursor.and_then(|cursor| serde_json::to_value(cursor).ok());

        if let Err(err) = progress_update(progress, cursor)
            .filter(sync_job::Column::Id.eq(job.id))
            .exec(&self.inner.db)
            .await
        {
            error!(error = %err, "failed to persist final job progress");
        }

        let result = SyncJob::update_many()
            .col_expr(sync_job::Column::Status, Expr::value(status.as_str()))
            .col_expr(sync_job::Column::ErrorMessage, Expr::value(message))
            .col_expr(sync_job::Column::CompletedAt, Expr::value(now))
            .col_expr(sync_job::Column::UpdatedAt, Expr::value(now))
            .filter(sync_job::Column::Id.eq(job.id))
            .filter(sync_job::Column::Status.eq(JobStatus::Running.as_str()))
            .exec(&self.inner.db)
            .await;

        match result {
            Ok(res) => res.rows_affected > 0,
            Err(err) => {
                error!(error = %err, "failed to persist final job status");
                false
            }
        }
    }

    async fn log(&self, job: &sync_job::Model, level: LogLevel, message: &str, data: Option<JsonValue>) {
        if let Err(err) = self.inner.jobs.append_log(job, level, message, data).await {
            warn!(error = %err, "failed to append sync log");
        }
    }

    /// Signals cancellation and marks the job cancelled. The running task
    /// stops at its next page boundary or backoff wait.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %job_id))]
    pub async fn cancel_job(&self, tenant_id: Uuid, job_id: Uuid) -> Result<sync_job::Model, OrchestratorError> {
        let job = self.get_job(tenant_id, job_id).await?;
        let status = job.job_status();
        if !status.is_some_and(|status| status.can_transition_to(JobStatus::Cancelled)) {
            return Err(OrchestratorError::InvalidState {
                job_id,
                status: job.status,
                action: "cancelled",
            });
        }

        let now = Utc::now().fixed_offset();
        let current_status = job.status;
        let updated = SyncJob::update_many()
            .col_expr(sync_job::Column::Status, Expr::value(JobStatus::Cancelled.as_str()))
            .col_expr(sync_job::Column::CompletedAt, Expr::value(now))
            .col_expr(sync_job::Column::UpdatedAt, Expr::value(now))
            .filter(sync_job::Column::Id.eq(job_id))
            .filter(sync_job::Column::Status.eq(current_status.as_str()))
            .exec(&self.inner.db)
            .await?;
        if updated.rows_affected == 0 {
            let latest = self.get_job(tenant_id, job_id).await?;
            return Err(OrchestratorError::InvalidState {
                job_id,
                status: latest.status,
                action: "cancelled",
            });
        }

        if let Some(execution) = self.executions().get(&job_id) {
            execution.token.cancel();
        }
        counter!("sync_jobs_cancelled_total").increment(1);
        info!("sync job cancelled");

        self.get_job(tenant_id, job_id).await
    }

    pub async fn get_job(&self, tenant_id: Uuid, job_id: Uuid) -> Result<sync_job::Model, OrchestratorError> {
        self.inner
            .jobs
            .find_for_tenant(tenant_id, job_id)
            .await?
            .ok_or(OrchestratorError::JobNotFound(job_id))
    }

    pub async fn list_jobs(
        &self,
        tenant_id: Uuid,
        filter: &JobFilter,
    ) -> Result<Vec<sync_job::Model>, OrchestratorError> {
        Ok(self.inner.jobs.list(tenant_id, filter).await?)
    }

    pub async fn get_job_logs(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
        limit: Option<u64>,
    ) -> Result<Vec<crate::models::sync_log::Model>, OrchestratorError> {
        self.inner
            .jobs
            .logs(tenant_id, job_id, limit)
            .await?
            .ok_or(OrchestratorError::JobNotFound(job_id))
    }

    pub async fn get_stats(&self, tenant_id: Uuid) -> Result<OrchestratorStats, OrchestratorError> {
        let jobs = self.inner.jobs.counts(tenant_id).await?;
        let open_circuits = self
            .inner
            .breakers
            .states()
            .values()
            .filter(|state| **state != CircuitState::Closed)
            .count();
        Ok(OrchestratorStats {
            jobs,
            limiter: self.inner.limiter.stats(),
            active_executions: self.executions().len(),
            open_circuits,
        })
    }

    /// Fails jobs a previous process left `running`. Call before serving.
    pub async fn recover_interrupted_jobs(&self) -> Result<u64, OrchestratorError> {
        let recovered = self
            .inner
            .jobs
            .fail_running_jobs("interrupted: process stopped while the job was running")
            .await?;
        if recovered > 0 {
            warn!(recovered, "marked interrupted sync jobs as failed");
        }
        Ok(recovered)
    }

    /// Waits for a job started by this process to finish executing.
    pub async fn wait_for(&self, job_id: Uuid) {
        let handle = self
            .executions()
            .get_mut(&job_id)
            .and_then(|execution| execution.handle.take());
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(job_id = %job_id, error = %err, "sync job task panicked");
            }
        }
    }

    /// Cancels every local execution and waits for the tasks to wind down.
    pub async fn shutdown(&self) {
        let handles: Vec<(Uuid, JoinHandle<()>)> = {
            let mut executions = self.executions();
            executions
                .iter_mut()
                .filter_map(|(job_id, execution)| {
                    execution.token.cancel();
                    execution.handle.take().map(|handle| (*job_id, handle))
                })
                .collect()
        };
        info!(count = handles.len(), "waiting for running sync jobs to stop");
        for (job_id, handle) in handles {
            if let Err(err) = handle.await {
                warn!(job_id = %job_id, error = %err, "sync job task did not stop cleanly");
            }
        }
    }
}

fn grow_total(progress: &mut JobProgress, base: i64, reported: Option<u64>, page_len: usize) {
    let estimate = match reported {
        Some(total) => base + total as i64,
        None => progress.processed + page_len as i64,
    };
    progress.total = progress.total.max(estimate);
}

fn progress_update(progress: &JobProgress, cursor: Option<JsonValue>) -> sea_orm::UpdateMany<SyncJob> {
    let mut update = SyncJob::update_many()
        .col_expr(sync_job::Column::TotalItems, Expr::value(progress.total))
        .col_expr(sync_job::Column::ProcessedItems, Expr::value(progress.processed))
        .col_expr(sync_job::Column::SucceededItems, Expr::value(progress.succeeded))
        .col_expr(sync_job::Column::FailedItems, Expr::value(progress.failed))
        .col_expr(sync_job::Column::SkippedItems, Expr::value(progress.skipped))
        .col_expr(sync_job::Column::ProgressPercentage, Expr::value(progress.percentage()))
        .col_expr(sync_job::Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()));
    if let Some(cursor) = cursor {
        update = update.col_expr(sync_job::Column::Cursor, Expr::value(cursor));
    }
    update
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_tracks_reported_or_observed_items() {
        let mut progress = JobProgress::default();
        grow_total(&mut progress, 0, None, 50);
        assert_eq!(progress.total, 50);

        progress.processed = 50;
        grow_total(&mut progress, 0, None, 20);
        assert_eq!(progress.total, 70);

        grow_total(&mut progress, 0, Some(200), 20);
        assert_eq!(progress.total, 200);

        grow_total(&mut progress, 0, Some(10), 20);
        assert_eq!(progress.total, 200);
    }
}
