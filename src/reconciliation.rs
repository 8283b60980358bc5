//! # Reconciliation Engine
//!
//! Compares internal state (mappings, canonical records, ledger rows) against
//! what the marketplace last reported and records each difference as a
//! discrepancy. Auto-repair converges inventory to the external quantity
//! through the ledger; dry runs never mutate inventory or mappings.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde_json::json;
use thiserror::Error;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};
use uuid::Uuid;

use crate::adapters::{AdapterFactory, InventoryLevel, MarketplaceAdapter};
use crate::inventory::{InventoryLedger, LedgerContext, LedgerError, SOURCE_RECONCILIATION};
use crate::models::discrepancy::{
    self, DiscrepancyKind, Entity as Discrepancy, ResolutionState,
};
use crate::models::external_mapping::{self, ENTITY_ORDER, ENTITY_PRODUCT};
use crate::models::marketplace_connection;
use crate::models::reconciliation_job::{
    self, Entity as ReconciliationJob, ReconciliationCounts, ReconciliationType, STATUS_COMPLETED,
    STATUS_FAILED, STATUS_RUNNING,
};
use crate::repositories::{ConnectionRepository, MappingRepository, snapshot_quantity};
use crate::resilience::{BreakerRegistry, Retrier};

const ENTITY_INVENTORY: &str = "inventory";

#[derive(Debug, Error)]
pub enum ReconciliationError {
    #[error("connection {0} not found")]
    ConnectionNotFound(Uuid),
    #[error("reconciliation job {0} not found")]
    JobNotFound(Uuid),
    #[error("discrepancy {0} not found")]
    DiscrepancyNotFound(Uuid),
    #[error("discrepancy {id} is already {state}")]
    DiscrepancyNotUnresolved { id: Uuid, state: String },
    #[error("marketplace error: {0}")]
    Adapter(String),
    #[error("repair left available quantity at {actual}, expected {expected}")]
    RepairIncomplete { expected: i64, actual: i64 },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("reconciliation store error: {0}")]
    Database(#[from] DbErr),
}

/// Parameters of one reconciliation run.
#[derive(Debug, Clone)]
pub struct ReconciliationRequest {
    pub tenant_id: Uuid,
    pub connection_id: Uuid,
    pub reconciliation_type: ReconciliationType,
    pub dry_run: bool,
    pub auto_repair: bool,
    /// Re-read external inventory through the adapter before diffing
    pub live_refresh: bool,
    pub triggered_by: String,
}

impl ReconciliationRequest {
    pub fn new(tenant_id: Uuid, connection_id: Uuid, reconciliation_type: ReconciliationType) -> Self {
        Self {
            tenant_id,
            connection_id,
            reconciliation_type,
            dry_run: true,
            auto_repair: false,
            live_refresh: false,
            triggered_by: "manual".to_string(),
        }
    }

    fn repairs(&self) -> bool {
        self.auto_repair && !self.dry_run
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiscrepancyFilter {
    pub kind: Option<DiscrepancyKind>,
    pub state: Option<ResolutionState>,
}

struct EngineInner {
    db: DatabaseConnection,
    connections: ConnectionRepository,
    mappings: MappingRepository,
    ledger: InventoryLedger,
    factory: AdapterFactory,
    retrier: Retrier,
    breakers: Arc<BreakerRegistry>,
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    inner: Arc<EngineInner>,
}

/// Snapshot of one discrepancy before it is written.
struct Finding {
    entity_type: &'static str,
    kind: DiscrepancyKind,
    internal_id: Option<Uuid>,
    external_id: Option<String>,
    internal_value: Option<serde_json::Value>,
    external_value: Option<serde_json::Value>,
}

impl ReconciliationEngine {
    pub fn new(
        db: DatabaseConnection,
        ledger: InventoryLedger,
        factory: AdapterFactory,
        retrier: Retrier,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                connections: ConnectionRepository::new(db.clone()),
                mappings: MappingRepository::new(db.clone()),
                db,
                ledger,
                factory,
                retrier,
                breakers,
            }),
        }
    }

    /// Creates the run and executes it in the background.
    #[instrument(skip(self, request), fields(tenant_id = %request.tenant_id, connection_id = %request.connection_id))]
    pub async fn start(
        &self,
        request: ReconciliationRequest,
    ) -> Result<reconciliation_job::Model, ReconciliationError> {
        let (job, connection) = self.create_run(&request).await?;
        let this = self.clone();
        let run = job.clone();
        let span = info_span!("reconciliation", job_id = %job.id, connection_id = %job.connection_id);
        tokio::spawn(
            async move {
                this.execute(run, connection, request).await;
            }
            .instrument(span),
        );
        Ok(job)
    }

    /// Creates the run and executes it to completion before returning.
    #[instrument(skip(self, request), fields(tenant_id = %request.tenant_id, connection_id = %request.connection_id))]
    pub async fn run(
        &self,
        request: ReconciliationRequest,
    ) -> Result<reconciliation_job::Model, ReconciliationError> {
        let (job, connection) = self.create_run(&request).await?;
        let tenant_id = job.tenant_id;
        let job_id = job.id;
        self.execute(job, connection, request).await;
        self.get(tenant_id, job_id).await
    }

    async fn create_run(
        &self,
        request: &ReconciliationRequest,
    ) -> Result<(reconciliation_job::Model, marketplace_connection::Model), ReconciliationError> {
        let connection = self
            .inner
            .connections
            .find_for_tenant(request.tenant_id, request.connection_id)
            .await?
            .ok_or(ReconciliationError::ConnectionNotFound(request.connection_id))?;

        let now = Utc::now().fixed_offset();
        let job = reconciliation_job::ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(request.tenant_id),
            connection_id: Set(connection.id),
            reconciliation_type: Set(request.reconciliation_type.as_str().to_string()),
            status: Set(STATUS_RUNNING.to_string()),
            dry_run: Set(request.dry_run),
            auto_repair: Set(request.auto_repair),
            total_checked: Set(0),
            matched: Set(0),
            mismatched: Set(0),
            missing_internal: Set(0),
            missing_external: Set(0),
            repaired: Set(0),
            failed_repairs: Set(0),
            triggered_by: Set(request.triggered_by.clone()),
            error_message: Set(None),
            started_at: Set(Some(now)),
            completed_at: Set(None),
            created_at: Set(now),
        }
        .insert(&self.inner.db)
        .await?;

        counter!("reconciliation_runs_total", "type" => request.reconciliation_type.as_str())
            .increment(1);
        info!(
            job_id = %job.id,
            reconciliation_type = %request.reconciliation_type,
            dry_run = request.dry_run,
            auto_repair = request.auto_repair,
            "reconciliation started"
        );
        Ok((job, connection))
    }

    async fn execute(
        &self,
        job: reconciliation_job::Model,
        connection: marketplace_connection::Model,
        request: ReconciliationRequest,
    ) {
        let mut counts = ReconciliationCounts::default();
        let result = match request.reconciliation_type {
            ReconciliationType::Inventory => {
                self.reconcile_inventory(&job, &connection, &request, &mut counts).await
            }
            ReconciliationType::Products => self.reconcile_products(&job, &mut counts).await,
            ReconciliationType::Orders => self.reconcile_orders(&job, &mut counts).await,
            ReconciliationType::Full => self.reconcile_full(&job, &connection, &request, &mut counts).await,
        };

        let (status, message) = match &result {
            Ok(()) => (STATUS_COMPLETED, None),
            Err(err) => {
                error!(error = %err, "reconciliation failed");
                (STATUS_FAILED, Some(err.to_string()))
            }
        };

        let now = Utc::now().fixed_offset();
        let update = ReconciliationJob::update_many()
            .col_expr(reconciliation_job::Column::Status, Expr::value(status))
            .col_expr(reconciliation_job::Column::ErrorMessage, Expr::value(message))
            .col_expr(reconciliation_job::Column::TotalChecked, Expr::value(counts.total_checked))
            .col_expr(reconciliation_job::Column::Matched, Expr::value(counts.matched))
            .col_expr(reconciliation_job::Column::Mismatched, Expr::value(counts.mismatched))
            .col_expr(reconciliation_job::Column::MissingInternal, Expr::value(counts.missing_internal))
            .col_expr(reconciliation_job::Column::MissingExternal, Expr::value(counts.missing_external))
            .col_expr(reconciliation_job::Column::Repaired, Expr::value(counts.repaired))
            .col_expr(reconciliation_job::Column::FailedRepairs, Expr::value(counts.failed_repairs))
            .col_expr(reconciliation_job::Column::CompletedAt, Expr::value(now))
            .filter(reconciliation_job::Column::Id.eq(job.id))
            .exec(&self.inner.db)
            .await;
        if let Err(err) = update {
            error!(error = %err, "failed to persist reconciliation result");
        }

        info!(
            status,
            checked = counts.total_checked,
            matched = counts.matched,
            mismatched = counts.mismatched,
            missing_internal = counts.missing_internal,
            missing_external = counts.missing_external,
            repaired = counts.repaired,
            "reconciliation finished"
        );
    }

    async fn reconcile_full(
        &self,
        job: &reconciliation_job::Model,
        connection: &marketplace_connection::Model,
        request: &ReconciliationRequest,
        counts: &mut ReconciliationCounts,
    ) -> Result<(), ReconciliationError> {
        self.reconcile_inventory(job, connection, request, counts).await?;
        self.reconcile_products(job, counts).await?;
        self.reconcile_orders(job, counts).await
    }

    async fn reconcile_inventory(
        &self,
        job: &reconciliation_job::Model,
        connection: &marketplace_connection::Model,
        request: &ReconciliationRequest,
        counts: &mut ReconciliationCounts,
    ) -> Result<(), ReconciliationError> {
        let mappings = self
            .inner
            .mappings
            .list_for_connection(job.tenant_id, job.connection_id, ENTITY_PRODUCT)
            .await?;

        let live = if request.live_refresh {
            Some(self.fetch_live_levels(connection, &mappings).await?)
        } else {
            None
        };

        for mapping in &mappings {
            let Some(offer_id) = mapping.internal_id else {
                // Unlinked mappings are reported by the products check.
                continue;
            };

            let external = match (&live, mapping.external_sku.as_deref()) {
                (Some(levels), Some(sku)) => match levels.get(sku) {
                    Some(level) => {
                        if !request.dry_run {
                            self.inner
                                .mappings
                                .update_snapshot_quantity(mapping, level.quantity)
                                .await?;
                        }
                        Some(level.quantity)
                    }
                    None => {
                        counts.total_checked += 1;
                        counts.missing_external += 1;
                        self.record(
                            job,
                            Finding {
                                entity_type: ENTITY_INVENTORY,
                                kind: DiscrepancyKind::Missing,
                                internal_id: Some(offer_id),
                                external_id: Some(mapping.external_id.clone()),
                                internal_value: None,
                                external_value: Some(json!({ "sku": sku })),
                            },
                        )
                        .await?;
                        continue;
                    }
                },
                _ => snapshot_quantity(mapping),
            };
            let Some(external) = external else {
                debug!(external_id = %mapping.external_id, "no external quantity recorded; skipping");
                continue;
            };

            counts.total_checked += 1;
            let rows = self.inner.ledger.find_by_offer(job.tenant_id, offer_id).await?;
            let internal: i64 = rows.iter().map(|row| row.available()).sum();
            if internal == external {
                counts.matched += 1;
                continue;
            }

            counts.mismatched += 1;
            let finding = self
                .record(
                    job,
                    Finding {
                        entity_type: ENTITY_INVENTORY,
                        kind: DiscrepancyKind::QuantityMismatch,
                        internal_id: Some(offer_id),
                        external_id: Some(mapping.external_id.clone()),
                        internal_value: Some(json!({ "available": internal })),
                        external_value: Some(json!({ "quantity": external })),
                    },
                )
                .await?;

            if !request.repairs() {
                continue;
            }
            match self
                .repair_quantity(job, connection, mapping, offer_id, &rows, external)
                .await
            {
                Ok(()) => {
                    counts.repaired += 1;
                    self.mark(finding.id, ResolutionState::AutoFixed, Some("converged to marketplace quantity"))
                        .await?;
                }
                Err(err) => {
                    counts.failed_repairs += 1;
                    warn!(external_id = %mapping.external_id, error = %err, "auto-repair failed");
                }
            }
        }
        Ok(())
    }

    /// Moves on-hand across the offer's rows until its total available
    /// quantity equals `external`. Increases land on the first row;
    /// reductions drain rows in order, each bounded under its row lock.
    /// The total is read back afterwards and a shortfall is an error.
    async fn repair_quantity(
        &self,
        job: &reconciliation_job::Model,
        connection: &marketplace_connection::Model,
        mapping: &external_mapping::Model,
        offer_id: Uuid,
        rows: &[crate::models::inventory_current::Model],
        external: i64,
    ) -> Result<(), ReconciliationError> {
        let ledger = &self.inner.ledger;
        let internal: i64 = rows.iter().map(|row| row.available()).sum();
        let row_ids: Vec<Uuid> = if rows.is_empty() {
            let row = ledger
                .ensure_row(
                    job.tenant_id,
                    offer_id,
                    connection.inventory_location(),
                    mapping.external_sku.clone(),
                )
                .await?;
            vec![row.id]
        } else {
            rows.iter().map(|row| row.id).collect()
        };

        let mut remaining = external - internal;
        for row_id in row_ids {
            if remaining == 0 {
                break;
            }
            let ctx = LedgerContext::new(SOURCE_RECONCILIATION)
                .with_reference("reconciliation_job", job.id.to_string())
                .with_notes(format!("converge available to {external}"));
            let mutation = ledger
                .shift_available(job.tenant_id, row_id, remaining, ctx)
                .await?;
            if let Some(entry) = mutation.entry {
                remaining -= entry.quantity_change;
            }
        }

        let actual: i64 = ledger
            .find_by_offer(job.tenant_id, offer_id)
            .await?
            .iter()
            .map(|row| row.available())
            .sum();
        if actual != external {
            return Err(ReconciliationError::RepairIncomplete {
                expected: external,
                actual,
            });
        }
        Ok(())
    }

    async fn fetch_live_levels(
        &self,
        connection: &marketplace_connection::Model,
        mappings: &[external_mapping::Model],
    ) -> Result<HashMap<String, InventoryLevel>, ReconciliationError> {
        let marketplace = connection.marketplace().ok_or_else(|| {
            ReconciliationError::Adapter(format!(
                "unsupported marketplace {}",
                connection.marketplace_type
            ))
        })?;
        let credentials = connection.credentials.clone().unwrap_or_else(|| json!({}));
        let adapter = self
            .inner
            .factory
            .create(marketplace, &credentials)
            .await
            .map_err(|err| ReconciliationError::Adapter(err.to_string()))?;
        let breaker = self.inner.breakers.for_connection(connection.id);
        let token = tokio_util::sync::CancellationToken::new();

        let skus: Vec<String> = mappings
            .iter()
            .filter_map(|m| m.external_sku.clone())
            .filter(|sku| !sku.is_empty())
            .collect();
        let mut levels = HashMap::new();
        for chunk in skus.chunks(50) {
            let adapter_ref: &dyn MarketplaceAdapter = adapter.as_ref();
            let batch = self
                .inner
                .retrier
                .execute(&token, Some(&breaker), move || adapter_ref.get_inventory(chunk))
                .await
                .map_err(|err| ReconciliationError::Adapter(err.to_string()))?;
            levels.extend(batch);
        }
        Ok(levels)
    }

    async fn reconcile_products(
        &self,
        job: &reconciliation_job::Model,
        counts: &mut ReconciliationCounts,
    ) -> Result<(), ReconciliationError> {
        let mappings = self
            .inner
            .mappings
            .list_for_connection(job.tenant_id, job.connection_id, ENTITY_PRODUCT)
            .await?;

        for mapping in &mappings {
            counts.total_checked += 1;
            let Some(record_id) = mapping.internal_id else {
                counts.missing_internal += 1;
                self.record(job, unlinked(ENTITY_PRODUCT, mapping, DiscrepancyKind::Missing))
                    .await?;
                continue;
            };

            let live = self
                .inner
                .mappings
                .canonical(job.tenant_id, record_id)
                .await?
                .filter(|record| record.deleted_at.is_none());
            if live.is_some() {
                counts.matched += 1;
            } else {
                counts.missing_internal += 1;
                self.record(job, unlinked(ENTITY_PRODUCT, mapping, DiscrepancyKind::Orphan))
                    .await?;
            }
        }
        Ok(())
    }

    async fn reconcile_orders(
        &self,
        job: &reconciliation_job::Model,
        counts: &mut ReconciliationCounts,
    ) -> Result<(), ReconciliationError> {
        let mappings = self
            .inner
            .mappings
            .list_for_connection(job.tenant_id, job.connection_id, ENTITY_ORDER)
            .await?;

        for mapping in &mappings {
            counts.total_checked += 1;
            let present = match mapping.internal_id {
                Some(record_id) => self
                    .inner
                    .mappings
                    .canonical(job.tenant_id, record_id)
                    .await?
                    .is_some_and(|record| record.deleted_at.is_none()),
                None => false,
            };
            if present {
                counts.matched += 1;
            } else {
                counts.missing_internal += 1;
                self.record(job, unlinked(ENTITY_ORDER, mapping, DiscrepancyKind::Missing))
                    .await?;
            }
        }
        Ok(())
    }

    async fn record(
        &self,
        job: &reconciliation_job::Model,
        finding: Finding,
    ) -> Result<discrepancy::Model, ReconciliationError> {
        counter!("reconciliation_discrepancies_total", "kind" => finding.kind.as_str()).increment(1);
        Ok(discrepancy::ActiveModel {
            id: Set(Uuid::new_v4()),
            reconciliation_job_id: Set(job.id),
            tenant_id: Set(job.tenant_id),
            connection_id: Set(job.connection_id),
            entity_type: Set(finding.entity_type.to_string()),
            internal_id: Set(finding.internal_id),
            external_id: Set(finding.external_id),
            kind: Set(finding.kind.as_str().to_string()),
            internal_value: Set(finding.internal_value),
            external_value: Set(finding.external_value),
            resolution_state: Set(ResolutionState::Unresolved.as_str().to_string()),
            resolution_note: Set(None),
            resolved_at: Set(None),
            created_at: Set(Utc::now().fixed_offset()),
        }
        .insert(&self.inner.db)
        .await?)
    }

    /// Moves an unresolved discrepancy to `state`. Returns false if it was
    /// no longer unresolved.
    async fn mark(&self, id: Uuid, state: ResolutionState, note: Option<&str>) -> Result<bool, DbErr> {
        let result = Discrepancy::update_many()
            .col_expr(discrepancy::Column::ResolutionState, Expr::value(state.as_str()))
            .col_expr(discrepancy::Column::ResolutionNote, Expr::value(note.map(str::to_string)))
            .col_expr(discrepancy::Column::ResolvedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(discrepancy::Column::Id.eq(id))
            .filter(discrepancy::Column::ResolutionState.eq(ResolutionState::Unresolved.as_str()))
            .exec(&self.inner.db)
            .await?;
        Ok(result.rows_affected > 0)
    }

    pub async fn get(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
    ) -> Result<reconciliation_job::Model, ReconciliationError> {
        ReconciliationJob::find_by_id(job_id)
            .filter(reconciliation_job::Column::TenantId.eq(tenant_id))
            .one(&self.inner.db)
            .await?
            .ok_or(ReconciliationError::JobNotFound(job_id))
    }

    /// Newest first.
    pub async fn list(
        &self,
        tenant_id: Uuid,
        connection_id: Option<Uuid>,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<reconciliation_job::Model>, ReconciliationError> {
        let mut query = ReconciliationJob::find()
            .filter(reconciliation_job::Column::TenantId.eq(tenant_id))
            .order_by_desc(reconciliation_job::Column::CreatedAt);
        if let Some(connection_id) = connection_id {
            query = query.filter(reconciliation_job::Column::ConnectionId.eq(connection_id));
        }
        Ok(query
            .offset(offset.unwrap_or(0))
            .limit(limit.unwrap_or(50).min(500))
            .all(&self.inner.db)
            .await?)
    }

    pub async fn discrepancies(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
        filter: &DiscrepancyFilter,
    ) -> Result<Vec<discrepancy::Model>, ReconciliationError> {
        self.get(tenant_id, job_id).await?;

        let mut query = Discrepancy::find()
            .filter(discrepancy::Column::TenantId.eq(tenant_id))
            .filter(discrepancy::Column::ReconciliationJobId.eq(job_id))
            .order_by_asc(discrepancy::Column::CreatedAt);
        if let Some(kind) = filter.kind {
            query = query.filter(discrepancy::Column::Kind.eq(kind.as_str()));
        }
        if let Some(state) = filter.state {
            query = query.filter(discrepancy::Column::ResolutionState.eq(state.as_str()));
        }
        Ok(query.all(&self.inner.db).await?)
    }

    pub async fn resolve_discrepancy(
        &self,
        tenant_id: Uuid,
        discrepancy_id: Uuid,
        note: Option<String>,
    ) -> Result<discrepancy::Model, ReconciliationError> {
        self.transition(tenant_id, discrepancy_id, ResolutionState::Resolved, note)
            .await
    }

    pub async fn ignore_discrepancy(
        &self,
        tenant_id: Uuid,
        discrepancy_id: Uuid,
        note: Option<String>,
    ) -> Result<discrepancy::Model, ReconciliationError> {
        self.transition(tenant_id, discrepancy_id, ResolutionState::Ignored, note)
            .await
    }

    async fn transition(
        &self,
        tenant_id: Uuid,
        discrepancy_id: Uuid,
        state: ResolutionState,
        note: Option<String>,
    ) -> Result<discrepancy::Model, ReconciliationError> {
        let current = Discrepancy::find_by_id(discrepancy_id)
            .filter(discrepancy::Column::TenantId.eq(tenant_id))
            .one(&self.inner.db)
            .await?
            .ok_or(ReconciliationError::DiscrepancyNotFound(discrepancy_id))?;

        if !self.mark(current.id, state, note.as_deref()).await? {
            let latest = Discrepancy::find_by_id(discrepancy_id)
                .one(&self.inner.db)
                .await?
                .map(|d| d.resolution_state)
                .unwrap_or(current.resolution_state);
            return Err(ReconciliationError::DiscrepancyNotUnresolved {
                id: discrepancy_id,
                state: latest,
            });
        }

        Discrepancy::find_by_id(discrepancy_id)
            .one(&self.inner.db)
            .await?
            .ok_or(ReconciliationError::DiscrepancyNotFound(discrepancy_id))
    }

    /// Connected connections whose last successful sync predates `cutoff`.
    pub async fn detect_missed_syncs(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<marketplace_connection::Model>, ReconciliationError> {
        Ok(self.inner.connections.list_connected_synced_before(cutoff).await?)
    }

    /// Starts a full auto-repair reconciliation for every connection with a
    /// missed sync, skipping connections already reconciled since `cutoff`.
    pub async fn trigger_missed_sync_reconciliation(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, ReconciliationError> {
        let mut triggered = 0;
        for connection in self.detect_missed_syncs(cutoff).await? {
            let recent = ReconciliationJob::find()
                .filter(reconciliation_job::Column::ConnectionId.eq(connection.id))
                .filter(reconciliation_job::Column::CreatedAt.gte(cutoff.fixed_offset()))
                .count(&self.inner.db)
                .await?;
            if recent > 0 {
                continue;
            }

            let mut request =
                ReconciliationRequest::new(connection.tenant_id, connection.id, ReconciliationType::Full);
            request.dry_run = false;
            request.auto_repair = true;
            request.triggered_by = "scheduled".to_string();
            match self.start(request).await {
                Ok(job) => {
                    triggered += 1;
                    info!(connection_id = %connection.id, job_id = %job.id, "missed sync reconciliation started");
                }
                Err(err) => {
                    warn!(connection_id = %connection.id, error = %err, "failed to start missed sync reconciliation");
                }
            }
        }
        Ok(triggered)
    }

    /// Fails runs a previous process left `running`.
    pub async fn recover_interrupted_runs(&self) -> Result<u64, ReconciliationError> {
        let now = Utc::now().fixed_offset();
        let result = ReconciliationJob::update_many()
            .col_expr(reconciliation_job::Column::Status, Expr::value(STATUS_FAILED))
            .col_expr(
                reconciliation_job::Column::ErrorMessage,
                Expr::value("interrupted: process stopped during reconciliation"),
            )
            .col_expr(reconciliation_job::Column::CompletedAt, Expr::value(now))
            .filter(reconciliation_job::Column::Status.eq(STATUS_RUNNING))
            .exec(&self.inner.db)
            .await?;
        Ok(result.rows_affected)
    }
}

fn unlinked(entity_type: &'static str, mapping: &external_mapping::Model, kind: DiscrepancyKind) -> Finding {
    Finding {
        entity_type,
        kind,
        internal_id: mapping.internal_id,
        external_id: Some(mapping.external_id.clone()),
        internal_value: None,
        external_value: mapping.external_data.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repairs_only_when_auto_repair_and_not_dry_run() {
        let mut request =
            ReconciliationRequest::new(Uuid::new_v4(), Uuid::new_v4(), ReconciliationType::Inventory);
        assert!(!request.repairs());

        request.auto_repair = true;
        assert!(!request.repairs());

        request.dry_run = false;
        assert!(request.repairs());
    }
}
