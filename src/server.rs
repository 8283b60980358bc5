//! # Server Configuration
//!
//! Service wiring, the Axum router and the OpenAPI document.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router, middleware,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

use crate::adapters::AdapterFactory;
use crate::auth::auth_middleware;
use crate::concurrency::ConcurrencyLimiter;
use crate::config::AppConfig;
use crate::event_ordering::EventOrderingGuard;
use crate::handlers;
use crate::inventory::InventoryLedger;
use crate::orchestrator::{JobOrchestrator, OrchestratorDeps};
use crate::reconciliation::ReconciliationEngine;
use crate::resilience::{BreakerRegistry, Retrier};
use crate::schema_mapper::DefaultSchemaMapper;
use crate::telemetry::trace_context_middleware;
use crate::webhook_worker::{WebhookReceiver, WebhookService};

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub orchestrator: JobOrchestrator,
    pub reconciliation: ReconciliationEngine,
    pub ledger: InventoryLedger,
    pub webhooks: WebhookService,
}

/// Everything `serve` needs: the router state plus the pieces the
/// scheduler and webhook workers drive.
pub struct Services {
    pub state: AppState,
    pub guard: Arc<EventOrderingGuard>,
    pub webhook_receiver: WebhookReceiver,
}

impl Services {
    pub fn build(config: Arc<AppConfig>, db: DatabaseConnection, factory: AdapterFactory) -> Self {
        let retrier = Retrier::new(config.retry.clone());
        let breakers = Arc::new(BreakerRegistry::new(config.circuit_breaker.clone()));
        let ledger = InventoryLedger::new(db.clone());
        let guard = Arc::new(EventOrderingGuard::new(db.clone(), &config.event_ordering));

        let orchestrator = JobOrchestrator::new(OrchestratorDeps {
            db: db.clone(),
            factory: factory.clone(),
            mapper: Arc::new(DefaultSchemaMapper),
            limiter: ConcurrencyLimiter::new(config.concurrency.clone()),
            retrier: retrier.clone(),
            breakers: breakers.clone(),
            ledger: ledger.clone(),
            sync: config.sync.clone(),
            concurrency: config.concurrency.clone(),
        });
        let reconciliation =
            ReconciliationEngine::new(db.clone(), ledger.clone(), factory.clone(), retrier, breakers);
        let (webhooks, webhook_receiver) = WebhookService::new(
            db.clone(),
            factory,
            guard.clone(),
            orchestrator.clone(),
            config.webhook.clone(),
        );

        Self {
            state: AppState {
                config,
                db,
                orchestrator,
                reconciliation,
                ledger,
                webhooks,
            },
            guard,
            webhook_receiver,
        }
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let api = Router::new()
        .route("/jobs", post(handlers::jobs::create_job).get(handlers::jobs::list_jobs))
        .route("/jobs/stats", get(handlers::jobs::get_stats))
        .route("/jobs/{job_id}", get(handlers::jobs::get_job))
        .route("/jobs/{job_id}/logs", get(handlers::jobs::get_job_logs))
        .route("/jobs/{job_id}/cancel", post(handlers::jobs::cancel_job))
        .route("/jobs/{job_id}/retry", post(handlers::jobs::retry_job))
        .route(
            "/reconciliations",
            post(handlers::reconciliation::start_reconciliation)
                .get(handlers::reconciliation::list_reconciliations),
        )
        .route(
            "/reconciliations/{job_id}",
            get(handlers::reconciliation::get_reconciliation),
        )
        .route(
            "/reconciliations/{job_id}/discrepancies",
            get(handlers::reconciliation::list_discrepancies),
        )
        .route(
            "/discrepancies/{discrepancy_id}/resolve",
            post(handlers::reconciliation::resolve_discrepancy),
        )
        .route(
            "/discrepancies/{discrepancy_id}/ignore",
            post(handlers::reconciliation::ignore_discrepancy),
        )
        .route("/inventory", post(handlers::inventory::create_inventory))
        .route("/inventory/{inventory_id}", get(handlers::inventory::get_inventory))
        .route(
            "/inventory/{inventory_id}/adjust",
            post(handlers::inventory::adjust_inventory),
        )
        .route(
            "/inventory/{inventory_id}/reserve",
            post(handlers::inventory::reserve_inventory),
        )
        .route(
            "/inventory/{inventory_id}/release",
            post(handlers::inventory::release_inventory),
        )
        .route(
            "/inventory/{inventory_id}/ledger",
            get(handlers::inventory::list_ledger),
        )
        .route(
            "/webhook-events/{event_id}",
            get(handlers::webhooks::get_webhook_event),
        )
        .layer(middleware::from_fn_with_state(
            state.config.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::health))
        .route("/webhooks/{marketplace}", post(handlers::webhooks::receive_webhook))
        .nest("/api/v1", api)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(trace_context_middleware))
        .layer(TraceLayer::new_for_http())
}

/// Serves the API until `shutdown` fires.
pub async fn run_server(state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = state
        .config
        .bind_addr()
        .context("invalid MARKETSYNC_API_BIND_ADDR")?;
    let profile = state.config.profile.clone();
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, %profile, "http server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("http server error")?;

    tracing::info!("http server stopped");
    Ok(())
}

struct BearerSecurity;

impl Modify for BearerSecurity {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
        );
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::health,
        crate::handlers::jobs::create_job,
        crate::handlers::jobs::list_jobs,
        crate::handlers::jobs::get_job,
        crate::handlers::jobs::get_job_logs,
        crate::handlers::jobs::cancel_job,
        crate::handlers::jobs::retry_job,
        crate::handlers::jobs::get_stats,
        crate::handlers::reconciliation::start_reconciliation,
        crate::handlers::reconciliation::list_reconciliations,
        crate::handlers::reconciliation::get_reconciliation,
        crate::handlers::reconciliation::list_discrepancies,
        crate::handlers::reconciliation::resolve_discrepancy,
        crate::handlers::reconciliation::ignore_discrepancy,
        crate::handlers::inventory::create_inventory,
        crate::handlers::inventory::get_inventory,
        crate::handlers::inventory::adjust_inventory,
        crate::handlers::inventory::reserve_inventory,
        crate::handlers::inventory::release_inventory,
        crate::handlers::inventory::list_ledger,
        crate::handlers::webhooks::receive_webhook,
        crate::handlers::webhooks::get_webhook_event,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::error::ApiError,
            crate::handlers::HealthResponse,
            crate::handlers::jobs::CreateJobBody,
            crate::handlers::jobs::JobInfo,
            crate::handlers::jobs::CreateJobResponse,
            crate::handlers::jobs::JobsResponse,
            crate::handlers::jobs::JobLogInfo,
            crate::handlers::reconciliation::StartReconciliationBody,
            crate::handlers::reconciliation::ResolutionBody,
            crate::handlers::inventory::CreateInventoryBody,
            crate::handlers::inventory::AdjustInventoryBody,
            crate::handlers::inventory::QuantityBody,
            crate::handlers::inventory::LedgerMutationResponse,
            crate::handlers::webhooks::WebhookEventInfo,
            crate::orchestrator::OrchestratorStats,
            crate::repositories::JobCounts,
            crate::concurrency::LimiterStats,
            crate::models::sync_job::JobType,
            crate::models::sync_job::JobStatus,
            crate::models::sync_job::SyncDomain,
            crate::models::sync_job::JobProgress,
            crate::models::reconciliation_job::ReconciliationType,
            crate::models::reconciliation_job::ReconciliationCounts,
            crate::models::reconciliation_job::ReconciliationJobInfo,
            crate::models::discrepancy::DiscrepancyInfo,
            crate::models::inventory_current::InventoryLevelInfo,
            crate::models::inventory_ledger::LedgerEntryInfo,
            crate::models::inventory_ledger::TransactionType,
            crate::models::webhook_event::WebhookOutcome,
            crate::webhook_worker::IngestResult,
            crate::webhook_worker::IngestStatus,
        )
    ),
    modifiers(&BearerSecurity),
    tags(
        (name = "jobs", description = "Sync job orchestration"),
        (name = "reconciliation", description = "Consistency checks and discrepancies"),
        (name = "inventory", description = "Inventory ledger"),
        (name = "webhooks", description = "Marketplace webhook intake"),
    ),
    info(
        title = "Marketplace Sync API",
        description = "Marketplace synchronization and consistency engine",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
