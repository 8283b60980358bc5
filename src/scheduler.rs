//! # Sync Scheduler
//!
//! Background loop that keeps connections fresh and drives the periodic
//! maintenance of the other components. Every tick it:
//!
//! 1. enqueues a `delta_sync` job for each connected connection whose last
//!    sync is older than the sync interval,
//! 2. starts missed-sync reconciliation for connections past the missed-sync
//!    threshold,
//! 3. replays buffered out-of-order webhook events,
//! 4. re-enqueues failed webhook events whose retry delay has elapsed.
//!
//! Idle limiter pools and the ordering cache are cleaned on the slower
//! cleanup interval.
//!
//! Scheduled jobs use an idempotency key derived from the interval window, so
//! several instances ticking in the same window enqueue at most one job per
//! connection.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, gauge, histogram};
use tokio::time::{Duration as TokioDuration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::SchedulerConfig;
use crate::event_ordering::EventOrderingGuard;
use crate::models::marketplace_connection;
use crate::models::sync_job::{JobType, SyncDomain, TriggerSource};
use crate::orchestrator::{CreateJobRequest, JobOrchestrator, OrchestratorError};
use crate::reconciliation::ReconciliationEngine;
use crate::repositories::ConnectionRepository;
use crate::server::AppState;
use crate::webhook_worker::WebhookService;

/// Background scheduler service.
pub struct SyncScheduler {
    config: SchedulerConfig,
    connections: ConnectionRepository,
    orchestrator: JobOrchestrator,
    reconciliation: ReconciliationEngine,
    webhooks: WebhookService,
    guard: Arc<EventOrderingGuard>,
}

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickStats {
    pub connections_due: u64,
    pub jobs_enqueued: u64,
    pub jobs_skipped: u64,
    pub reconciliations_started: u64,
    pub events_replayed: u64,
    pub webhooks_requeued: u64,
    pub errors: u64,
}

impl SyncScheduler {
    pub fn new(config: SchedulerConfig, state: &AppState, guard: Arc<EventOrderingGuard>) -> Self {
        Self {
            config,
            connections: ConnectionRepository::new(state.db.clone()),
            orchestrator: state.orchestrator.clone(),
            reconciliation: state.reconciliation.clone(),
            webhooks: state.webhooks.clone(),
            guard,
        }
    }

    /// Run the scheduler loop until the provided shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            tick_interval_seconds = self.config.tick_interval_seconds,
            sync_interval_seconds = self.config.sync_interval_seconds,
            "starting sync scheduler"
        );
        let tick_interval = TokioDuration::from_secs(self.config.tick_interval_seconds.max(1));
        let cleanup_interval = TokioDuration::from_secs(self.config.cleanup_interval_seconds.max(1));
        let mut last_cleanup = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("sync scheduler shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = Instant::now();
                    let stats = self.tick(Utc::now()).await;
                    if last_cleanup.elapsed() >= cleanup_interval {
                        self.cleanup();
                        last_cleanup = Instant::now();
                    }
                    histogram!("sync_scheduler_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                    debug!(?stats, "scheduler tick completed");
                }
            }
        }

        info!("sync scheduler stopped");
    }

    /// Runs every periodic step once. Step failures are logged and counted;
    /// a failing step never stops the others.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickStats {
        let mut stats = TickStats::default();

        self.enqueue_due_syncs(now, &mut stats).await;

        let missed_cutoff = now - seconds(self.config.missed_sync_threshold_seconds);
        match self
            .reconciliation
            .trigger_missed_sync_reconciliation(missed_cutoff)
            .await
        {
            Ok(started) => stats.reconciliations_started = started as u64,
            Err(err) => {
                stats.errors += 1;
                error!(error = %err, "missed sync reconciliation failed");
            }
        }

        match self.webhooks.replay_out_of_order().await {
            Ok(replay) => stats.events_replayed = replay.applied as u64,
            Err(err) => {
                stats.errors += 1;
                error!(error = %err, "out-of-order replay failed");
            }
        }

        match self.webhooks.retry_sweep().await {
            Ok(requeued) => stats.webhooks_requeued = requeued as u64,
            Err(err) => {
                stats.errors += 1;
                error!(error = %err, "webhook retry sweep failed");
            }
        }

        gauge!("sync_scheduler_due_connections").set(stats.connections_due as f64);
        counter!("sync_scheduler_jobs_enqueued_total").increment(stats.jobs_enqueued);
        stats
    }

    /// Reclaims idle limiter pools and drops the event-version cache.
    pub fn cleanup(&self) {
        let pools = self.orchestrator.limiter().cleanup();
        let cached = self.guard.cleanup_cache();
        debug!(pools, cached, "scheduler cleanup completed");
    }

    async fn enqueue_due_syncs(&self, now: DateTime<Utc>, stats: &mut TickStats) {
        let interval = self.config.sync_interval_seconds.max(1);
        let due = match self
            .connections
            .list_connected_synced_before(now - seconds(interval))
            .await
        {
            Ok(due) => due,
            Err(err) => {
                stats.errors += 1;
                error!(error = %err, "failed to load connections due for sync");
                return;
            }
        };

        stats.connections_due = due.len() as u64;
        let window = now.timestamp().div_euclid(interval as i64);
        for connection in due {
            match self.enqueue_sync(&connection, window).await {
                Ok(true) => stats.jobs_enqueued += 1,
                Ok(false) => stats.jobs_skipped += 1,
                Err(err) => {
                    stats.errors += 1;
                    warn!(connection_id = %connection.id, error = %err, "failed to enqueue scheduled sync");
                }
            }
        }
    }

    /// `Ok(false)` when the connection is busy or already has this window's job.
    async fn enqueue_sync(
        &self,
        connection: &marketplace_connection::Model,
        window: i64,
    ) -> Result<bool, OrchestratorError> {
        let mut request = CreateJobRequest::new(
            connection.tenant_id,
            connection.id,
            JobType::DeltaSync,
            SyncDomain::Full,
        );
        request.idempotency_key = Some(format!("scheduled-{}-{window}", connection.id));
        request.triggered_by = TriggerSource::Scheduled;
        request.created_by = Some("scheduler".to_string());

        match self.orchestrator.create_job(request).await {
            Ok(created) => {
                if created.created {
                    info!(connection_id = %connection.id, job_id = %created.job.id, "scheduled sync enqueued");
                }
                Ok(created.created)
            }
            Err(OrchestratorError::JobAlreadyRunning { job_id, .. }) => {
                debug!(connection_id = %connection.id, running_job_id = %job_id, "connection busy; skipping scheduled sync");
                Ok(false)
            }
            Err(OrchestratorError::Admission(err)) => {
                debug!(connection_id = %connection.id, error = %err, "no capacity for scheduled sync");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

/// Upper bound on configured lookbacks, far beyond any sensible interval.
const MAX_LOOKBACK_SECONDS: u64 = 100 * 365 * 86_400;

fn seconds(value: u64) -> Duration {
    Duration::seconds(value.min(MAX_LOOKBACK_SECONDS) as i64)
}
