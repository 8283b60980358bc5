//! # Webhook Intake and Workers
//!
//! Intake resolves the sending connection from its store-id header, verifies
//! the signature against that connection's secret, parses the delivery and
//! deduplicates it on `{marketplace}-{event_id}`. Accepted events are stored
//! and handed to a bounded queue drained by a fixed pool of workers. Each
//! worker passes the event through the [`EventOrderingGuard`] and, when it
//! applies, creates a `delta_sync` job for the event's resource domain.
//!
//! Failed attempts stay on the row with `processed = false`; the retry sweep
//! re-enqueues them until `max_retries`, after which they are marked `dead`.

use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::Utc;
use metrics::{counter, gauge};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::adapters::{AdapterFactory, ResourceType, WebhookContext};
use crate::config::WebhookConfig;
use crate::event_ordering::{EventOrderingGuard, OrderedEvent, OrderingError, OrderingOutcome, ReplayStats};
use crate::models::marketplace_connection::MarketplaceType;
use crate::models::sync_job::{JobType, SyncDomain, TriggerSource};
use crate::models::webhook_event::{self, Entity as WebhookEvent, STATUS_PENDING, WebhookOutcome};
use crate::orchestrator::{CreateJobRequest, JobOrchestrator};
use crate::repositories::ConnectionRepository;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("no {marketplace} connection for store {store_id}")]
    UnknownStore {
        marketplace: MarketplaceType,
        store_id: String,
    },
    #[error("connection {0} has no webhook secret configured")]
    MissingSecret(Uuid),
    #[error("webhook signature verification failed")]
    InvalidSignature,
    #[error("unparseable webhook: {0}")]
    Parse(String),
    #[error("unsupported marketplace: {0}")]
    Unsupported(String),
    #[error("webhook event {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Ordering(#[from] OrderingError),
    #[error("webhook store error: {0}")]
    Database(#[from] DbErr),
}

/// Marketplace-specific header names.
struct HeaderNames {
    store_id: &'static str,
    signature: &'static str,
    topic: &'static str,
    delivery_id: &'static str,
}

fn header_names(marketplace: MarketplaceType) -> HeaderNames {
    match marketplace {
        MarketplaceType::Shopify => HeaderNames {
            store_id: "x-shopify-shop-domain",
            signature: "x-shopify-hmac-sha256",
            topic: "x-shopify-topic",
            delivery_id: "x-shopify-webhook-id",
        },
        MarketplaceType::Amazon => HeaderNames {
            store_id: "x-amz-seller-id",
            signature: "x-amz-sns-signature",
            topic: "x-amz-sns-topic",
            delivery_id: "x-amz-sns-message-id",
        },
        MarketplaceType::Dukaan => HeaderNames {
            store_id: "x-store-id",
            signature: "x-webhook-signature",
            topic: "x-webhook-topic",
            delivery_id: "x-webhook-id",
        },
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Result of accepting a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    /// Stored and queued for processing
    Queued,
    /// Stored, but the queue was full; the retry sweep will pick it up
    Deferred,
    /// Same `{marketplace}-{event_id}` was already received
    Duplicate,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct IngestResult {
    pub webhook_event_id: Uuid,
    pub status: IngestStatus,
}

/// Receiving half of the work queue; hand it to [`WebhookService::spawn_workers`].
pub struct WebhookReceiver(mpsc::Receiver<Uuid>);

struct ServiceInner {
    db: DatabaseConnection,
    connections: ConnectionRepository,
    factory: AdapterFactory,
    guard: Arc<EventOrderingGuard>,
    orchestrator: JobOrchestrator,
    config: WebhookConfig,
    sender: mpsc::Sender<Uuid>,
}

#[derive(Clone)]
pub struct WebhookService {
    inner: Arc<ServiceInner>,
}

impl WebhookService {
    pub fn new(
        db: DatabaseConnection,
        factory: AdapterFactory,
        guard: Arc<EventOrderingGuard>,
        orchestrator: JobOrchestrator,
        config: WebhookConfig,
    ) -> (Self, WebhookReceiver) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let service = Self {
            inner: Arc::new(ServiceInner {
                connections: ConnectionRepository::new(db.clone()),
                db,
                factory,
                guard,
                orchestrator,
                config,
                sender,
            }),
        };
        (service, WebhookReceiver(receiver))
    }

    /// Verifies, parses, deduplicates and stores one delivery, then queues it.
    #[instrument(skip(self, headers, body), fields(marketplace = %marketplace))]
    pub async fn ingest(
        &self,
        marketplace: MarketplaceType,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<IngestResult, WebhookError> {
        let names = header_names(marketplace);
        let store_id = header(headers, names.store_id).ok_or(WebhookError::MissingHeader(names.store_id))?;
        let connection = self
            .inner
            .connections
            .find_by_store(marketplace, store_id)
            .await?
            .ok_or_else(|| WebhookError::UnknownStore {
                marketplace,
                store_id: store_id.to_string(),
            })?;

        let secret = connection
            .webhook_secret
            .as_deref()
            .filter(|secret| !secret.is_empty())
            .ok_or(WebhookError::MissingSecret(connection.id))?;
        let signature = header(headers, names.signature).ok_or(WebhookError::MissingHeader(names.signature))?;

        let adapter = self
            .inner
            .factory
            .create_uninitialized(marketplace)
            .map_err(|err| WebhookError::Unsupported(err.to_string()))?;
        if !adapter.verify_webhook(body, signature, secret) {
            counter!("webhooks_rejected_total", "reason" => "signature").increment(1);
            warn!(connection_id = %connection.id, "webhook signature mismatch");
            return Err(WebhookError::InvalidSignature);
        }

        let context = WebhookContext {
            topic: header(headers, names.topic).map(str::to_string),
            delivery_id: header(headers, names.delivery_id).map(str::to_string),
        };
        let event = adapter
            .parse_webhook(body, &context)
            .map_err(|err| WebhookError::Parse(err.to_string()))?;

        let idempotency_key = format!("{}-{}", marketplace, event.event_id);
        if let Some(existing) = self.find_by_key(&idempotency_key).await? {
            counter!("webhooks_duplicate_total").increment(1);
            return Ok(IngestResult {
                webhook_event_id: existing.id,
                status: IngestStatus::Duplicate,
            });
        }

        let now = Utc::now().fixed_offset();
        let inserted = webhook_event::ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(connection.tenant_id),
            connection_id: Set(connection.id),
            marketplace_type: Set(marketplace.as_str().to_string()),
            idempotency_key: Set(idempotency_key.clone()),
            event_id: Set(event.event_id.clone()),
            event_type: Set(event.event_type.clone()),
            resource_type: Set(event.resource_type.as_str().to_string()),
            resource_id: Set(event.resource_id.clone()),
            version: Set(event.version),
            event_time: Set(event.timestamp.fixed_offset()),
            payload: Set(Some(event.payload.clone())),
            status: Set(STATUS_PENDING.to_string()),
            processed: Set(false),
            retry_count: Set(0),
            max_retries: Set(self.inner.config.max_retries),
            processing_error: Set(None),
            sync_job_id: Set(None),
            processed_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&self.inner.db)
        .await;

        let row = match inserted {
            Ok(row) => row,
            Err(err) if crate::error::is_unique_violation(&err) => {
                let existing = self
                    .find_by_key(&idempotency_key)
                    .await?
                    .ok_or(WebhookError::Database(err))?;
                return Ok(IngestResult {
                    webhook_event_id: existing.id,
                    status: IngestStatus::Duplicate,
                });
            }
            Err(err) => return Err(err.into()),
        };

        counter!("webhooks_received_total", "marketplace" => marketplace.as_str()).increment(1);
        info!(
            webhook_event_id = %row.id,
            event_id = %row.event_id,
            event_type = %row.event_type,
            connection_id = %row.connection_id,
            "webhook accepted"
        );

        let status = match self.inner.sender.try_send(row.id) {
            Ok(()) => IngestStatus::Queued,
            Err(err) => {
                warn!(webhook_event_id = %row.id, error = %err, "webhook queue unavailable; deferring to retry sweep");
                IngestStatus::Deferred
            }
        };
        Ok(IngestResult {
            webhook_event_id: row.id,
            status,
        })
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<webhook_event::Model>, DbErr> {
        WebhookEvent::find()
            .filter(webhook_event::Column::IdempotencyKey.eq(key))
            .one(&self.inner.db)
            .await
    }

    pub async fn get(&self, tenant_id: Uuid, id: Uuid) -> Result<webhook_event::Model, WebhookError> {
        WebhookEvent::find_by_id(id)
            .filter(webhook_event::Column::TenantId.eq(tenant_id))
            .one(&self.inner.db)
            .await?
            .ok_or(WebhookError::NotFound(id))
    }

    /// Starts `workers` tasks draining the queue until `shutdown` fires or
    /// every sender is dropped.
    pub fn spawn_workers(&self, receiver: WebhookReceiver, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let receiver = Arc::new(AsyncMutex::new(receiver.0));
        (0..self.inner.config.workers.max(1))
            .map(|worker| {
                let service = self.clone();
                let receiver = receiver.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(
                    async move {
                        debug!("webhook worker started");
                        loop {
                            let next = tokio::select! {
                                _ = shutdown.cancelled() => None,
                                id = async { receiver.lock().await.recv().await } => id,
                            };
                            let Some(id) = next else { break };
                            if let Err(err) = service.process(id).await {
                                error!(webhook_event_id = %id, error = %err, "webhook processing errored");
                            }
                        }
                        debug!("webhook worker stopped");
                    }
                    .instrument(info_span!("webhook_worker", worker)),
                )
            })
            .collect()
    }

    /// Processes one stored event and records its outcome on the row.
    #[instrument(skip(self), fields(webhook_event_id = %id))]
    pub async fn process(&self, id: Uuid) -> Result<WebhookOutcome, WebhookError> {
        let row = WebhookEvent::find_by_id(id)
            .one(&self.inner.db)
            .await?
            .ok_or(WebhookError::NotFound(id))?;
        if row.processed {
            debug!(status = %row.status, "webhook already processed");
            return Ok(parse_outcome(&row.status).unwrap_or(WebhookOutcome::Processed));
        }

        let Some(domain) = resource_domain(&row.resource_type) else {
            self.finish(&row, WebhookOutcome::Ignored, None, None).await?;
            return Ok(WebhookOutcome::Ignored);
        };

        let event = OrderedEvent {
            tenant_id: row.tenant_id,
            entity_type: row.resource_type.clone(),
            entity_id: row.resource_id.clone().unwrap_or_else(|| row.event_id.clone()),
            event_id: row.event_id.clone(),
            event_time: row.event_time.with_timezone(&Utc),
            version: row.version,
            payload: Some(json!({ "webhook_event_id": row.id })),
        };

        let this = self.clone();
        let target = row.clone();
        let result = self
            .inner
            .guard
            .process_event_with_ordering(&event, move |_| async move {
                this.trigger_sync(&target, domain).await
            })
            .await;

        let outcome = match result {
            Ok(OrderingOutcome::Processed(job_id)) => {
                self.finish(&row, WebhookOutcome::Processed, Some(job_id), None).await?;
                WebhookOutcome::Processed
            }
            Ok(OrderingOutcome::Duplicate) => {
                self.finish(&row, WebhookOutcome::Duplicate, None, None).await?;
                WebhookOutcome::Duplicate
            }
            Ok(OrderingOutcome::Buffered { .. }) => {
                self.finish(&row, WebhookOutcome::OutOfOrder, None, None).await?;
                WebhookOutcome::OutOfOrder
            }
            Err(OrderingError::Processor(err)) => self.record_failure(&row, &format!("{err:#}")).await?,
            Err(err) => {
                self.record_failure(&row, &err.to_string()).await?;
                return Err(err.into());
            }
        };

        counter!("webhooks_processed_total", "outcome" => outcome.as_str()).increment(1);
        Ok(outcome)
    }

    async fn trigger_sync(&self, row: &webhook_event::Model, domain: SyncDomain) -> anyhow::Result<Uuid> {
        let mut request = CreateJobRequest::new(row.tenant_id, row.connection_id, JobType::DeltaSync, domain);
        request.idempotency_key = Some(format!("webhook-{}", row.id));
        request.triggered_by = TriggerSource::Webhook;
        request.created_by = Some("webhook".to_string());
        let created = self.inner.orchestrator.create_job(request).await?;
        Ok(created.job.id)
    }

    async fn finish(
        &self,
        row: &webhook_event::Model,
        outcome: WebhookOutcome,
        sync_job_id: Option<Uuid>,
        error: Option<String>,
    ) -> Result<(), DbErr> {
        let now = Utc::now().fixed_offset();
        WebhookEvent::update_many()
            .col_expr(webhook_event::Column::Status, Expr::value(outcome.as_str()))
            .col_expr(webhook_event::Column::Processed, Expr::value(outcome.is_final()))
            .col_expr(webhook_event::Column::SyncJobId, Expr::value(sync_job_id))
            .col_expr(webhook_event::Column::ProcessingError, Expr::value(error))
            .col_expr(webhook_event::Column::ProcessedAt, Expr::value(now))
            .col_expr(webhook_event::Column::UpdatedAt, Expr::value(now))
            .filter(webhook_event::Column::Id.eq(row.id))
            .exec(&self.inner.db)
            .await?;
        Ok(())
    }

    async fn record_failure(&self, row: &webhook_event::Model, message: &str) -> Result<WebhookOutcome, DbErr> {
        let retry_count = row.retry_count + 1;
        let outcome = if retry_count >= row.max_retries {
            WebhookOutcome::Dead
        } else {
            WebhookOutcome::Failed
        };
        let now = Utc::now().fixed_offset();
        WebhookEvent::update_many()
            .col_expr(webhook_event::Column::Status, Expr::value(outcome.as_str()))
            .col_expr(webhook_event::Column::Processed, Expr::value(outcome.is_final()))
            .col_expr(webhook_event::Column::RetryCount, Expr::value(retry_count))
            .col_expr(webhook_event::Column::ProcessingError, Expr::value(message))
            .col_expr(webhook_event::Column::UpdatedAt, Expr::value(now))
            .filter(webhook_event::Column::Id.eq(row.id))
            .exec(&self.inner.db)
            .await?;
        warn!(retry_count, outcome = %outcome, error = message, "webhook processing failed");
        Ok(outcome)
    }

    /// Re-enqueues unprocessed events whose retry delay has elapsed.
    pub async fn retry_sweep(&self) -> Result<usize, WebhookError> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.inner.config.retry_delay_seconds as i64);
        let due: Vec<Uuid> = WebhookEvent::find()
            .select_only()
            .column(webhook_event::Column::Id)
            .filter(webhook_event::Column::Processed.eq(false))
            .filter(Expr::col(webhook_event::Column::RetryCount).lt(Expr::col(webhook_event::Column::MaxRetries)))
            .filter(webhook_event::Column::UpdatedAt.lte(cutoff.fixed_offset()))
            .order_by_asc(webhook_event::Column::CreatedAt)
            .limit(self.inner.config.queue_capacity as u64)
            .into_tuple()
            .all(&self.inner.db)
            .await?;

        let mut queued = 0;
        for id in due {
            if self.inner.sender.try_send(id).is_err() {
                break;
            }
            queued += 1;
        }
        gauge!("webhook_retry_queued").set(queued as f64);
        if queued > 0 {
            info!(queued, "re-enqueued webhook events for retry");
        }
        Ok(queued)
    }

    /// Replays buffered out-of-order events that have become applicable.
    pub async fn replay_out_of_order(&self) -> Result<ReplayStats, WebhookError> {
        let this = self.clone();
        let stats = self
            .inner
            .guard
            .process_pending_out_of_order_events(move |event| {
                let this = this.clone();
                async move { this.replay_one(event).await }
            })
            .await?;
        Ok(stats)
    }

    async fn replay_one(&self, event: OrderedEvent) -> anyhow::Result<()> {
        let id = event
            .payload
            .as_ref()
            .and_then(|payload| payload.get("webhook_event_id"))
            .and_then(|value| value.as_str())
            .and_then(|value| Uuid::parse_str(value).ok())
            .ok_or_else(|| anyhow::anyhow!("buffered event {} has no webhook reference", event.event_id))?;
        let row = WebhookEvent::find_by_id(id)
            .one(&self.inner.db)
            .await?
            .ok_or_else(|| anyhow::anyhow!("webhook event {id} no longer exists"))?;
        let domain = resource_domain(&row.resource_type)
            .ok_or_else(|| anyhow::anyhow!("webhook event {id} has no sync domain"))?;

        let job_id = self.trigger_sync(&row, domain).await?;
        self.finish(&row, WebhookOutcome::Processed, Some(job_id), None).await?;
        Ok(())
    }
}

fn resource_domain(resource_type: &str) -> Option<SyncDomain> {
    match resource_type {
        t if t == ResourceType::Product.as_str() => Some(SyncDomain::Products),
        t if t == ResourceType::Order.as_str() => Some(SyncDomain::Orders),
        t if t == ResourceType::Inventory.as_str() => Some(SyncDomain::Inventory),
        _ => None,
    }
}

fn parse_outcome(status: &str) -> Option<WebhookOutcome> {
    [
        WebhookOutcome::Processed,
        WebhookOutcome::Duplicate,
        WebhookOutcome::OutOfOrder,
        WebhookOutcome::Ignored,
        WebhookOutcome::Failed,
        WebhookOutcome::Dead,
    ]
    .into_iter()
    .find(|outcome| outcome.as_str() == status)
}
