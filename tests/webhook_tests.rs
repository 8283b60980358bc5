//! Webhook intake, processing, ordering and the retry sweep.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::http::{HeaderMap, HeaderValue};
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use marketplace_sync::adapters::AdapterFactory;
use marketplace_sync::models::marketplace_connection::{self, ConnectionStatus, MarketplaceType};
use marketplace_sync::models::webhook_event::WebhookOutcome;
use marketplace_sync::models::{MarketplaceConnection, WebhookEvent};
use marketplace_sync::server::Services;
use marketplace_sync::webhook_worker::{IngestStatus, WebhookError};

#[path = "test_utils/mod.rs"]
mod test_utils;
use test_utils::{
    FakeMarketplace, build_services, build_services_with, create_test_tenant, insert_connection,
    setup_test_db, sign_body, test_config,
};

const SHOP: &str = "acme.myshopify.com";

fn shopify_headers(body: &[u8], topic: &str, delivery_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("x-shopify-shop-domain", HeaderValue::from_static(SHOP));
    headers.insert(
        "x-shopify-hmac-sha256",
        HeaderValue::from_str(&sign_body(body)).expect("base64 is a valid header"),
    );
    headers.insert("x-shopify-topic", HeaderValue::from_str(topic).expect("topic header"));
    headers.insert(
        "x-shopify-webhook-id",
        HeaderValue::from_str(delivery_id).expect("delivery header"),
    );
    headers
}

fn product_body(id: &str, version: i64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": id,
        "updated_at": "2025-03-01T10:00:00Z",
        "version": version,
    }))
    .expect("json body")
}

async fn setup() -> Result<(DatabaseConnection, Uuid, marketplace_connection::Model)> {
    let db = setup_test_db().await?;
    let tenant = create_test_tenant(&db).await?;
    let connection = insert_connection(&db, tenant, MarketplaceType::Shopify, SHOP).await?;
    Ok((db, tenant, connection))
}

/// Ingests a signed product update and returns the stored event id.
async fn ingest_product(services: &Services, delivery_id: &str, version: i64) -> Result<Uuid> {
    let body = product_body("p-1", version);
    let result = services
        .state
        .webhooks
        .ingest(
            MarketplaceType::Shopify,
            &shopify_headers(&body, "products/update", delivery_id),
            &body,
        )
        .await?;
    Ok(result.webhook_event_id)
}

#[tokio::test]
async fn signed_delivery_is_stored_and_queued() -> Result<()> {
    let (db, tenant, connection) = setup().await?;
    let fake = FakeMarketplace::new();
    let services = build_services(db, &fake);

    let body = product_body("p-1", 5);
    let result = services
        .state
        .webhooks
        .ingest(
            MarketplaceType::Shopify,
            &shopify_headers(&body, "products/update", "delivery-1"),
            &body,
        )
        .await?;
    assert_eq!(result.status, IngestStatus::Queued);

    let row = services.state.webhooks.get(tenant, result.webhook_event_id).await?;
    assert_eq!(row.connection_id, connection.id);
    assert_eq!(row.idempotency_key, "shopify-delivery-1");
    assert_eq!(row.resource_type, "product");
    assert_eq!(row.resource_id.as_deref(), Some("p-1"));
    assert_eq!(row.version, Some(5));
    assert_eq!(row.status, "pending");
    assert!(!row.processed);

    let again = services
        .state
        .webhooks
        .ingest(
            MarketplaceType::Shopify,
            &shopify_headers(&body, "products/update", "delivery-1"),
            &body,
        )
        .await?;
    assert_eq!(again.status, IngestStatus::Duplicate);
    assert_eq!(again.webhook_event_id, result.webhook_event_id);
    Ok(())
}

#[tokio::test]
async fn tampered_or_unroutable_deliveries_are_rejected() -> Result<()> {
    let (db, _tenant, _connection) = setup().await?;
    let fake = FakeMarketplace::new();
    let services = build_services(db.clone(), &fake);
    let webhooks = &services.state.webhooks;

    let body = product_body("p-1", 1);
    let headers = shopify_headers(&body, "products/update", "delivery-1");
    let tampered = product_body("p-1", 2);
    let err = webhooks
        .ingest(MarketplaceType::Shopify, &headers, &tampered)
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::InvalidSignature));

    let mut unknown = headers.clone();
    unknown.insert("x-shopify-shop-domain", HeaderValue::from_static("other.myshopify.com"));
    let err = webhooks
        .ingest(MarketplaceType::Shopify, &unknown, &body)
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::UnknownStore { .. }));

    let mut unsigned = headers.clone();
    unsigned.remove("x-shopify-hmac-sha256");
    let err = webhooks
        .ingest(MarketplaceType::Shopify, &unsigned, &body)
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::MissingHeader("x-shopify-hmac-sha256")));

    assert!(WebhookEvent::find().all(&db).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn processing_creates_delta_sync_job() -> Result<()> {
    let (db, tenant, connection) = setup().await?;
    let fake = FakeMarketplace::new();
    let services = build_services(db, &fake);

    let id = ingest_product(&services, "delivery-1", 1).await?;
    let outcome = services.state.webhooks.process(id).await?;
    assert_eq!(outcome, WebhookOutcome::Processed);

    let row = services.state.webhooks.get(tenant, id).await?;
    assert!(row.processed);
    assert_eq!(row.status, "processed");
    let job_id = row.sync_job_id.expect("sync job linked");

    services.state.orchestrator.wait_for(job_id).await;
    let job = services.state.orchestrator.get_job(tenant, job_id).await?;
    assert_eq!(job.connection_id, connection.id);
    assert_eq!(job.job_type, "delta_sync");
    assert_eq!(job.domain, "products");
    assert_eq!(job.triggered_by, "webhook");
    assert_eq!(job.status, "completed");

    // Reprocessing a finished row is a no-op.
    assert_eq!(
        services.state.webhooks.process(id).await?,
        WebhookOutcome::Processed
    );
    Ok(())
}

#[tokio::test]
async fn stale_and_repeated_versions_do_not_sync() -> Result<()> {
    let (db, tenant, _connection) = setup().await?;
    let fake = FakeMarketplace::new();
    let services = build_services(db, &fake);
    let webhooks = &services.state.webhooks;

    let current = ingest_product(&services, "delivery-5", 5).await?;
    assert_eq!(webhooks.process(current).await?, WebhookOutcome::Processed);
    if let Some(job_id) = webhooks.get(tenant, current).await?.sync_job_id {
        services.state.orchestrator.wait_for(job_id).await;
    }

    let stale = ingest_product(&services, "delivery-3", 3).await?;
    assert_eq!(webhooks.process(stale).await?, WebhookOutcome::OutOfOrder);
    let stale_row = webhooks.get(tenant, stale).await?;
    assert_eq!(stale_row.status, "out_of_order");
    assert!(stale_row.sync_job_id.is_none());

    let repeated = ingest_product(&services, "delivery-5b", 5).await?;
    assert_eq!(webhooks.process(repeated).await?, WebhookOutcome::Duplicate);

    let replay = webhooks.replay_out_of_order().await?;
    assert_eq!(replay.examined, 1);
    assert_eq!(replay.superseded, 1);
    assert_eq!(replay.applied, 0);
    Ok(())
}

#[tokio::test]
async fn unknown_topics_are_ignored() -> Result<()> {
    let (db, tenant, _connection) = setup().await?;
    let fake = FakeMarketplace::new();
    let services = build_services(db, &fake);

    let body = serde_json::to_vec(&json!({ "id": "shop-1" }))?;
    let result = services
        .state
        .webhooks
        .ingest(
            MarketplaceType::Shopify,
            &shopify_headers(&body, "app/uninstalled", "delivery-9"),
            &body,
        )
        .await?;
    let outcome = services.state.webhooks.process(result.webhook_event_id).await?;
    assert_eq!(outcome, WebhookOutcome::Ignored);

    let row = services.state.webhooks.get(tenant, result.webhook_event_id).await?;
    assert!(row.processed);
    assert!(row.sync_job_id.is_none());
    Ok(())
}

#[tokio::test]
async fn failed_events_are_retried_until_dead() -> Result<()> {
    let (db, tenant, connection) = setup().await?;
    let fake = FakeMarketplace::new();
    let mut config = test_config();
    config.webhook.max_retries = 2;
    config.webhook.retry_delay_seconds = 0;
    let services = build_services_with(config, db.clone(), &fake);
    let webhooks = &services.state.webhooks;

    let id = ingest_product(&services, "delivery-1", 1).await?;

    let stored = MarketplaceConnection::find_by_id(connection.id)
        .one(&db)
        .await?
        .expect("connection exists");
    let mut active: marketplace_connection::ActiveModel = stored.into();
    active.status = Set(ConnectionStatus::Disconnected.as_str().to_string());
    active.update(&db).await?;

    assert_eq!(webhooks.process(id).await?, WebhookOutcome::Failed);
    let row = webhooks.get(tenant, id).await?;
    assert!(!row.processed);
    assert_eq!(row.retry_count, 1);
    assert!(row.processing_error.is_some_and(|e| e.contains("not in the connected state")));

    assert_eq!(webhooks.retry_sweep().await?, 1);
    assert_eq!(webhooks.process(id).await?, WebhookOutcome::Dead);

    let row = webhooks.get(tenant, id).await?;
    assert!(row.processed);
    assert_eq!(row.status, "dead");
    assert_eq!(webhooks.retry_sweep().await?, 0);
    Ok(())
}

#[tokio::test]
async fn full_queue_defers_to_the_sweep() -> Result<()> {
    let (db, _tenant, _connection) = setup().await?;
    let fake = FakeMarketplace::new();
    let mut config = test_config();
    config.webhook.queue_capacity = 1;
    let services = build_services_with(config, db, &fake);

    let first_body = product_body("p-1", 1);
    let first = services
        .state
        .webhooks
        .ingest(
            MarketplaceType::Shopify,
            &shopify_headers(&first_body, "products/update", "delivery-1"),
            &first_body,
        )
        .await?;
    let second_body = product_body("p-2", 1);
    let second = services
        .state
        .webhooks
        .ingest(
            MarketplaceType::Shopify,
            &shopify_headers(&second_body, "products/update", "delivery-2"),
            &second_body,
        )
        .await?;

    assert_eq!(first.status, IngestStatus::Queued);
    assert_eq!(second.status, IngestStatus::Deferred);
    Ok(())
}

#[tokio::test]
async fn workers_drain_the_queue() -> Result<()> {
    let (db, tenant, _connection) = setup().await?;
    let fake = FakeMarketplace::new();
    let Services {
        state,
        webhook_receiver,
        ..
    } = build_services(db, &fake);

    let shutdown = CancellationToken::new();
    let workers = state.webhooks.spawn_workers(webhook_receiver, shutdown.clone());

    let body = product_body("p-1", 1);
    let result = state
        .webhooks
        .ingest(
            MarketplaceType::Shopify,
            &shopify_headers(&body, "products/update", "delivery-1"),
            &body,
        )
        .await?;

    let mut processed = None;
    for _ in 0..200 {
        let row = state.webhooks.get(tenant, result.webhook_event_id).await?;
        if row.processed {
            processed = Some(row);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let row = processed.expect("worker processed the event");
    assert_eq!(row.status, "processed");
    if let Some(job_id) = row.sync_job_id {
        state.orchestrator.wait_for(job_id).await;
    }

    shutdown.cancel();
    for worker in workers {
        worker.await?;
    }
    Ok(())
}

#[tokio::test]
async fn shopify_signatures_verify_with_the_production_adapter() -> Result<()> {
    let (db, tenant, _connection) = setup().await?;
    let services = Services::build(Arc::new(test_config()), db, AdapterFactory::new());

    let body = br#"{"id": 450789469, "updated_at": "2025-03-01T10:00:00-05:00"}"#;
    let result = services
        .state
        .webhooks
        .ingest(
            MarketplaceType::Shopify,
            &shopify_headers(body, "orders/updated", "delivery-42"),
            body,
        )
        .await?;
    assert_eq!(result.status, IngestStatus::Queued);

    let row = services.state.webhooks.get(tenant, result.webhook_event_id).await?;
    assert_eq!(row.resource_type, "order");
    assert_eq!(row.resource_id.as_deref(), Some("450789469"));
    assert_eq!(row.event_id, "delivery-42");

    let mut forged = shopify_headers(body, "orders/updated", "delivery-43");
    forged.insert("x-shopify-hmac-sha256", HeaderValue::from_static("bm90LWEtc2lnbmF0dXJl"));
    let err = services
        .state
        .webhooks
        .ingest(MarketplaceType::Shopify, &forged, body)
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::InvalidSignature));
    Ok(())
}
