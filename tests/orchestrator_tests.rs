//! Job orchestration end to end: admission, execution against the fake
//! marketplace, retries and job bookkeeping.

use anyhow::Result;
use chrono::{Duration, Utc};
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use uuid::Uuid;

use marketplace_sync::models::external_mapping::{self, ENTITY_ORDER, ENTITY_PRODUCT};
use marketplace_sync::models::marketplace_connection::{ConnectionStatus, MarketplaceType};
use marketplace_sync::models::sync_job::{self, JobStatus, JobType, SyncDomain};
use marketplace_sync::models::{ExternalMapping, MarketplaceConnection, SyncJob};
use marketplace_sync::orchestrator::{CreateJobRequest, OrchestratorError};

#[path = "test_utils/mod.rs"]
mod test_utils;
use test_utils::{
    FakeMarketplace, build_services, build_services_with, create_test_tenant, insert_connection,
    insert_connection_with_status, order, product, setup_test_db, test_config,
};

async fn mappings(
    db: &DatabaseConnection,
    connection_id: Uuid,
    entity_type: &str,
) -> Result<Vec<external_mapping::Model>> {
    Ok(ExternalMapping::find()
        .filter(external_mapping::Column::ConnectionId.eq(connection_id))
        .filter(external_mapping::Column::EntityType.eq(entity_type))
        .all(db)
        .await?)
}

/// Inserts a job row in `running` state with no local execution behind it.
async fn insert_running_job(
    db: &DatabaseConnection,
    tenant_id: Uuid,
    connection_id: Uuid,
) -> Result<sync_job::Model> {
    let now = Utc::now().fixed_offset();
    Ok(sync_job::ActiveModel {
        id: Set(Uuid::new_v4()),
        tenant_id: Set(tenant_id),
        connection_id: Set(connection_id),
        job_type: Set(JobType::FullImport.as_str().to_string()),
        domain: Set(SyncDomain::Full.as_str().to_string()),
        status: Set(JobStatus::Running.as_str().to_string()),
        triggered_by: Set("manual".to_string()),
        created_by: Set(None),
        total_items: Set(0),
        processed_items: Set(0),
        succeeded_items: Set(0),
        failed_items: Set(0),
        skipped_items: Set(0),
        progress_percentage: Set(0.0),
        cursor: Set(None),
        idempotency_key: Set(format!("stale-{}", Uuid::new_v4())),
        priority: Set(0),
        retry_count: Set(0),
        max_retries: Set(3),
        parent_job_id: Set(None),
        target_entity_id: Set(None),
        error_message: Set(None),
        started_at: Set(Some(now)),
        completed_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await?)
}

#[tokio::test]
async fn full_import_maps_entities_and_books_inventory() -> Result<()> {
    let db = setup_test_db().await?;
    let tenant = create_test_tenant(&db).await?;
    let connection = insert_connection(&db, tenant, MarketplaceType::Shopify, "acme.myshopify.com").await?;

    let fake = FakeMarketplace::new();
    let updated = Utc::now() - Duration::hours(1);
    fake.set_products(vec![
        product("p-1", "SKU-1", 4, updated),
        product("p-2", "SKU-2", 6, updated),
    ]);
    fake.set_orders(vec![order("o-1", "SKU-1", 2)]);
    fake.set_inventory("SKU-1", 4);
    fake.set_inventory("SKU-2", 6);

    let services = build_services(db.clone(), &fake);
    let orchestrator = services.state.orchestrator.clone();

    let created = orchestrator
        .create_job(CreateJobRequest::new(
            tenant,
            connection.id,
            JobType::FullImport,
            SyncDomain::Full,
        ))
        .await?;
    assert!(created.created);
    assert_eq!(created.job.status, "running");
    orchestrator.wait_for(created.job.id).await;

    let job = orchestrator.get_job(tenant, created.job.id).await?;
    assert_eq!(job.status, "completed", "error: {:?}", job.error_message);
    assert_eq!(job.processed_items, 5);
    assert_eq!(job.succeeded_items, 5);
    assert_eq!(job.failed_items, 0);
    assert!(job.completed_at.is_some());

    let products = mappings(&db, connection.id, ENTITY_PRODUCT).await?;
    assert_eq!(products.len(), 2);
    assert_eq!(mappings(&db, connection.id, ENTITY_ORDER).await?.len(), 1);

    let sku_1 = products
        .iter()
        .find(|m| m.external_sku.as_deref() == Some("SKU-1"))
        .expect("SKU-1 mapped");
    let offer_id = sku_1.internal_id.expect("mapping linked to a record");
    let rows = services.state.ledger.find_by_offer(tenant, offer_id).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].quantity_on_hand, 4);
    assert_eq!(rows[0].location_id, connection.inventory_location());

    let entries = services
        .state
        .ledger
        .list_ledger(tenant, rows[0].id, None, None)
        .await?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].transaction_type, "SYNC");
    assert_eq!(entries[0].reference_id.as_deref(), Some(job.id.to_string().as_str()));

    let connection = MarketplaceConnection::find_by_id(connection.id)
        .one(&db)
        .await?
        .expect("connection exists");
    assert!(connection.last_sync_at.is_some());
    Ok(())
}

#[tokio::test]
async fn product_pages_are_followed_to_the_end() -> Result<()> {
    let db = setup_test_db().await?;
    let tenant = create_test_tenant(&db).await?;
    let connection = insert_connection(&db, tenant, MarketplaceType::Dukaan, "store-7").await?;

    let fake = FakeMarketplace::new();
    let updated = Utc::now();
    fake.set_products(
        (1..=5)
            .map(|i| product(&format!("p-{i}"), &format!("SKU-{i}"), i, updated))
            .collect(),
    );
    fake.set_page_size(2);

    let services = build_services(db.clone(), &fake);
    let orchestrator = services.state.orchestrator.clone();
    let created = orchestrator
        .create_job(CreateJobRequest::new(
            tenant,
            connection.id,
            JobType::FullImport,
            SyncDomain::Products,
        ))
        .await?;
    orchestrator.wait_for(created.job.id).await;

    let job = orchestrator.get_job(tenant, created.job.id).await?;
    assert_eq!(job.status, "completed");
    assert_eq!(job.processed_items, 5);
    assert_eq!(job.progress_percentage, 100.0);
    assert_eq!(fake.product_calls(), 3);
    assert_eq!(mappings(&db, connection.id, ENTITY_PRODUCT).await?.len(), 5);
    Ok(())
}

#[tokio::test]
async fn transient_marketplace_errors_are_retried() -> Result<()> {
    let db = setup_test_db().await?;
    let tenant = create_test_tenant(&db).await?;
    let connection = insert_connection(&db, tenant, MarketplaceType::Amazon, "A1B2C3").await?;

    let fake = FakeMarketplace::new();
    fake.set_products(vec![product("p-1", "SKU-1", 1, Utc::now())]);
    fake.fail_product_calls(&[503, 429]);

    let services = build_services(db.clone(), &fake);
    let orchestrator = services.state.orchestrator.clone();
    let created = orchestrator
        .create_job(CreateJobRequest::new(
            tenant,
            connection.id,
            JobType::FullImport,
            SyncDomain::Products,
        ))
        .await?;
    orchestrator.wait_for(created.job.id).await;

    let job = orchestrator.get_job(tenant, created.job.id).await?;
    assert_eq!(job.status, "completed");
    assert_eq!(fake.product_calls(), 3);
    Ok(())
}

#[tokio::test]
async fn failed_job_can_be_retried_as_repair() -> Result<()> {
    let db = setup_test_db().await?;
    let tenant = create_test_tenant(&db).await?;
    let connection = insert_connection(&db, tenant, MarketplaceType::Shopify, "acme.myshopify.com").await?;

    let fake = FakeMarketplace::new();
    fake.set_products(vec![product("p-1", "SKU-1", 1, Utc::now())]);
    fake.fail_product_calls(&[400]);

    let services = build_services(db.clone(), &fake);
    let orchestrator = services.state.orchestrator.clone();
    let created = orchestrator
        .create_job(CreateJobRequest::new(
            tenant,
            connection.id,
            JobType::FullImport,
            SyncDomain::Products,
        ))
        .await?;
    orchestrator.wait_for(created.job.id).await;

    let failed = orchestrator.get_job(tenant, created.job.id).await?;
    assert_eq!(failed.status, "failed");
    assert!(failed.error_message.is_some());
    assert_eq!(fake.product_calls(), 1, "client errors are not retried");

    let repair = orchestrator.retry_job(tenant, failed.id).await?;
    assert!(repair.created);
    assert_eq!(repair.job.job_type, "repair");
    assert_eq!(repair.job.parent_job_id, Some(failed.id));
    assert_eq!(repair.job.retry_count, 1);
    orchestrator.wait_for(repair.job.id).await;

    let repaired = orchestrator.get_job(tenant, repair.job.id).await?;
    assert_eq!(repaired.status, "completed");
    assert_eq!(mappings(&db, connection.id, ENTITY_PRODUCT).await?.len(), 1);

    let again = orchestrator.retry_job(tenant, repaired.id).await.unwrap_err();
    assert!(matches!(again, OrchestratorError::InvalidState { .. }));

    let stats = orchestrator.get_stats(tenant).await?;
    assert_eq!(stats.jobs.total, 2);
    assert_eq!(stats.jobs.failed, 1);
    assert_eq!(stats.jobs.completed, 1);
    assert_eq!(stats.active_executions, 0);
    Ok(())
}

#[tokio::test]
async fn idempotency_key_returns_existing_job() -> Result<()> {
    let db = setup_test_db().await?;
    let tenant = create_test_tenant(&db).await?;
    let other_tenant = create_test_tenant(&db).await?;
    let connection = insert_connection(&db, tenant, MarketplaceType::Shopify, "acme.myshopify.com").await?;

    let fake = FakeMarketplace::new();
    let services = build_services(db.clone(), &fake);
    let orchestrator = services.state.orchestrator.clone();

    let mut request =
        CreateJobRequest::new(tenant, connection.id, JobType::FullImport, SyncDomain::Products);
    request.idempotency_key = Some("import-1".to_string());

    let first = orchestrator.create_job(request.clone()).await?;
    orchestrator.wait_for(first.job.id).await;
    let second = orchestrator.create_job(request.clone()).await?;
    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.job.id, second.job.id);

    request.tenant_id = other_tenant;
    let conflict = orchestrator.create_job(request).await.unwrap_err();
    assert!(matches!(conflict, OrchestratorError::IdempotencyConflict(_)));
    Ok(())
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_admission() -> Result<()> {
    let db = setup_test_db().await?;
    let tenant = create_test_tenant(&db).await?;
    let connection = insert_connection(&db, tenant, MarketplaceType::Shopify, "acme.myshopify.com").await?;
    let disconnected = insert_connection_with_status(
        &db,
        tenant,
        MarketplaceType::Dukaan,
        "store-2",
        ConnectionStatus::Disconnected,
    )
    .await?;

    let fake = FakeMarketplace::new();
    let services = build_services(db.clone(), &fake);
    let orchestrator = services.state.orchestrator.clone();

    let reconcile = orchestrator
        .create_job(CreateJobRequest::new(
            tenant,
            connection.id,
            JobType::Reconcile,
            SyncDomain::Inventory,
        ))
        .await
        .unwrap_err();
    assert!(matches!(reconcile, OrchestratorError::Validation(_)));

    let fetch = orchestrator
        .create_job(CreateJobRequest::new(
            tenant,
            connection.id,
            JobType::FetchEntity,
            SyncDomain::Products,
        ))
        .await
        .unwrap_err();
    assert!(matches!(fetch, OrchestratorError::Validation(_)));

    let mut blank = CreateJobRequest::new(tenant, connection.id, JobType::FullImport, SyncDomain::Full);
    blank.idempotency_key = Some("  ".to_string());
    assert!(matches!(
        orchestrator.create_job(blank).await.unwrap_err(),
        OrchestratorError::Validation(_)
    ));

    let not_connected = orchestrator
        .create_job(CreateJobRequest::new(
            tenant,
            disconnected.id,
            JobType::FullImport,
            SyncDomain::Full,
        ))
        .await
        .unwrap_err();
    assert!(matches!(not_connected, OrchestratorError::ConnectionNotConnected(id) if id == disconnected.id));

    let missing = Uuid::new_v4();
    let not_found = orchestrator
        .create_job(CreateJobRequest::new(tenant, missing, JobType::FullImport, SyncDomain::Full))
        .await
        .unwrap_err();
    assert!(matches!(not_found, OrchestratorError::ConnectionNotFound(id) if id == missing));
    Ok(())
}

#[tokio::test]
async fn one_running_job_per_connection() -> Result<()> {
    let db = setup_test_db().await?;
    let tenant = create_test_tenant(&db).await?;
    let connection = insert_connection(&db, tenant, MarketplaceType::Shopify, "acme.myshopify.com").await?;
    let running = insert_running_job(&db, tenant, connection.id).await?;

    let fake = FakeMarketplace::new();
    let services = build_services(db.clone(), &fake);
    let orchestrator = services.state.orchestrator.clone();

    let err = orchestrator
        .create_job(CreateJobRequest::new(
            tenant,
            connection.id,
            JobType::DeltaSync,
            SyncDomain::Full,
        ))
        .await
        .unwrap_err();
    match err {
        OrchestratorError::JobAlreadyRunning {
            connection_id,
            job_id,
        } => {
            assert_eq!(connection_id, connection.id);
            assert_eq!(job_id, running.id);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn cancel_is_terminal() -> Result<()> {
    let db = setup_test_db().await?;
    let tenant = create_test_tenant(&db).await?;
    let connection = insert_connection(&db, tenant, MarketplaceType::Shopify, "acme.myshopify.com").await?;
    let running = insert_running_job(&db, tenant, connection.id).await?;

    let fake = FakeMarketplace::new();
    let services = build_services(db.clone(), &fake);
    let orchestrator = services.state.orchestrator.clone();

    let cancelled = orchestrator.cancel_job(tenant, running.id).await?;
    assert_eq!(cancelled.status, "cancelled");
    assert!(cancelled.completed_at.is_some());

    let again = orchestrator.cancel_job(tenant, running.id).await.unwrap_err();
    assert!(matches!(again, OrchestratorError::InvalidState { .. }));

    let foreign = create_test_tenant(&db).await?;
    let hidden = orchestrator.get_job(foreign, running.id).await.unwrap_err();
    assert!(matches!(hidden, OrchestratorError::JobNotFound(_)));
    Ok(())
}

#[tokio::test]
async fn fetch_entity_syncs_only_the_target() -> Result<()> {
    let db = setup_test_db().await?;
    let tenant = create_test_tenant(&db).await?;
    let connection = insert_connection(&db, tenant, MarketplaceType::Shopify, "acme.myshopify.com").await?;

    let fake = FakeMarketplace::new();
    let now = Utc::now();
    fake.set_products(vec![
        product("p-1", "SKU-1", 1, now),
        product("p-2", "SKU-2", 2, now),
    ]);

    let services = build_services(db.clone(), &fake);
    let orchestrator = services.state.orchestrator.clone();

    let mut request =
        CreateJobRequest::new(tenant, connection.id, JobType::FetchEntity, SyncDomain::Products);
    request.target_entity_id = Some("p-2".to_string());
    let created = orchestrator.create_job(request).await?;
    orchestrator.wait_for(created.job.id).await;

    let job = orchestrator.get_job(tenant, created.job.id).await?;
    assert_eq!(job.status, "completed");
    assert_eq!(job.total_items, 1);

    let products = mappings(&db, connection.id, ENTITY_PRODUCT).await?;
    assert_eq!(products.len(), 1);
    assert_eq!(products[0].external_id, "p-2");
    Ok(())
}

#[tokio::test]
async fn job_logs_record_lifecycle() -> Result<()> {
    let db = setup_test_db().await?;
    let tenant = create_test_tenant(&db).await?;
    let connection = insert_connection(&db, tenant, MarketplaceType::Shopify, "acme.myshopify.com").await?;

    let fake = FakeMarketplace::new();
    let services = build_services(db.clone(), &fake);
    let orchestrator = services.state.orchestrator.clone();
    let created = orchestrator
        .create_job(CreateJobRequest::new(
            tenant,
            connection.id,
            JobType::FullImport,
            SyncDomain::Products,
        ))
        .await?;
    orchestrator.wait_for(created.job.id).await;

    let logs = orchestrator.get_job_logs(tenant, created.job.id, None).await?;
    let messages: Vec<&str> = logs.iter().map(|l| l.message.as_str()).collect();
    assert_eq!(messages.first(), Some(&"job started"));
    assert_eq!(messages.last(), Some(&"job completed"));
    assert!(messages.contains(&"syncing products"));
    Ok(())
}

#[tokio::test]
async fn interrupted_jobs_are_failed_on_recovery() -> Result<()> {
    let db = setup_test_db().await?;
    let tenant = create_test_tenant(&db).await?;
    let connection = insert_connection(&db, tenant, MarketplaceType::Shopify, "acme.myshopify.com").await?;
    let running = insert_running_job(&db, tenant, connection.id).await?;

    let fake = FakeMarketplace::new();
    let services = build_services(db.clone(), &fake);
    let orchestrator = services.state.orchestrator.clone();

    assert_eq!(orchestrator.recover_interrupted_jobs().await?, 1);
    let job = orchestrator.get_job(tenant, running.id).await?;
    assert_eq!(job.status, "failed");
    assert!(job.error_message.is_some_and(|m| m.contains("interrupted")));

    let retry = orchestrator.retry_job(tenant, running.id).await?;
    orchestrator.wait_for(retry.job.id).await;
    assert_eq!(
        orchestrator.get_job(tenant, retry.job.id).await?.status,
        "completed"
    );
    Ok(())
}

#[tokio::test]
async fn item_failures_are_counted_without_failing_the_job() -> Result<()> {
    let db = setup_test_db().await?;
    let tenant = create_test_tenant(&db).await?;
    let connection = insert_connection(&db, tenant, MarketplaceType::Shopify, "acme.myshopify.com").await?;

    let mut untitled = product("p-2", "SKU-2", 4, Utc::now());
    untitled.title = String::new();
    let fake = FakeMarketplace::new();
    fake.set_products(vec![product("p-1", "SKU-1", 3, Utc::now()), untitled]);

    let services = build_services(db.clone(), &fake);
    let orchestrator = services.state.orchestrator.clone();
    let created = orchestrator
        .create_job(CreateJobRequest::new(
            tenant,
            connection.id,
            JobType::FullImport,
            SyncDomain::Products,
        ))
        .await?;
    orchestrator.wait_for(created.job.id).await;

    let job = orchestrator.get_job(tenant, created.job.id).await?;
    assert_eq!(job.status, "completed");
    assert_eq!(job.processed_items, 2);
    assert_eq!(job.succeeded_items, 1);
    assert_eq!(job.failed_items, 1);
    assert!(job.error_message.is_none());

    let mapped = mappings(&db, connection.id, ENTITY_PRODUCT).await?;
    assert_eq!(mapped.len(), 1);
    assert_eq!(mapped[0].external_id, "p-1");

    let logs = orchestrator.get_job_logs(tenant, job.id, None).await?;
    let failure = logs
        .iter()
        .find(|log| log.message == "item failed")
        .expect("item failure is logged");
    assert_eq!(failure.level, "warn");
    Ok(())
}

#[tokio::test]
async fn job_fails_when_every_item_fails() -> Result<()> {
    let db = setup_test_db().await?;
    let tenant = create_test_tenant(&db).await?;
    let connection = insert_connection(&db, tenant, MarketplaceType::Shopify, "acme.myshopify.com").await?;

    let broken: Vec<_> = ["p-1", "p-2"]
        .into_iter()
        .map(|id| {
            let mut product = product(id, "SKU-1", 1, Utc::now());
            product.title = " ".to_string();
            product
        })
        .collect();
    let fake = FakeMarketplace::new();
    fake.set_products(broken);

    let services = build_services(db.clone(), &fake);
    let orchestrator = services.state.orchestrator.clone();
    let created = orchestrator
        .create_job(CreateJobRequest::new(
            tenant,
            connection.id,
            JobType::FullImport,
            SyncDomain::Products,
        ))
        .await?;
    orchestrator.wait_for(created.job.id).await;

    let job = orchestrator.get_job(tenant, created.job.id).await?;
    assert_eq!(job.status, "failed");
    assert_eq!(job.processed_items, 2);
    assert_eq!(job.failed_items, 2);
    assert_eq!(job.error_message.as_deref(), Some("all 2 items failed"));
    assert!(mappings(&db, connection.id, ENTITY_PRODUCT).await?.is_empty());

    let connection = MarketplaceConnection::find_by_id(connection.id)
        .one(&db)
        .await?
        .expect("connection exists");
    assert!(connection.last_sync_at.is_none(), "failed runs do not advance the sync clock");
    Ok(())
}

#[tokio::test]
async fn job_exceeding_its_timeout_is_failed() -> Result<()> {
    let db = setup_test_db().await?;
    let tenant = create_test_tenant(&db).await?;
    let connection = insert_connection(&db, tenant, MarketplaceType::Shopify, "acme.myshopify.com").await?;

    let fake = FakeMarketplace::new();
    fake.set_products(vec![product("p-1", "SKU-1", 1, Utc::now())]);
    fake.delay_product_calls(std::time::Duration::from_secs(30));

    let mut config = test_config();
    config.concurrency.job_timeout_seconds = 1;
    let services = build_services_with(config, db.clone(), &fake);
    let orchestrator = services.state.orchestrator.clone();
    let created = orchestrator
        .create_job(CreateJobRequest::new(
            tenant,
            connection.id,
            JobType::FullImport,
            SyncDomain::Products,
        ))
        .await?;
    orchestrator.wait_for(created.job.id).await;

    let job = orchestrator.get_job(tenant, created.job.id).await?;
    assert_eq!(job.status, "failed");
    assert_eq!(job.error_message.as_deref(), Some("job exceeded timeout of 1s"));
    assert!(job.completed_at.is_some());
    assert_eq!(orchestrator.get_stats(tenant).await?.active_executions, 0);
    Ok(())
}

#[tokio::test]
async fn concurrent_submissions_with_one_key_create_one_job() -> Result<()> {
    let db = setup_test_db().await?;
    let tenant = create_test_tenant(&db).await?;
    let connection = insert_connection(&db, tenant, MarketplaceType::Shopify, "acme.myshopify.com").await?;

    let fake = FakeMarketplace::new();
    fake.set_products(vec![product("p-1", "SKU-1", 1, Utc::now())]);
    let services = build_services(db.clone(), &fake);
    let orchestrator = services.state.orchestrator.clone();

    let mut request =
        CreateJobRequest::new(tenant, connection.id, JobType::FullImport, SyncDomain::Products);
    request.idempotency_key = Some("nightly-import".to_string());

    let (first, second) = tokio::join!(
        orchestrator.create_job(request.clone()),
        orchestrator.create_job(request.clone()),
    );
    let (first, second) = (first?, second?);
    assert_eq!(first.job.id, second.job.id);
    assert_eq!(
        [first.created, second.created].iter().filter(|created| **created).count(),
        1
    );
    orchestrator.wait_for(first.job.id).await;

    let jobs = SyncJob::find()
        .filter(sync_job::Column::IdempotencyKey.eq("nightly-import"))
        .all(&db)
        .await?;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, "completed");
    Ok(())
}

#[tokio::test]
async fn shutdown_stops_running_jobs_at_the_next_page() -> Result<()> {
    let db = setup_test_db().await?;
    let tenant = create_test_tenant(&db).await?;
    let connection = insert_connection(&db, tenant, MarketplaceType::Shopify, "acme.myshopify.com").await?;

    let fake = FakeMarketplace::new();
    fake.set_products(vec![
        product("p-1", "SKU-1", 1, Utc::now()),
        product("p-2", "SKU-2", 1, Utc::now()),
    ]);
    fake.set_page_size(1);
    fake.delay_product_calls(std::time::Duration::from_millis(300));

    let services = build_services(db.clone(), &fake);
    let orchestrator = services.state.orchestrator.clone();
    let created = orchestrator
        .create_job(CreateJobRequest::new(
            tenant,
            connection.id,
            JobType::FullImport,
            SyncDomain::Products,
        ))
        .await?;
    while fake.product_calls() == 0 {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    orchestrator.shutdown().await;

    let job = orchestrator.get_job(tenant, created.job.id).await?;
    assert_eq!(job.status, "cancelled");
    assert_eq!(job.processed_items, 1);
    assert_eq!(fake.product_calls(), 1);
    Ok(())
}
