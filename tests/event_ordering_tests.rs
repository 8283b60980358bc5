//! Event ordering guard against a real (SQLite) version store.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use chrono::Utc;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use uuid::Uuid;

use marketplace_sync::config::EventOrderingConfig;
use marketplace_sync::event_ordering::{
    EventOrderingGuard, OrderedEvent, OrderingDecision, OrderingError, OrderingOutcome,
};
use marketplace_sync::models::out_of_order_event;
use marketplace_sync::models::{EventVersion, OutOfOrderEvent};

#[path = "test_utils/mod.rs"]
mod test_utils;
use test_utils::setup_test_db;

fn event(tenant_id: Uuid, entity_id: &str, event_id: &str, version: Option<i64>) -> OrderedEvent {
    OrderedEvent {
        tenant_id,
        entity_type: "product".to_string(),
        entity_id: entity_id.to_string(),
        event_id: event_id.to_string(),
        event_time: Utc::now(),
        version,
        payload: Some(serde_json::json!({ "event": event_id })),
    }
}

fn guard(db: sea_orm::DatabaseConnection) -> EventOrderingGuard {
    EventOrderingGuard::new(db, &EventOrderingConfig::default())
}

async fn apply(
    guard: &EventOrderingGuard,
    event: OrderedEvent,
    applied: &Arc<AtomicUsize>,
) -> Result<OrderingOutcome<()>, OrderingError> {
    let applied = applied.clone();
    guard
        .process_event_with_ordering(&event, move |_| async move {
            applied.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
}

#[tokio::test]
async fn versions_apply_once_and_in_order() -> Result<()> {
    let db = setup_test_db().await?;
    let guard = guard(db.clone());
    let tenant = Uuid::new_v4();
    let applied = Arc::new(AtomicUsize::new(0));

    assert!(matches!(
        apply(&guard, event(tenant, "p-1", "e5", Some(5)), &applied).await?,
        OrderingOutcome::Processed(())
    ));
    assert!(matches!(
        apply(&guard, event(tenant, "p-1", "e5-again", Some(5)), &applied).await?,
        OrderingOutcome::Duplicate
    ));
    assert!(matches!(
        apply(&guard, event(tenant, "p-1", "e3", Some(3)), &applied).await?,
        OrderingOutcome::Buffered {
            current_version: 5,
            ..
        }
    ));
    assert!(matches!(
        apply(&guard, event(tenant, "p-1", "e6", Some(6)), &applied).await?,
        OrderingOutcome::Processed(())
    ));
    assert_eq!(applied.load(Ordering::SeqCst), 2);

    let stored = EventVersion::find().all(&db).await?;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].version, 6);
    assert_eq!(stored[0].last_event_id, "e6");
    Ok(())
}

#[tokio::test]
async fn first_event_for_entity_is_processed() -> Result<()> {
    let db = setup_test_db().await?;
    let guard = guard(db);
    let decision = guard
        .check_event(&event(Uuid::new_v4(), "p-9", "e1", Some(1)))
        .await?;
    assert_eq!(decision, OrderingDecision::First);
    Ok(())
}

#[tokio::test]
async fn entities_and_tenants_are_tracked_separately() -> Result<()> {
    let db = setup_test_db().await?;
    let guard = guard(db);
    let tenant_a = Uuid::new_v4();
    let tenant_b = Uuid::new_v4();

    guard
        .record_event_processed(&event(tenant_a, "p-1", "a1", Some(10)))
        .await?;

    let same_entity_other_tenant = guard
        .check_event(&event(tenant_b, "p-1", "b1", Some(1)))
        .await?;
    assert!(same_entity_other_tenant.should_process());

    let other_entity = guard
        .check_event(&event(tenant_a, "p-2", "a2", Some(1)))
        .await?;
    assert!(other_entity.should_process());
    Ok(())
}

#[tokio::test]
async fn processor_failure_leaves_version_untouched() -> Result<()> {
    let db = setup_test_db().await?;
    let guard = guard(db.clone());
    let tenant = Uuid::new_v4();

    let result = guard
        .process_event_with_ordering(&event(tenant, "p-1", "e1", Some(1)), |_| async {
            Err::<(), _>(anyhow::anyhow!("downstream unavailable"))
        })
        .await;
    assert!(matches!(result, Err(OrderingError::Processor(_))));
    assert!(EventVersion::find().all(&db).await?.is_empty());

    let retry = guard
        .check_event(&event(tenant, "p-1", "e1", Some(1)))
        .await?;
    assert_eq!(retry, OrderingDecision::First);
    Ok(())
}

#[tokio::test]
async fn replay_supersedes_stale_events_and_applies_valid_ones() -> Result<()> {
    let db = setup_test_db().await?;
    let guard = guard(db.clone());
    let tenant = Uuid::new_v4();

    guard
        .record_event_processed(&event(tenant, "p-1", "e5", Some(5)))
        .await?;
    guard
        .buffer_out_of_order_event(&event(tenant, "p-1", "e4", Some(4)), 5)
        .await?;

    // No stored version for p-2 any more, so its buffered event applies.
    guard
        .buffer_out_of_order_event(&event(tenant, "p-2", "e2", Some(2)), 3)
        .await?;

    let replayed = Arc::new(AtomicUsize::new(0));
    let counter = replayed.clone();
    let stats = guard
        .process_pending_out_of_order_events(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await?;

    assert_eq!(stats.examined, 2);
    assert_eq!(stats.superseded, 1);
    assert_eq!(stats.applied, 1);
    assert_eq!(replayed.load(Ordering::SeqCst), 1);

    let pending = OutOfOrderEvent::find()
        .filter(out_of_order_event::Column::Status.eq(out_of_order_event::STATUS_PENDING))
        .all(&db)
        .await?;
    assert!(pending.is_empty());

    let second_pass = guard.process_pending_out_of_order_events(|_| async { Ok(()) }).await?;
    assert_eq!(second_pass.examined, 0);
    Ok(())
}

#[tokio::test]
async fn cache_cleanup_reads_through_to_store() -> Result<()> {
    let db = setup_test_db().await?;
    let guard = guard(db);
    let tenant = Uuid::new_v4();

    guard
        .record_event_processed(&event(tenant, "p-1", "e2", Some(2)))
        .await?;
    guard
        .check_event(&event(tenant, "p-1", "e3", Some(3)))
        .await?;
    assert_eq!(guard.cached_entries(), 1);

    assert_eq!(guard.cleanup_cache(), 1);
    assert_eq!(guard.cached_entries(), 0);

    let decision = guard
        .check_event(&event(tenant, "p-1", "e1", Some(1)))
        .await?;
    assert_eq!(decision, OrderingDecision::OutOfOrder { current_version: 2 });
    Ok(())
}
