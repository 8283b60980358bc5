//! Inventory ledger behaviour against a real (SQLite) store.

use anyhow::Result;
use uuid::Uuid;

use marketplace_sync::inventory::{
    InventoryLedger, LedgerContext, LedgerError, NewInventory, SOURCE_MANUAL,
    SOURCE_MARKETPLACE_SYNC,
};
use marketplace_sync::models::inventory_ledger::TransactionType;

#[path = "test_utils/mod.rs"]
mod test_utils;
use test_utils::{create_test_tenant, setup_test_db};

fn new_row(tenant_id: Uuid, initial_quantity: i64) -> NewInventory {
    NewInventory {
        tenant_id,
        offer_id: Uuid::new_v4(),
        location_id: Uuid::new_v4(),
        sku: Some("SKU-1".to_string()),
        initial_quantity,
        low_stock_threshold: 2,
        reorder_point: 5,
    }
}

fn manual() -> LedgerContext {
    LedgerContext::new(SOURCE_MANUAL).created_by("tester")
}

#[tokio::test]
async fn create_books_initial_quantity_as_receive() -> Result<()> {
    let db = setup_test_db().await?;
    let tenant = create_test_tenant(&db).await?;
    let ledger = InventoryLedger::new(db);

    let created = ledger.create(new_row(tenant, 10), manual()).await?;
    assert_eq!(created.inventory.quantity_on_hand, 10);
    assert_eq!(created.inventory.quantity_reserved, 0);

    let entry = created.entry.expect("initial quantity is booked");
    assert_eq!(entry.transaction_type, "RECEIVE");
    assert_eq!(entry.sequence, 1);
    assert_eq!(entry.quantity_before, 0);
    assert_eq!(entry.quantity_after, 10);
    assert_eq!(entry.created_by.as_deref(), Some("tester"));
    Ok(())
}

#[tokio::test]
async fn duplicate_offer_location_is_rejected() -> Result<()> {
    let db = setup_test_db().await?;
    let tenant = create_test_tenant(&db).await?;
    let ledger = InventoryLedger::new(db);

    let params = new_row(tenant, 0);
    let first = ledger.create(params.clone(), manual()).await?;
    assert!(first.entry.is_none());

    let err = ledger.create(params, manual()).await.unwrap_err();
    assert!(matches!(err, LedgerError::AlreadyExists { .. }));
    Ok(())
}

#[tokio::test]
async fn reserve_fails_without_writing_when_stock_is_short() -> Result<()> {
    let db = setup_test_db().await?;
    let tenant = create_test_tenant(&db).await?;
    let ledger = InventoryLedger::new(db);

    let row = ledger.create(new_row(tenant, 5), manual()).await?.inventory;
    ledger.reserve(tenant, row.id, 3, manual()).await?;

    let err = ledger.reserve(tenant, row.id, 3, manual()).await.unwrap_err();
    match err {
        LedgerError::InsufficientStock {
            requested,
            available,
        } => {
            assert_eq!(requested, 3);
            assert_eq!(available, 2);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let current = ledger.get(tenant, row.id).await?;
    assert_eq!(current.quantity_reserved, 3);
    let entries = ledger.list_ledger(tenant, row.id, None, None).await?;
    assert_eq!(entries.len(), 2);
    Ok(())
}

#[tokio::test]
async fn release_clamps_reserved_at_zero() -> Result<()> {
    let db = setup_test_db().await?;
    let tenant = create_test_tenant(&db).await?;
    let ledger = InventoryLedger::new(db);

    let row = ledger.create(new_row(tenant, 8), manual()).await?.inventory;
    ledger.reserve(tenant, row.id, 2, manual()).await?;

    let released = ledger.release(tenant, row.id, 5, manual()).await?;
    assert_eq!(released.inventory.quantity_reserved, 0);
    let entry = released.entry.expect("release is recorded");
    assert_eq!(entry.requested_change, -5);
    assert_eq!(entry.quantity_change, -2);
    assert_eq!(entry.bucket, "reserved");
    Ok(())
}

#[tokio::test]
async fn adjust_clamps_on_hand_and_records_requested_change() -> Result<()> {
    let db = setup_test_db().await?;
    let tenant = create_test_tenant(&db).await?;
    let ledger = InventoryLedger::new(db);

    let row = ledger.create(new_row(tenant, 4), manual()).await?.inventory;
    let adjusted = ledger
        .adjust(tenant, row.id, -10, TransactionType::Adjust, manual())
        .await?;
    assert_eq!(adjusted.inventory.quantity_on_hand, 0);

    let entry = adjusted.entry.expect("adjustment is recorded");
    assert_eq!(entry.requested_change, -10);
    assert_eq!(entry.quantity_change, -4);

    let zero = ledger
        .adjust(tenant, row.id, 0, TransactionType::Adjust, manual())
        .await
        .unwrap_err();
    assert!(matches!(zero, LedgerError::InvalidQuantity(_)));
    Ok(())
}

#[tokio::test]
async fn out_of_range_changes_are_rejected_without_writing() -> Result<()> {
    let db = setup_test_db().await?;
    let tenant = create_test_tenant(&db).await?;
    let ledger = InventoryLedger::new(db);

    let row = ledger.create(new_row(tenant, 10), manual()).await?.inventory;

    let err = ledger
        .adjust(tenant, row.id, i64::MAX, TransactionType::Adjust, manual())
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidQuantity(_)));

    let err = ledger
        .sync_from_marketplace(tenant, row.id, i64::MIN, LedgerContext::new(SOURCE_MARKETPLACE_SYNC))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidQuantity(_)));

    let current = ledger.get(tenant, row.id).await?;
    assert_eq!(current.quantity_on_hand, 10);
    assert_eq!(ledger.list_ledger(tenant, row.id, None, None).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn shift_available_never_uncovers_reserved_units() -> Result<()> {
    let db = setup_test_db().await?;
    let tenant = create_test_tenant(&db).await?;
    let ledger = InventoryLedger::new(db);

    let row = ledger.create(new_row(tenant, 10), manual()).await?.inventory;
    ledger.reserve(tenant, row.id, 7, manual()).await?;

    let drained = ledger.shift_available(tenant, row.id, -9, manual()).await?;
    assert_eq!(drained.inventory.quantity_on_hand, 7);
    assert_eq!(drained.inventory.available(), 0);
    let entry = drained.entry.expect("reduction is recorded");
    assert_eq!(entry.transaction_type, "SYNC");
    assert_eq!(entry.requested_change, -9);
    assert_eq!(entry.quantity_change, -3);

    let nothing_left = ledger.shift_available(tenant, row.id, -1, manual()).await?;
    assert!(nothing_left.entry.is_none());

    let raised = ledger.shift_available(tenant, row.id, 4, manual()).await?;
    assert_eq!(raised.inventory.quantity_on_hand, 11);
    assert_eq!(raised.inventory.available(), 4);
    Ok(())
}

#[tokio::test]
async fn ledger_entries_replay_to_current_quantities() -> Result<()> {
    let db = setup_test_db().await?;
    let tenant = create_test_tenant(&db).await?;
    let ledger = InventoryLedger::new(db);

    let row = ledger.create(new_row(tenant, 20), manual()).await?.inventory;
    ledger
        .adjust(tenant, row.id, -3, TransactionType::Adjust, manual())
        .await?;
    ledger.reserve(tenant, row.id, 6, manual()).await?;
    ledger
        .adjust(tenant, row.id, 7, TransactionType::Receive, manual())
        .await?;
    ledger.release(tenant, row.id, 2, manual()).await?;
    ledger
        .sync_from_marketplace(
            tenant,
            row.id,
            15,
            LedgerContext::new(SOURCE_MARKETPLACE_SYNC),
        )
        .await?;

    let current = ledger.get(tenant, row.id).await?;
    let entries = ledger.list_ledger(tenant, row.id, None, None).await?;

    let sequences: Vec<i64> = entries.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5, 6]);

    let on_hand: i64 = entries
        .iter()
        .filter(|e| e.bucket == "on_hand")
        .map(|e| e.quantity_change)
        .sum();
    let reserved: i64 = entries
        .iter()
        .filter(|e| e.bucket == "reserved")
        .map(|e| e.quantity_change)
        .sum();
    assert_eq!(on_hand, current.quantity_on_hand);
    assert_eq!(reserved, current.quantity_reserved);
    assert_eq!(current.quantity_on_hand, 15);
    assert_eq!(current.available(), 11);
    Ok(())
}

#[tokio::test]
async fn marketplace_sync_without_change_writes_nothing() -> Result<()> {
    let db = setup_test_db().await?;
    let tenant = create_test_tenant(&db).await?;
    let ledger = InventoryLedger::new(db);

    let row = ledger.create(new_row(tenant, 9), manual()).await?.inventory;
    let synced = ledger
        .sync_from_marketplace(tenant, row.id, 9, LedgerContext::new(SOURCE_MARKETPLACE_SYNC))
        .await?;
    assert!(synced.entry.is_none());
    assert_eq!(ledger.list_ledger(tenant, row.id, None, None).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn rows_are_invisible_to_other_tenants() -> Result<()> {
    let db = setup_test_db().await?;
    let tenant = create_test_tenant(&db).await?;
    let other = create_test_tenant(&db).await?;
    let ledger = InventoryLedger::new(db);

    let row = ledger.create(new_row(tenant, 1), manual()).await?.inventory;
    let err = ledger.reserve(other, row.id, 1, manual()).await.unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(id) if id == row.id));
    Ok(())
}
