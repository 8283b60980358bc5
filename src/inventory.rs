//! # Inventory Ledger
//!
//! Every quantity change on an `inventory_current` row happens inside one
//! transaction that locks the row, writes the new quantities and appends one
//! immutable `inventory_ledger` entry. Summing `quantity_change` over a row's
//! `on_hand` entries in sequence order reproduces its current on-hand value.

use chrono::Utc;
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, DbErr, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::models::inventory_current::{self, Entity as InventoryCurrentEntity};
use crate::models::inventory_ledger::{
    self, Bucket, Entity as InventoryLedgerEntity, TransactionType,
};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("inventory record {0} not found")]
    NotFound(Uuid),
    #[error("inventory record already exists for offer {offer_id} at location {location_id}")]
    AlreadyExists { offer_id: Uuid, location_id: Uuid },
    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),
    #[error("insufficient stock: requested {requested}, available {available}")]
    InsufficientStock { requested: i64, available: i64 },
    #[error("inventory store error: {0}")]
    Database(#[from] DbErr),
}

/// Attribution recorded on the ledger entry of a mutation.
#[derive(Debug, Clone, Default)]
pub struct LedgerContext {
    pub source: String,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
    pub notes: Option<String>,
    pub created_by: Option<String>,
}

impl LedgerContext {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }

    pub fn with_reference(mut self, reference_type: impl Into<String>, reference_id: impl Into<String>) -> Self {
        self.reference_type = Some(reference_type.into());
        self.reference_id = Some(reference_id.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn created_by(mut self, actor: impl Into<String>) -> Self {
        self.created_by = Some(actor.into());
        self
    }
}

pub const SOURCE_MANUAL: &str = "manual";
pub const SOURCE_MARKETPLACE_SYNC: &str = "marketplace_sync";
pub const SOURCE_RECONCILIATION: &str = "reconciliation";

/// Parameters for a new stock row.
#[derive(Debug, Clone)]
pub struct NewInventory {
    pub tenant_id: Uuid,
    pub offer_id: Uuid,
    pub location_id: Uuid,
    pub sku: Option<String>,
    pub initial_quantity: i64,
    pub low_stock_threshold: i64,
    pub reorder_point: i64,
}

/// Row state after a mutation, plus the entry it appended.
///
/// `entry` is `None` only for a marketplace sync that found nothing to change.
#[derive(Debug, Clone)]
pub struct LedgerMutation {
    pub inventory: inventory_current::Model,
    pub entry: Option<inventory_ledger::Model>,
}

#[derive(Clone)]
pub struct InventoryLedger {
    db: DatabaseConnection,
}

impl InventoryLedger {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Creates a stock row. A positive initial quantity is booked as a
    /// `RECEIVE` entry so the ledger covers the whole on-hand value.
    #[instrument(skip(self, params, ctx), fields(tenant_id = %params.tenant_id, offer_id = %params.offer_id))]
    pub async fn create(
        &self,
        params: NewInventory,
        ctx: LedgerContext,
    ) -> Result<LedgerMutation, LedgerError> {
        if params.initial_quantity < 0 {
            return Err(LedgerError::InvalidQuantity(
                "initial quantity must not be negative".into(),
            ));
        }
        if params.low_stock_threshold < 0 || params.reorder_point < 0 {
            return Err(LedgerError::InvalidQuantity(
                "thresholds must not be negative".into(),
            ));
        }

        let txn = self.db.begin().await?;
        if find_by_offer_location(&txn, params.tenant_id, params.offer_id, params.location_id)
            .await?
            .is_some()
        {
            return Err(LedgerError::AlreadyExists {
                offer_id: params.offer_id,
                location_id: params.location_id,
            });
        }

        let row = insert_row(&txn, &params).await?;
        let mutation = if params.initial_quantity > 0 {
            apply(
                &txn,
                row,
                Bucket::OnHand,
                TransactionType::Receive,
                params.initial_quantity,
                params.initial_quantity,
                &ctx,
            )
            .await?
        } else {
            LedgerMutation {
                inventory: row,
                entry: None,
            }
        };
        txn.commit().await?;

        info!(inventory_id = %mutation.inventory.id, quantity = params.initial_quantity, "created inventory record");
        Ok(mutation)
    }

    /// Returns the row for (offer, location), creating an empty one if absent.
    pub async fn ensure_row(
        &self,
        tenant_id: Uuid,
        offer_id: Uuid,
        location_id: Uuid,
        sku: Option<String>,
    ) -> Result<inventory_current::Model, LedgerError> {
        let txn = self.db.begin().await?;
        let row = match find_by_offer_location(&txn, tenant_id, offer_id, location_id).await? {
            Some(row) => row,
            None => {
                insert_row(
                    &txn,
                    &NewInventory {
                        tenant_id,
                        offer_id,
                        location_id,
                        sku,
                        initial_quantity: 0,
                        low_stock_threshold: 0,
                        reorder_point: 0,
                    },
                )
                .await?
            }
        };
        txn.commit().await?;
        Ok(row)
    }

    /// Applies `delta` to on-hand. Results below zero are clamped to zero and
    /// the entry records both the requested and the applied change.
    #[instrument(skip(self, ctx), fields(tenant_id = %tenant_id, inventory_id = %inventory_id))]
    pub async fn adjust(
        &self,
        tenant_id: Uuid,
        inventory_id: Uuid,
        delta: i64,
        transaction_type: TransactionType,
        ctx: LedgerContext,
    ) -> Result<LedgerMutation, LedgerError> {
        if delta == 0 {
            return Err(LedgerError::InvalidQuantity(
                "adjustment must be non-zero".into(),
            ));
        }

        let txn = self.db.begin().await?;
        let row = lock_row(&txn, tenant_id, inventory_id).await?;
        let target = row
            .quantity_on_hand
            .checked_add(delta)
            .ok_or_else(|| out_of_range("adjustment"))?
            .max(0);
        let mutation = apply(&txn, row, Bucket::OnHand, transaction_type, delta, target, &ctx).await?;
        txn.commit().await?;
        Ok(mutation)
    }

    /// Reserves `quantity` units, failing without any write if fewer are available.
    #[instrument(skip(self, ctx), fields(tenant_id = %tenant_id, inventory_id = %inventory_id))]
    pub async fn reserve(
        &self,
        tenant_id: Uuid,
        inventory_id: Uuid,
        quantity: i64,
        ctx: LedgerContext,
    ) -> Result<LedgerMutation, LedgerError> {
        if quantity <= 0 {
            return Err(LedgerError::InvalidQuantity(
                "reservation quantity must be positive".into(),
            ));
        }

        let txn = self.db.begin().await?;
        let row = lock_row(&txn, tenant_id, inventory_id).await?;
        let available = row.quantity_on_hand - row.quantity_reserved;
        if available < quantity {
            counter!("inventory_reservations_rejected_total").increment(1);
            debug!(requested = quantity, available, "reservation rejected");
            return Err(LedgerError::InsufficientStock {
                requested: quantity,
                available: available.max(0),
            });
        }

        let target = row
            .quantity_reserved
            .checked_add(quantity)
            .ok_or_else(|| out_of_range("reservation"))?;
        let mutation = apply(
            &txn,
            row,
            Bucket::Reserved,
            TransactionType::Reserve,
            quantity,
            target,
            &ctx,
        )
        .await?;
        txn.commit().await?;
        Ok(mutation)
    }

    /// Releases up to `quantity` reserved units; reserved never drops below zero.
    #[instrument(skip(self, ctx), fields(tenant_id = %tenant_id, inventory_id = %inventory_id))]
    pub async fn release(
        &self,
        tenant_id: Uuid,
        inventory_id: Uuid,
        quantity: i64,
        ctx: LedgerContext,
    ) -> Result<LedgerMutation, LedgerError> {
        if quantity <= 0 {
            return Err(LedgerError::InvalidQuantity(
                "release quantity must be positive".into(),
            ));
        }

        let txn = self.db.begin().await?;
        let row = lock_row(&txn, tenant_id, inventory_id).await?;
        let target = (row.quantity_reserved - quantity).max(0);
        let mutation = apply(
            &txn,
            row,
            Bucket::Reserved,
            TransactionType::Release,
            -quantity,
            target,
            &ctx,
        )
        .await?;
        txn.commit().await?;
        Ok(mutation)
    }

    /// Sets on-hand to the quantity the marketplace reports.
    #[instrument(skip(self, ctx), fields(tenant_id = %tenant_id, inventory_id = %inventory_id))]
    pub async fn sync_from_marketplace(
        &self,
        tenant_id: Uuid,
        inventory_id: Uuid,
        external_quantity: i64,
        ctx: LedgerContext,
    ) -> Result<LedgerMutation, LedgerError> {
        let txn = self.db.begin().await?;
        let row = lock_row(&txn, tenant_id, inventory_id).await?;
        let requested = external_quantity
            .checked_sub(row.quantity_on_hand)
            .ok_or_else(|| out_of_range("marketplace quantity"))?;
        let target = external_quantity.max(0);

        if target == row.quantity_on_hand {
            txn.commit().await?;
            return Ok(LedgerMutation {
                inventory: row,
                entry: None,
            });
        }

        let mutation = apply(
            &txn,
            row,
            Bucket::OnHand,
            TransactionType::Sync,
            requested,
            target,
            &ctx,
        )
        .await?;
        txn.commit().await?;
        Ok(mutation)
    }

    /// Moves the row's available quantity by up to `delta` with a `SYNC`
    /// entry. Reductions stop once nothing is available, so reserved units
    /// stay covered by on-hand stock. The change actually made is the
    /// entry's `quantity_change`; no entry is written when it is zero.
    #[instrument(skip(self, ctx), fields(tenant_id = %tenant_id, inventory_id = %inventory_id))]
    pub async fn shift_available(
        &self,
        tenant_id: Uuid,
        inventory_id: Uuid,
        delta: i64,
        ctx: LedgerContext,
    ) -> Result<LedgerMutation, LedgerError> {
        let txn = self.db.begin().await?;
        let row = lock_row(&txn, tenant_id, inventory_id).await?;
        let applied = if delta >= 0 {
            delta
        } else {
            delta.max(-row.available())
        };
        if applied == 0 {
            txn.commit().await?;
            return Ok(LedgerMutation {
                inventory: row,
                entry: None,
            });
        }

        let target = row
            .quantity_on_hand
            .checked_add(applied)
            .ok_or_else(|| out_of_range("adjustment"))?;
        let mutation = apply(
            &txn,
            row,
            Bucket::OnHand,
            TransactionType::Sync,
            delta,
            target,
            &ctx,
        )
        .await?;
        txn.commit().await?;
        Ok(mutation)
    }

    pub async fn get(
        &self,
        tenant_id: Uuid,
        inventory_id: Uuid,
    ) -> Result<inventory_current::Model, LedgerError> {
        InventoryCurrentEntity::find_by_id(inventory_id)
            .filter(inventory_current::Column::TenantId.eq(tenant_id))
            .one(&self.db)
            .await?
            .ok_or(LedgerError::NotFound(inventory_id))
    }

    /// All stock rows for an offer, across locations.
    pub async fn find_by_offer(
        &self,
        tenant_id: Uuid,
        offer_id: Uuid,
    ) -> Result<Vec<inventory_current::Model>, LedgerError> {
        Ok(InventoryCurrentEntity::find()
            .filter(inventory_current::Column::TenantId.eq(tenant_id))
            .filter(inventory_current::Column::OfferId.eq(offer_id))
            .all(&self.db)
            .await?)
    }

    /// Ledger entries for a row, oldest first.
    pub async fn list_ledger(
        &self,
        tenant_id: Uuid,
        inventory_id: Uuid,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<inventory_ledger::Model>, LedgerError> {
        self.get(tenant_id, inventory_id).await?;

        let mut query = InventoryLedgerEntity::find()
            .filter(inventory_ledger::Column::TenantId.eq(tenant_id))
            .filter(inventory_ledger::Column::InventoryId.eq(inventory_id))
            .order_by_asc(inventory_ledger::Column::Sequence);
        if let Some(limit) = limit {
            query = query.offset(offset.unwrap_or(0)).limit(limit);
        }
        Ok(query.all(&self.db).await?)
    }
}

fn out_of_range(what: &str) -> LedgerError {
    LedgerError::InvalidQuantity(format!("{what} is out of range for the stored quantity"))
}

async fn find_by_offer_location(
    txn: &DatabaseTransaction,
    tenant_id: Uuid,
    offer_id: Uuid,
    location_id: Uuid,
) -> Result<Option<inventory_current::Model>, DbErr> {
    InventoryCurrentEntity::find()
        .filter(inventory_current::Column::TenantId.eq(tenant_id))
        .filter(inventory_current::Column::OfferId.eq(offer_id))
        .filter(inventory_current::Column::LocationId.eq(location_id))
        .one(txn)
        .await
}

async fn insert_row(
    txn: &DatabaseTransaction,
    params: &NewInventory,
) -> Result<inventory_current::Model, DbErr> {
    let now = Utc::now().fixed_offset();
    inventory_current::ActiveModel {
        id: Set(Uuid::new_v4()),
        tenant_id: Set(params.tenant_id),
        offer_id: Set(params.offer_id),
        location_id: Set(params.location_id),
        sku: Set(params.sku.clone()),
        quantity_on_hand: Set(0),
        quantity_reserved: Set(0),
        low_stock_threshold: Set(params.low_stock_threshold),
        reorder_point: Set(params.reorder_point),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(txn)
    .await
}

/// Loads the row under `SELECT ... FOR UPDATE` where the backend supports it.
async fn lock_row(
    txn: &DatabaseTransaction,
    tenant_id: Uuid,
    inventory_id: Uuid,
) -> Result<inventory_current::Model, LedgerError> {
    InventoryCurrentEntity::find_by_id(inventory_id)
        .filter(inventory_current::Column::TenantId.eq(tenant_id))
        .lock_exclusive()
        .one(txn)
        .await?
        .ok_or(LedgerError::NotFound(inventory_id))
}

/// Writes `target` into `bucket` and appends the matching ledger entry.
async fn apply(
    txn: &DatabaseTransaction,
    row: inventory_current::Model,
    bucket: Bucket,
    transaction_type: TransactionType,
    requested_change: i64,
    target: i64,
    ctx: &LedgerContext,
) -> Result<LedgerMutation, LedgerError> {
    let before = match bucket {
        Bucket::OnHand => row.quantity_on_hand,
        Bucket::Reserved => row.quantity_reserved,
    };

    let last_sequence = InventoryLedgerEntity::find()
        .filter(inventory_ledger::Column::InventoryId.eq(row.id))
        .order_by_desc(inventory_ledger::Column::Sequence)
        .one(txn)
        .await?
        .map(|entry| entry.sequence)
        .unwrap_or(0);

    let now = Utc::now().fixed_offset();
    let tenant_id = row.tenant_id;
    let inventory_id = row.id;

    let mut active: inventory_current::ActiveModel = row.into();
    match bucket {
        Bucket::OnHand => active.quantity_on_hand = Set(target),
        Bucket::Reserved => active.quantity_reserved = Set(target),
    }
    active.updated_at = Set(now);
    let inventory = active.update(txn).await?;

    let entry = inventory_ledger::ActiveModel {
        id: Set(Uuid::new_v4()),
        tenant_id: Set(tenant_id),
        inventory_id: Set(inventory_id),
        sequence: Set(last_sequence + 1),
        transaction_type: Set(transaction_type.as_str().to_string()),
        bucket: Set(bucket.as_str().to_string()),
        quantity_change: Set(target - before),
        requested_change: Set(requested_change),
        quantity_before: Set(before),
        quantity_after: Set(target),
        source: Set(ctx.source.clone()),
        reference_type: Set(ctx.reference_type.clone()),
        reference_id: Set(ctx.reference_id.clone()),
        notes: Set(ctx.notes.clone()),
        created_by: Set(ctx.created_by.clone()),
        created_at: Set(now),
    }
    .insert(txn)
    .await?;

    counter!("inventory_mutations_total", "type" => transaction_type.as_str()).increment(1);
    debug!(
        inventory_id = %inventory_id,
        transaction_type = %transaction_type,
        before,
        after = target,
        "inventory mutated"
    );

    Ok(LedgerMutation {
        inventory,
        entry: Some(entry),
    })
}
