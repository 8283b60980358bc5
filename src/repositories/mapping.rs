//! External mapping repository
//!
//! Keeps `external_mappings` and the canonical records they point to in step.
//! An upsert touches both tables in one transaction.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde_json::{Value as JsonValue, json};
use uuid::Uuid;

use crate::models::canonical_record::{self, Entity as CanonicalRecord};
use crate::models::external_mapping::{self, Entity as ExternalMapping};
use crate::schema_mapper::CanonicalEntity;

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    /// Stored snapshot is as new as or newer than the incoming one
    Skipped,
}

#[derive(Debug, Clone)]
pub struct MappingRepository {
    db: DatabaseConnection,
}

impl MappingRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn find(
        &self,
        connection_id: Uuid,
        entity_type: &str,
        external_id: &str,
    ) -> Result<Option<external_mapping::Model>, DbErr> {
        ExternalMapping::find()
            .filter(external_mapping::Column::ConnectionId.eq(connection_id))
            .filter(external_mapping::Column::EntityType.eq(entity_type))
            .filter(external_mapping::Column::ExternalId.eq(external_id))
            .one(&self.db)
            .await
    }

    pub async fn list_for_connection(
        &self,
        tenant_id: Uuid,
        connection_id: Uuid,
        entity_type: &str,
    ) -> Result<Vec<external_mapping::Model>, DbErr> {
        ExternalMapping::find()
            .filter(external_mapping::Column::TenantId.eq(tenant_id))
            .filter(external_mapping::Column::ConnectionId.eq(connection_id))
            .filter(external_mapping::Column::EntityType.eq(entity_type))
            .order_by_asc(external_mapping::Column::ExternalId)
            .all(&self.db)
            .await
    }

    pub async fn canonical(
        &self,
        tenant_id: Uuid,
        record_id: Uuid,
    ) -> Result<Option<canonical_record::Model>, DbErr> {
        CanonicalRecord::find_by_id(record_id)
            .filter(canonical_record::Column::TenantId.eq(tenant_id))
            .one(&self.db)
            .await
    }

    /// Writes the canonical record and its mapping for one external entity.
    pub async fn upsert_entity(
        &self,
        tenant_id: Uuid,
        connection_id: Uuid,
        entity: &CanonicalEntity,
    ) -> Result<UpsertOutcome, DbErr> {
        let now = Utc::now().fixed_offset();
        let txn = self.db.begin().await?;

        let existing = ExternalMapping::find()
            .filter(external_mapping::Column::ConnectionId.eq(connection_id))
            .filter(external_mapping::Column::EntityType.eq(entity.entity_type))
            .filter(external_mapping::Column::ExternalId.eq(entity.external_id.as_str()))
            .one(&txn)
            .await?;

        let incoming_at = entity.external_updated_at.map(|t| t.fixed_offset());
        if let Some(mapping) = &existing {
            if let (Some(stored), Some(incoming)) = (mapping.external_updated_at, incoming_at) {
                if incoming <= stored && mapping.internal_id.is_some() {
                    return Ok(UpsertOutcome::Skipped);
                }
            }
        }

        let current_record = match existing.as_ref().and_then(|m| m.internal_id) {
            Some(record_id) => CanonicalRecord::find_by_id(record_id).one(&txn).await?,
            None => None,
        };

        let record_id = match current_record {
            Some(record) => {
                let id = record.id;
                let mut active: canonical_record::ActiveModel = record.into();
                active.sku = Set(entity.sku.clone());
                active.data = Set(entity.data.clone());
                active.updated_at = Set(now);
                active.update(&txn).await?;
                id
            }
            None => {
                canonical_record::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    tenant_id: Set(tenant_id),
                    entity_type: Set(entity.entity_type.to_string()),
                    sku: Set(entity.sku.clone()),
                    data: Set(entity.data.clone()),
                    deleted_at: Set(None),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&txn)
                .await?
                .id
            }
        };

        let outcome = match existing {
            Some(mapping) => {
                let mut active: external_mapping::ActiveModel = mapping.into();
                active.internal_id = Set(Some(record_id));
                active.external_sku = Set(entity.sku.clone());
                active.external_data = Set(Some(entity.data.clone()));
                active.external_updated_at = Set(incoming_at);
                active.last_synced_at = Set(Some(now));
                active.updated_at = Set(now);
                active.update(&txn).await?;
                UpsertOutcome::Updated
            }
            None => {
                external_mapping::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    tenant_id: Set(tenant_id),
                    connection_id: Set(connection_id),
                    entity_type: Set(entity.entity_type.to_string()),
                    internal_id: Set(Some(record_id)),
                    external_id: Set(entity.external_id.clone()),
                    external_sku: Set(entity.sku.clone()),
                    external_data: Set(Some(entity.data.clone())),
                    external_updated_at: Set(incoming_at),
                    last_synced_at: Set(Some(now)),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&txn)
                .await?;
                UpsertOutcome::Created
            }
        };

        txn.commit().await?;
        Ok(outcome)
    }

    /// Stores the marketplace-reported quantity in the mapping snapshot.
    pub async fn update_snapshot_quantity(
        &self,
        mapping: &external_mapping::Model,
        quantity: i64,
    ) -> Result<external_mapping::Model, DbErr> {
        let mut snapshot = mapping.external_data.clone().unwrap_or_else(|| json!({}));
        if let JsonValue::Object(map) = &mut snapshot {
            map.insert("quantity".to_string(), json!(quantity));
        } else {
            snapshot = json!({ "quantity": quantity });
        }

        let now = Utc::now().fixed_offset();
        let mut active: external_mapping::ActiveModel = mapping.clone().into();
        active.external_data = Set(Some(snapshot));
        active.last_synced_at = Set(Some(now));
        active.updated_at = Set(now);
        active.update(&self.db).await
    }
}

/// Quantity recorded in a mapping snapshot, if any.
pub fn snapshot_quantity(mapping: &external_mapping::Model) -> Option<i64> {
    mapping
        .external_data
        .as_ref()
        .and_then(|data| data.get("quantity"))
        .and_then(JsonValue::as_i64)
}
