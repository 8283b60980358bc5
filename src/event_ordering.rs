//! # Event Ordering Guard
//!
//! Webhooks arrive at least once and in no particular order. Before an event
//! is allowed to trigger work, its version (or, when the marketplace sends no
//! version, its timestamp) is compared with the highest one already applied
//! for the same entity. Duplicates are dropped, stale events are buffered in
//! `out_of_order_events` for later replay, and everything else is processed
//! and recorded.
//!
//! Reads go through an LRU cache with a fixed TTL. The cache only ever holds
//! values that were read from the store, so a stale entry can at worst let an
//! event through to a re-check against the store on the write path; it never
//! regresses the stored version, which is only moved forward by a conditional
//! update.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use metrics::counter;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::EventOrderingConfig;
use crate::models::event_version::{self, Entity as EventVersionEntity};
use crate::models::out_of_order_event::{
    self, Entity as OutOfOrderEventEntity, RESOLUTION_APPLIED, RESOLUTION_SUPERSEDED,
    STATUS_PENDING, STATUS_PROCESSED,
};

#[derive(Debug, Error)]
pub enum OrderingError {
    #[error("event store error: {0}")]
    Database(#[from] DbErr),
    #[error("event processor failed: {0}")]
    Processor(#[source] anyhow::Error),
}

/// One inbound event as seen by the guard.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedEvent {
    pub tenant_id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub event_id: String,
    pub event_time: DateTime<Utc>,
    /// Marketplace-supplied version; `None` falls back to timestamp ordering
    pub version: Option<i64>,
    pub payload: Option<JsonValue>,
}

impl OrderedEvent {
    fn key(&self) -> VersionKey {
        VersionKey {
            tenant_id: self.tenant_id,
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id.clone(),
        }
    }

    fn from_buffered(row: &out_of_order_event::Model) -> Self {
        Self {
            tenant_id: row.tenant_id,
            entity_type: row.entity_type.clone(),
            entity_id: row.entity_id.clone(),
            event_id: row.event_id.clone(),
            event_time: row.event_time.with_timezone(&Utc),
            version: row.version,
            payload: row.payload.clone(),
        }
    }
}

/// Result of comparing an event against the applied version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingDecision {
    /// No version recorded yet for the entity
    First,
    Process { current_version: i64 },
    Duplicate { current_version: i64 },
    OutOfOrder { current_version: i64 },
}

impl OrderingDecision {
    pub fn should_process(&self) -> bool {
        matches!(
            self,
            OrderingDecision::First | OrderingDecision::Process { .. }
        )
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, OrderingDecision::Duplicate { .. })
    }

    pub fn is_out_of_order(&self) -> bool {
        matches!(self, OrderingDecision::OutOfOrder { .. })
    }

    pub fn current_version(&self) -> Option<i64> {
        match self {
            OrderingDecision::First => None,
            OrderingDecision::Process { current_version }
            | OrderingDecision::Duplicate { current_version }
            | OrderingDecision::OutOfOrder { current_version } => Some(*current_version),
        }
    }
}

/// What happened to an event passed through [`EventOrderingGuard::process_event_with_ordering`].
#[derive(Debug)]
pub enum OrderingOutcome<T> {
    Processed(T),
    Duplicate,
    Buffered { buffered_id: Uuid, current_version: i64 },
}

/// Counters from one replay pass over the out-of-order buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct ReplayStats {
    pub examined: usize,
    pub applied: usize,
    pub superseded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct VersionKey {
    tenant_id: Uuid,
    entity_type: String,
    entity_id: String,
}

#[derive(Debug, Clone)]
struct CachedVersion {
    version: i64,
    last_event_time: DateTime<Utc>,
    last_event_id: String,
    cached_at: Instant,
}

impl From<&event_version::Model> for CachedVersion {
    fn from(model: &event_version::Model) -> Self {
        Self {
            version: model.version,
            last_event_time: model.last_event_time.with_timezone(&Utc),
            last_event_id: model.last_event_id.clone(),
            cached_at: Instant::now(),
        }
    }
}

/// Classifies an event against the stored version for its entity.
fn classify(stored: &CachedVersion, event: &OrderedEvent) -> OrderingDecision {
    let current_version = stored.version;
    match event.version.filter(|version| *version > 0) {
        Some(version) if version == current_version => {
            OrderingDecision::Duplicate { current_version }
        }
        Some(version) if version < current_version => {
            OrderingDecision::OutOfOrder { current_version }
        }
        None if event.event_id == stored.last_event_id => {
            OrderingDecision::Duplicate { current_version }
        }
        None if event.event_time < stored.last_event_time => {
            OrderingDecision::OutOfOrder { current_version }
        }
        _ => OrderingDecision::Process { current_version },
    }
}

pub struct EventOrderingGuard {
    db: DatabaseConnection,
    cache: Mutex<LruCache<VersionKey, CachedVersion>>,
    ttl: Duration,
}

impl EventOrderingGuard {
    pub fn new(db: DatabaseConnection, config: &EventOrderingConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            db,
            cache: Mutex::new(LruCache::new(capacity)),
            ttl: Duration::from_secs(config.cache_ttl_seconds),
        }
    }

    /// Decides whether `event` should be processed.
    #[instrument(skip(self, event), fields(tenant_id = %event.tenant_id, entity_type = %event.entity_type, entity_id = %event.entity_id))]
    pub async fn check_event(&self, event: &OrderedEvent) -> Result<OrderingDecision, OrderingError> {
        let key = event.key();
        let stored = match self.cached(&key) {
            Some(stored) => Some(stored),
            None => self.load(&key).await?,
        };

        let decision = match stored {
            None => OrderingDecision::First,
            Some(stored) => classify(&stored, event),
        };

        match decision {
            OrderingDecision::Duplicate { .. } => {
                counter!("event_ordering_duplicates_total").increment(1);
                debug!(event_id = %event.event_id, "duplicate event");
            }
            OrderingDecision::OutOfOrder { current_version } => {
                counter!("event_ordering_out_of_order_total").increment(1);
                debug!(
                    event_id = %event.event_id,
                    event_version = ?event.version,
                    current_version,
                    "out-of-order event"
                );
            }
            _ => {}
        }

        Ok(decision)
    }

    /// Moves the stored version for the event's entity forward.
    ///
    /// The update is conditional, so a concurrent writer that already applied
    /// a newer version is never overwritten.
    pub async fn record_event_processed(&self, event: &OrderedEvent) -> Result<(), OrderingError> {
        use event_version::Column;

        let now = Utc::now().fixed_offset();
        let event_time = event.event_time.fixed_offset();

        let row = event_version::ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(event.tenant_id),
            entity_type: Set(event.entity_type.clone()),
            entity_id: Set(event.entity_id.clone()),
            version: Set(event.version.unwrap_or(0)),
            last_event_time: Set(event_time),
            last_event_id: Set(event.event_id.clone()),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let inserted = match EventVersionEntity::insert(row)
            .on_conflict(
                OnConflict::columns([Column::TenantId, Column::EntityType, Column::EntityId])
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await
        {
            Ok(rows) => rows,
            Err(DbErr::RecordNotInserted) => 0,
            Err(err) => return Err(err.into()),
        };

        if inserted == 0 {
            let mut update = EventVersionEntity::update_many()
                .col_expr(Column::LastEventTime, Expr::value(event_time))
                .col_expr(Column::LastEventId, Expr::value(event.event_id.clone()))
                .col_expr(Column::UpdatedAt, Expr::value(now))
                .filter(Column::TenantId.eq(event.tenant_id))
                .filter(Column::EntityType.eq(event.entity_type.as_str()))
                .filter(Column::EntityId.eq(event.entity_id.as_str()));

            update = match event.version {
                Some(version) if version > 0 => update
                    .col_expr(Column::Version, Expr::value(version))
                    .filter(Column::Version.lte(version)),
                _ => update.filter(Column::LastEventTime.lte(event_time)),
            };

            let result = update.exec(&self.db).await?;
            if result.rows_affected == 0 {
                debug!(
                    event_id = %event.event_id,
                    "stored version already ahead of processed event"
                );
            }
        }

        self.invalidate(&event.key());
        counter!("event_ordering_recorded_total").increment(1);
        Ok(())
    }

    /// Checks the event, then either runs `processor` and records the new
    /// version, drops it as a duplicate, or buffers it for replay.
    #[instrument(skip(self, event, processor), fields(tenant_id = %event.tenant_id, entity_id = %event.entity_id, event_id = %event.event_id))]
    pub async fn process_event_with_ordering<T, F, Fut>(
        &self,
        event: &OrderedEvent,
        processor: F,
    ) -> Result<OrderingOutcome<T>, OrderingError>
    where
        F: FnOnce(OrderedEvent) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let decision = self.check_event(event).await?;
        match decision {
            OrderingDecision::Duplicate { .. } => Ok(OrderingOutcome::Duplicate),
            OrderingDecision::OutOfOrder { current_version } => {
                let buffered_id = self.buffer_out_of_order_event(event, current_version).await?;
                Ok(OrderingOutcome::Buffered {
                    buffered_id,
                    current_version,
                })
            }
            OrderingDecision::First | OrderingDecision::Process { .. } => {
                let output = processor(event.clone())
                    .await
                    .map_err(OrderingError::Processor)?;
                self.record_event_processed(event).await?;
                Ok(OrderingOutcome::Processed(output))
            }
        }
    }

    /// Stores a stale event so it can be re-evaluated later.
    pub async fn buffer_out_of_order_event(
        &self,
        event: &OrderedEvent,
        expected_version: i64,
    ) -> Result<Uuid, OrderingError> {
        let row = out_of_order_event::ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(event.tenant_id),
            entity_type: Set(event.entity_type.clone()),
            entity_id: Set(event.entity_id.clone()),
            event_id: Set(event.event_id.clone()),
            event_time: Set(event.event_time.fixed_offset()),
            version: Set(event.version),
            expected_version: Set(expected_version),
            payload: Set(event.payload.clone()),
            status: Set(STATUS_PENDING.to_string()),
            resolution: Set(None),
            processed_at: Set(None),
            created_at: Set(Utc::now().fixed_offset()),
        }
        .insert(&self.db)
        .await?;

        info!(
            buffered_id = %row.id,
            event_id = %row.event_id,
            entity_id = %row.entity_id,
            expected_version,
            "buffered out-of-order event"
        );
        Ok(row.id)
    }

    /// Re-evaluates every pending buffered event, per entity in event-time
    /// order. Events that have become valid are passed to `processor` and
    /// recorded; events that can no longer apply are marked superseded.
    /// A processor failure leaves the row pending for the next pass.
    #[instrument(skip(self, processor))]
    pub async fn process_pending_out_of_order_events<F, Fut>(
        &self,
        processor: F,
    ) -> Result<ReplayStats, OrderingError>
    where
        F: Fn(OrderedEvent) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        use out_of_order_event::Column;

        let pending = OutOfOrderEventEntity::find()
            .filter(Column::Status.eq(STATUS_PENDING))
            .order_by_asc(Column::TenantId)
            .order_by_asc(Column::EntityType)
            .order_by_asc(Column::EntityId)
            .order_by_asc(Column::EventTime)
            .all(&self.db)
            .await?;

        let mut stats = ReplayStats::default();
        for row in pending {
            stats.examined += 1;
            let event = OrderedEvent::from_buffered(&row);
            self.invalidate(&event.key());

            let decision = self.check_event(&event).await?;
            if !decision.should_process() {
                self.mark_processed(row, RESOLUTION_SUPERSEDED).await?;
                stats.superseded += 1;
                continue;
            }

            match processor(event.clone()).await {
                Ok(()) => {
                    self.record_event_processed(&event).await?;
                    self.mark_processed(row, RESOLUTION_APPLIED).await?;
                    stats.applied += 1;
                }
                Err(err) => {
                    warn!(
                        buffered_id = %row.id,
                        event_id = %row.event_id,
                        error = %err,
                        "replay of buffered event failed; leaving pending"
                    );
                    stats.failed += 1;
                }
            }
        }

        if stats.examined > 0 {
            info!(
                examined = stats.examined,
                applied = stats.applied,
                superseded = stats.superseded,
                failed = stats.failed,
                "replayed out-of-order events"
            );
        }
        counter!("event_ordering_replayed_total").increment(stats.applied as u64);
        Ok(stats)
    }

    /// Drops every cached version; subsequent checks read through to the store.
    pub fn cleanup_cache(&self) -> usize {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let cleared = cache.len();
        cache.clear();
        debug!(cleared, "cleared event version cache");
        cleared
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn mark_processed(
        &self,
        row: out_of_order_event::Model,
        resolution: &str,
    ) -> Result<(), OrderingError> {
        let mut active: out_of_order_event::ActiveModel = row.into();
        active.status = Set(STATUS_PROCESSED.to_string());
        active.resolution = Set(Some(resolution.to_string()));
        active.processed_at = Set(Some(Utc::now().fixed_offset()));
        active.update(&self.db).await?;
        Ok(())
    }

    fn cached(&self, key: &VersionKey) -> Option<CachedVersion> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        match cache.get(key) {
            Some(entry) if entry.cached_at.elapsed() < self.ttl => Some(entry.clone()),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    async fn load(&self, key: &VersionKey) -> Result<Option<CachedVersion>, OrderingError> {
        use event_version::Column;

        let row = EventVersionEntity::find()
            .filter(Column::TenantId.eq(key.tenant_id))
            .filter(Column::EntityType.eq(key.entity_type.as_str()))
            .filter(Column::EntityId.eq(key.entity_id.as_str()))
            .one(&self.db)
            .await?;

        Ok(row.map(|model| {
            let entry = CachedVersion::from(&model);
            self.cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .put(key.clone(), entry.clone());
            entry
        }))
    }

    fn invalidate(&self, key: &VersionKey) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn stored(version: i64, at: DateTime<Utc>, event_id: &str) -> CachedVersion {
        CachedVersion {
            version,
            last_event_time: at,
            last_event_id: event_id.to_string(),
            cached_at: Instant::now(),
        }
    }

    fn event(version: Option<i64>, at: DateTime<Utc>, event_id: &str) -> OrderedEvent {
        OrderedEvent {
            tenant_id: Uuid::new_v4(),
            entity_type: "product".into(),
            entity_id: "p-1".into(),
            event_id: event_id.into(),
            event_time: at,
            version,
            payload: None,
        }
    }

    #[test]
    fn equal_version_is_duplicate() {
        let now = Utc::now();
        let decision = classify(&stored(9, now, "e9"), &event(Some(9), now, "e9-redelivery"));
        assert_eq!(decision, OrderingDecision::Duplicate { current_version: 9 });
        assert!(!decision.should_process());
    }

    #[test]
    fn lower_version_is_out_of_order_even_with_later_timestamp() {
        let now = Utc::now();
        let decision = classify(
            &stored(9, now, "e9"),
            &event(Some(7), now + ChronoDuration::minutes(5), "e7"),
        );
        assert!(decision.is_out_of_order());
        assert_eq!(decision.current_version(), Some(9));
    }

    #[test]
    fn higher_version_is_processed() {
        let now = Utc::now();
        let decision = classify(&stored(9, now, "e9"), &event(Some(10), now, "e10"));
        assert_eq!(decision, OrderingDecision::Process { current_version: 9 });
    }

    #[test]
    fn unversioned_events_fall_back_to_timestamps() {
        let now = Utc::now();
        let current = stored(0, now, "e1");

        let older = classify(&current, &event(None, now - ChronoDuration::seconds(1), "e0"));
        assert!(older.is_out_of_order());

        let newer = classify(&current, &event(None, now + ChronoDuration::seconds(1), "e2"));
        assert!(newer.should_process());

        let same_event = classify(&current, &event(None, now, "e1"));
        assert!(same_event.is_duplicate());
    }
}
