//! Two-level admission control for sync jobs.
//!
//! Every job run holds one slot from its tenant pool and one from its
//! connection pool. Connection pools are smaller than tenant pools so a single
//! connection cannot starve the rest of a tenant's connections.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use metrics::{counter, gauge};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::ConcurrencyConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("timed out waiting for a tenant slot for {tenant_id}")]
    TenantQueueTimeout { tenant_id: Uuid },
    #[error("timed out waiting for a connection slot for {connection_id}")]
    ConnectionQueueTimeout { connection_id: Uuid },
    #[error("tenant {tenant_id} is at its concurrent job limit")]
    TenantAtCapacity { tenant_id: Uuid },
    #[error("connection {connection_id} is at its concurrent job limit")]
    ConnectionAtCapacity { connection_id: Uuid },
}

#[derive(Debug, Default)]
struct LimiterInner {
    tenant_pools: HashMap<Uuid, Arc<Semaphore>>,
    connection_pools: HashMap<Uuid, Arc<Semaphore>>,
    tenant_active: HashMap<Uuid, usize>,
    connection_active: HashMap<Uuid, usize>,
}

/// Bounded per-tenant and per-connection admission.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    config: ConcurrencyConfig,
    inner: Arc<Mutex<LimiterInner>>,
}

/// Proof of admission. Dropping it releases both slots and decrements the
/// active counters.
#[derive(Debug)]
pub struct AdmissionPermit {
    tenant_id: Uuid,
    connection_id: Uuid,
    inner: Arc<Mutex<LimiterInner>>,
    _tenant: OwnedSemaphorePermit,
    _connection: OwnedSemaphorePermit,
}

impl AdmissionPermit {
    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Explicit release; equivalent to dropping the permit.
    pub fn release(self) {}
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let mut inner = lock(&self.inner);
        decrement(&mut inner.tenant_active, self.tenant_id);
        decrement(&mut inner.connection_active, self.connection_id);
        debug!(
            tenant_id = %self.tenant_id,
            connection_id = %self.connection_id,
            "released admission slots"
        );
    }
}

/// Point-in-time view of limiter occupancy.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct LimiterStats {
    pub max_jobs_per_tenant: usize,
    pub max_jobs_per_connection: usize,
    pub tenant_pools: usize,
    pub connection_pools: usize,
    pub active_jobs: usize,
    pub active_by_tenant: HashMap<Uuid, usize>,
    pub active_by_connection: HashMap<Uuid, usize>,
}

fn lock(inner: &Mutex<LimiterInner>) -> MutexGuard<'_, LimiterInner> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

fn decrement(map: &mut HashMap<Uuid, usize>, key: Uuid) {
    if let Some(count) = map.get_mut(&key) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            map.remove(&key);
        }
    }
}

impl ConcurrencyLimiter {
    pub fn new(config: ConcurrencyConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(LimiterInner::default())),
        }
    }

    pub fn config(&self) -> &ConcurrencyConfig {
        &self.config
    }

    fn pools(&self, tenant_id: Uuid, connection_id: Uuid) -> (Arc<Semaphore>, Arc<Semaphore>) {
        let mut inner = lock(&self.inner);
        let tenant = inner
            .tenant_pools
            .entry(tenant_id)
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_jobs_per_tenant)))
            .clone();
        let connection = inner
            .connection_pools
            .entry(connection_id)
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_jobs_per_connection)))
            .clone();
        (tenant, connection)
    }

    fn admit(
        &self,
        tenant_id: Uuid,
        connection_id: Uuid,
        tenant: OwnedSemaphorePermit,
        connection: OwnedSemaphorePermit,
    ) -> AdmissionPermit {
        let mut inner = lock(&self.inner);
        *inner.tenant_active.entry(tenant_id).or_insert(0) += 1;
        *inner.connection_active.entry(connection_id).or_insert(0) += 1;
        let active: usize = inner.tenant_active.values().sum();
        drop(inner);

        counter!("limiter_admissions_total").increment(1);
        gauge!("limiter_active_jobs").set(active as f64);
        AdmissionPermit {
            tenant_id,
            connection_id,
            inner: self.inner.clone(),
            _tenant: tenant,
            _connection: connection,
        }
    }

    /// Blocks up to the configured queue timeout for both slots.
    pub async fn acquire(
        &self,
        tenant_id: Uuid,
        connection_id: Uuid,
    ) -> Result<AdmissionPermit, AdmissionError> {
        self.acquire_with_timeout(tenant_id, connection_id, self.config.queue_timeout())
            .await
    }

    /// Blocks up to `wait` in total. A tenant slot obtained before the
    /// connection wait times out is returned to its pool.
    pub async fn acquire_with_timeout(
        &self,
        tenant_id: Uuid,
        connection_id: Uuid,
        wait: Duration,
    ) -> Result<AdmissionPermit, AdmissionError> {
        let deadline = tokio::time::Instant::now() + wait;
        let (tenant_pool, connection_pool) = self.pools(tenant_id, connection_id);

        let tenant = match tokio::time::timeout_at(deadline, tenant_pool.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            _ => {
                counter!("limiter_rejections_total", "scope" => "tenant").increment(1);
                return Err(AdmissionError::TenantQueueTimeout { tenant_id });
            }
        };

        let connection =
            match tokio::time::timeout_at(deadline, connection_pool.acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                _ => {
                    drop(tenant);
                    counter!("limiter_rejections_total", "scope" => "connection").increment(1);
                    return Err(AdmissionError::ConnectionQueueTimeout { connection_id });
                }
            };

        Ok(self.admit(tenant_id, connection_id, tenant, connection))
    }

    /// Non-blocking admission.
    pub fn try_acquire(
        &self,
        tenant_id: Uuid,
        connection_id: Uuid,
    ) -> Result<AdmissionPermit, AdmissionError> {
        let (tenant_pool, connection_pool) = self.pools(tenant_id, connection_id);
        let tenant = tenant_pool
            .try_acquire_owned()
            .map_err(|_| AdmissionError::TenantAtCapacity { tenant_id })?;
        let connection = connection_pool
            .try_acquire_owned()
            .map_err(|_| AdmissionError::ConnectionAtCapacity { connection_id })?;
        Ok(self.admit(tenant_id, connection_id, tenant, connection))
    }

    /// Read-only capacity check; does not reserve anything.
    pub fn can_accept_job(&self, tenant_id: Uuid, connection_id: Uuid) -> bool {
        let inner = lock(&self.inner);
        let tenant_active = inner.tenant_active.get(&tenant_id).copied().unwrap_or(0);
        let connection_active = inner
            .connection_active
            .get(&connection_id)
            .copied()
            .unwrap_or(0);
        tenant_active < self.config.max_jobs_per_tenant
            && connection_active < self.config.max_jobs_per_connection
    }

    /// Drops pools that have no holders and no waiters. Returns how many were reclaimed.
    pub fn cleanup(&self) -> usize {
        let mut inner = lock(&self.inner);
        let before = inner.tenant_pools.len() + inner.connection_pools.len();
        inner
            .tenant_pools
            .retain(|_, pool| Arc::strong_count(pool) > 1);
        inner
            .connection_pools
            .retain(|_, pool| Arc::strong_count(pool) > 1);
        let reclaimed = before - (inner.tenant_pools.len() + inner.connection_pools.len());
        if reclaimed > 0 {
            debug!(reclaimed, "reclaimed idle admission pools");
        }
        reclaimed
    }

    pub fn stats(&self) -> LimiterStats {
        let inner = lock(&self.inner);
        LimiterStats {
            max_jobs_per_tenant: self.config.max_jobs_per_tenant,
            max_jobs_per_connection: self.config.max_jobs_per_connection,
            tenant_pools: inner.tenant_pools.len(),
            connection_pools: inner.connection_pools.len(),
            active_jobs: inner.tenant_active.values().sum(),
            active_by_tenant: inner.tenant_active.clone(),
            active_by_connection: inner.connection_active.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn limiter(tenant: usize, connection: usize) -> ConcurrencyLimiter {
        ConcurrencyLimiter::new(ConcurrencyConfig {
            max_jobs_per_tenant: tenant,
            max_jobs_per_connection: connection,
            queue_timeout_seconds: 1,
            job_timeout_seconds: 60,
        })
    }

    #[tokio::test]
    async fn try_acquire_enforces_connection_limit() {
        let limiter = limiter(3, 1);
        let tenant = Uuid::new_v4();
        let conn = Uuid::new_v4();

        let permit = limiter.try_acquire(tenant, conn).expect("first slot");
        assert_eq!(
            limiter.try_acquire(tenant, conn).unwrap_err(),
            AdmissionError::ConnectionAtCapacity { connection_id: conn }
        );
        assert!(!limiter.can_accept_job(tenant, conn));
        assert!(limiter.can_accept_job(tenant, Uuid::new_v4()));

        drop(permit);
        assert!(limiter.can_accept_job(tenant, conn));
        assert!(limiter.try_acquire(tenant, conn).is_ok());
    }

    #[tokio::test]
    async fn connection_timeout_returns_tenant_slot() {
        let limiter = limiter(2, 1);
        let tenant = Uuid::new_v4();
        let conn = Uuid::new_v4();

        let _held = limiter.try_acquire(tenant, conn).unwrap();
        let err = limiter
            .acquire_with_timeout(tenant, conn, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AdmissionError::ConnectionQueueTimeout { connection_id: conn }
        );

        // The tenant slot taken during the failed attempt must be back.
        let other = limiter
            .try_acquire(tenant, Uuid::new_v4())
            .expect("tenant slot not leaked");
        assert_eq!(limiter.stats().active_by_tenant[&tenant], 2);
        drop(other);
    }

    #[tokio::test]
    async fn blocking_acquire_waits_for_release() {
        let limiter = limiter(2, 1);
        let tenant = Uuid::new_v4();
        let conn = Uuid::new_v4();

        let held = limiter.try_acquire(tenant, conn).unwrap();
        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire(tenant, conn).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        held.release();

        let permit = waiter.await.unwrap().expect("admitted after release");
        assert_eq!(permit.connection_id(), conn);
    }

    #[tokio::test]
    async fn concurrent_holders_never_exceed_tenant_limit() {
        let limiter = limiter(3, 2);
        let tenant = Uuid::new_v4();
        let connections: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..24 {
            let limiter = limiter.clone();
            let conn = connections[i % connections.len()];
            let current = current.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let permit = limiter
                    .acquire_with_timeout(tenant, conn, Duration::from_secs(5))
                    .await
                    .expect("eventually admitted");
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(limiter.stats().active_jobs, 0);
    }

    #[tokio::test]
    async fn cleanup_reclaims_only_idle_pools() {
        let limiter = limiter(3, 2);
        let tenant = Uuid::new_v4();
        let busy = Uuid::new_v4();
        let idle = Uuid::new_v4();

        let _held = limiter.try_acquire(tenant, busy).unwrap();
        drop(limiter.try_acquire(tenant, idle).unwrap());

        assert_eq!(limiter.cleanup(), 1);
        let stats = limiter.stats();
        assert_eq!(stats.tenant_pools, 1);
        assert_eq!(stats.connection_pools, 1);
    }
}
