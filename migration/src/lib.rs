//! Database migrations for the marketplace sync engine.

pub use sea_orm_migration::prelude::*;

mod m2024_01_01_000001_create_tenants;
mod m2025_11_01_000100_create_marketplace_connections;
mod m2025_11_01_000200_create_sync_jobs;
mod m2025_11_01_000300_create_event_ordering;
mod m2025_11_01_000400_create_inventory;
mod m2025_11_01_000500_create_mappings;
mod m2025_11_01_000600_create_reconciliation;
mod m2025_11_01_000700_create_webhook_events;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2024_01_01_000001_create_tenants::Migration),
            Box::new(m2025_11_01_000100_create_marketplace_connections::Migration),
            Box::new(m2025_11_01_000200_create_sync_jobs::Migration),
            Box::new(m2025_11_01_000300_create_event_ordering::Migration),
            Box::new(m2025_11_01_000400_create_inventory::Migration),
            Box::new(m2025_11_01_000500_create_mappings::Migration),
            Box::new(m2025_11_01_000600_create_reconciliation::Migration),
            Box::new(m2025_11_01_000700_create_webhook_events::Migration),
        ]
    }
}
