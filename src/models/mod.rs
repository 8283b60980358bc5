//! # Data Models
//!
//! SeaORM entities for the sync engine plus the enums and API views built on them.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod canonical_record;
pub mod discrepancy;
pub mod event_version;
pub mod external_mapping;
pub mod inventory_current;
pub mod inventory_ledger;
pub mod marketplace_connection;
pub mod out_of_order_event;
pub mod reconciliation_job;
pub mod sync_job;
pub mod sync_log;
pub mod tenant;
pub mod webhook_event;

pub use canonical_record::Entity as CanonicalRecord;
pub use discrepancy::Entity as Discrepancy;
pub use event_version::Entity as EventVersion;
pub use external_mapping::Entity as ExternalMapping;
pub use inventory_current::Entity as InventoryCurrent;
pub use inventory_ledger::Entity as InventoryLedger;
pub use marketplace_connection::Entity as MarketplaceConnection;
pub use out_of_order_event::Entity as OutOfOrderEvent;
pub use reconciliation_job::Entity as ReconciliationJob;
pub use sync_job::Entity as SyncJob;
pub use sync_log::Entity as SyncLog;
pub use tenant::Entity as Tenant;
pub use webhook_event::Entity as WebhookEvent;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "marketplace-sync".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
