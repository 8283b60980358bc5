//! Connection repository for database operations
//!
//! Tenant-scoped lookups over `marketplace_connections`, plus the unscoped
//! store-id lookup used to route inbound webhooks.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
};
use uuid::Uuid;

use crate::models::marketplace_connection::{
    self, ConnectionStatus, Entity as MarketplaceConnection, MarketplaceType,
};

#[derive(Debug, Clone)]
pub struct ConnectionRepository {
    db: DatabaseConnection,
}

impl ConnectionRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Finds a connection only if it belongs to `tenant_id`.
    pub async fn find_for_tenant(
        &self,
        tenant_id: Uuid,
        connection_id: Uuid,
    ) -> Result<Option<marketplace_connection::Model>, DbErr> {
        MarketplaceConnection::find_by_id(connection_id)
            .filter(marketplace_connection::Column::TenantId.eq(tenant_id))
            .one(&self.db)
            .await
    }

    /// Resolves a webhook sender by marketplace and the store id it sent.
    pub async fn find_by_store(
        &self,
        marketplace: MarketplaceType,
        external_store_id: &str,
    ) -> Result<Option<marketplace_connection::Model>, DbErr> {
        MarketplaceConnection::find()
            .filter(marketplace_connection::Column::MarketplaceType.eq(marketplace.as_str()))
            .filter(marketplace_connection::Column::ExternalStoreId.eq(external_store_id))
            .one(&self.db)
            .await
    }

    /// Connected connections whose last successful sync is older than
    /// `before`, or that never synced.
    pub async fn list_connected_synced_before(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<marketplace_connection::Model>, DbErr> {
        MarketplaceConnection::find()
            .filter(
                marketplace_connection::Column::Status.eq(ConnectionStatus::Connected.as_str()),
            )
            .filter(
                Condition::any()
                    .add(marketplace_connection::Column::LastSyncAt.is_null())
                    .add(marketplace_connection::Column::LastSyncAt.lt(before.fixed_offset())),
            )
            .order_by_asc(marketplace_connection::Column::LastSyncAt)
            .all(&self.db)
            .await
    }

    /// Records the completion time of a successful sync.
    pub async fn mark_synced(&self, connection_id: Uuid, at: DateTime<Utc>) -> Result<(), DbErr> {
        let at = at.fixed_offset();
        MarketplaceConnection::update_many()
            .col_expr(marketplace_connection::Column::LastSyncAt, Expr::value(at))
            .col_expr(marketplace_connection::Column::UpdatedAt, Expr::value(at))
            .filter(marketplace_connection::Column::Id.eq(connection_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }
}
