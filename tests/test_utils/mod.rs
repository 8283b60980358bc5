//! Test utilities shared by the integration tests.
//!
//! Provides an in-memory SQLite database with migrations applied, tenant and
//! connection fixtures, and a scriptable in-process marketplace adapter.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use migration::{Migrator, MigratorTrait};
use sea_orm::{
    ActiveModelTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Set,
    Statement,
};
use serde_json::{Value, json};
use uuid::Uuid;

use marketplace_sync::adapters::signature::{SignatureEncoding, sign, verify_hmac_sha256};
use marketplace_sync::adapters::{
    AdapterError, AdapterFactory, ExternalOrder, ExternalProduct, ExternalVariant, InventoryLevel,
    ListOptions, MarketplaceAdapter, OrderListOptions, Page, ResourceType, TokenResult,
    WebhookContext, WebhookEvent,
};
use marketplace_sync::config::{AppConfig, RetryConfig};
use marketplace_sync::models::marketplace_connection::{self, ConnectionStatus, MarketplaceType};
use marketplace_sync::models::tenant;
use marketplace_sync::server::Services;

pub const OPERATOR_TOKEN: &str = "test-operator-token";
pub const WEBHOOK_SECRET: &str = "whsec_test";

/// Sets up an in-memory SQLite database with all migrations applied.
///
/// The pool holds a single connection so every query sees the same
/// in-memory database.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options
        .max_connections(1)
        .min_connections(1)
        .sqlx_logging(false);
    let db = Database::connect(options).await?;

    Migrator::up(&db, None).await?;

    // Fixtures reference offers and locations that have no rows of their own.
    db.execute(Statement::from_string(
        db.get_database_backend(),
        "PRAGMA foreign_keys = OFF".to_string(),
    ))
    .await?;

    Ok(db)
}

/// Creates a tenant and returns its id.
pub async fn create_test_tenant(db: &DatabaseConnection) -> Result<Uuid> {
    let model = tenant::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set(Some("Test Tenant".to_string())),
        created_at: Set(Utc::now().fixed_offset()),
    }
    .insert(db)
    .await?;
    Ok(model.id)
}

/// Inserts a connected marketplace connection with a webhook secret.
pub async fn insert_connection(
    db: &DatabaseConnection,
    tenant_id: Uuid,
    marketplace: MarketplaceType,
    store_id: &str,
) -> Result<marketplace_connection::Model> {
    insert_connection_with_status(db, tenant_id, marketplace, store_id, ConnectionStatus::Connected)
        .await
}

pub async fn insert_connection_with_status(
    db: &DatabaseConnection,
    tenant_id: Uuid,
    marketplace: MarketplaceType,
    store_id: &str,
    status: ConnectionStatus,
) -> Result<marketplace_connection::Model> {
    let now = Utc::now().fixed_offset();
    let model = marketplace_connection::ActiveModel {
        id: Set(Uuid::new_v4()),
        tenant_id: Set(tenant_id),
        marketplace_type: Set(marketplace.as_str().to_string()),
        status: Set(status.as_str().to_string()),
        display_name: Set(Some(format!("{store_id} ({marketplace})"))),
        external_store_id: Set(store_id.to_string()),
        credentials: Set(Some(json!({ "store": store_id, "access_token": "test" }))),
        webhook_secret: Set(Some(WEBHOOK_SECRET.to_string())),
        default_location_id: Set(None),
        last_sync_at: Set(None),
        metadata: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await?;
    Ok(model)
}

/// Configuration tuned for tests: fast retries and a known operator token.
pub fn test_config() -> AppConfig {
    AppConfig {
        profile: "test".to_string(),
        database_url: "sqlite::memory:".to_string(),
        operator_tokens: vec![OPERATOR_TOKEN.to_string()],
        retry: RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            backoff_factor: 2.0,
            jitter_factor: 0.0,
            ..RetryConfig::default()
        },
        ..AppConfig::default()
    }
}

/// Wires every service against `db` with the fake marketplace registered
/// for all three marketplaces.
pub fn build_services(db: DatabaseConnection, marketplace: &FakeMarketplace) -> Services {
    build_services_with(test_config(), db, marketplace)
}

pub fn build_services_with(
    config: AppConfig,
    db: DatabaseConnection,
    marketplace: &FakeMarketplace,
) -> Services {
    Services::build(Arc::new(config), db, marketplace.factory())
}

/// Base64 HMAC-SHA256 of `body` under the fixture webhook secret.
pub fn sign_body(body: &[u8]) -> String {
    sign(body, WEBHOOK_SECRET, SignatureEncoding::Base64).unwrap_or_default()
}

pub fn product(id: &str, sku: &str, quantity: i64, updated_at: DateTime<Utc>) -> ExternalProduct {
    ExternalProduct {
        id: id.to_string(),
        title: format!("Product {id}"),
        status: Some("active".to_string()),
        vendor: None,
        variants: vec![ExternalVariant {
            id: format!("{id}-v1"),
            sku: Some(sku.to_string()),
            title: None,
            price: Some("9.99".to_string()),
            inventory_quantity: Some(quantity),
        }],
        created_at: Some(updated_at),
        updated_at: Some(updated_at),
    }
}

pub fn order(id: &str, sku: &str, quantity: i64) -> ExternalOrder {
    ExternalOrder {
        id: id.to_string(),
        order_number: Some(format!("#{id}")),
        status: Some("open".to_string()),
        financial_status: Some("paid".to_string()),
        fulfillment_status: None,
        currency: Some("USD".to_string()),
        total_price: Some("19.98".to_string()),
        line_items: vec![marketplace_sync::adapters::ExternalLineItem {
            id: Some(format!("{id}-li1")),
            sku: Some(sku.to_string()),
            title: None,
            quantity,
            price: Some("9.99".to_string()),
        }],
        created_at: Some(Utc::now()),
        updated_at: Some(Utc::now()),
    }
}

#[derive(Default)]
struct FakeState {
    products: Vec<ExternalProduct>,
    orders: Vec<ExternalOrder>,
    inventory: HashMap<String, i64>,
    /// HTTP statuses returned, in order, by the next product listing calls
    product_failures: VecDeque<u16>,
    page_size: Option<usize>,
    product_calls: u32,
    /// Stall applied to every product listing call
    product_delay: Option<std::time::Duration>,
}

/// In-process marketplace whose data the test controls.
#[derive(Clone, Default)]
pub struct FakeMarketplace {
    state: Arc<Mutex<FakeState>>,
}

impl FakeMarketplace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> AdapterFactory {
        let mut factory = AdapterFactory::empty();
        for marketplace in MarketplaceType::ALL {
            let state = self.state.clone();
            factory.register(marketplace, move || {
                Ok(Box::new(FakeAdapter {
                    marketplace,
                    state: state.clone(),
                }) as Box<dyn MarketplaceAdapter>)
            });
        }
        factory
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn set_products(&self, products: Vec<ExternalProduct>) {
        self.with_state(|s| s.products = products);
    }

    pub fn set_orders(&self, orders: Vec<ExternalOrder>) {
        self.with_state(|s| s.orders = orders);
    }

    pub fn set_inventory(&self, sku: &str, quantity: i64) {
        self.with_state(|s| {
            s.inventory.insert(sku.to_string(), quantity);
        });
    }

    pub fn remove_inventory(&self, sku: &str) {
        self.with_state(|s| {
            s.inventory.remove(sku);
        });
    }

    pub fn fail_product_calls(&self, statuses: &[u16]) {
        self.with_state(|s| s.product_failures.extend(statuses.iter().copied()));
    }

    pub fn set_page_size(&self, size: usize) {
        self.with_state(|s| s.page_size = Some(size));
    }

    pub fn delay_product_calls(&self, delay: std::time::Duration) {
        self.with_state(|s| s.product_delay = Some(delay));
    }

    pub fn product_calls(&self) -> u32 {
        self.with_state(|s| s.product_calls)
    }
}

struct FakeAdapter {
    marketplace: MarketplaceType,
    state: Arc<Mutex<FakeState>>,
}

fn paginate<T: Clone>(items: &[T], cursor: Option<&str>, page_size: usize) -> Page<T> {
    let start: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
    let end = (start + page_size).min(items.len());
    let page: Vec<T> = items.get(start..end).map(<[T]>::to_vec).unwrap_or_default();
    if end < items.len() {
        Page::with_next(page, Some(end.to_string()))
    } else {
        Page::last(page)
    }
}

#[async_trait]
impl MarketplaceAdapter for FakeAdapter {
    fn marketplace(&self) -> MarketplaceType {
        self.marketplace
    }

    async fn initialize(&mut self, _credentials: &Value) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn test_connection(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn refresh_token(&self) -> Result<TokenResult, AdapterError> {
        Ok(TokenResult {
            access_token: "fresh".to_string(),
            refresh_token: None,
            expires_at: None,
        })
    }

    async fn get_products(
        &self,
        options: &ListOptions,
    ) -> Result<Page<ExternalProduct>, AdapterError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.product_calls += 1;
            state.product_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(status) = state.product_failures.pop_front() {
            return Err(AdapterError::Http {
                status,
                body: "scripted failure".to_string(),
                retry_after: None,
            });
        }
        let page_size = state.page_size.unwrap_or(options.limit as usize).max(1);
        Ok(paginate(&state.products, options.cursor.as_deref(), page_size))
    }

    async fn get_product(&self, id: &str) -> Result<ExternalProduct, AdapterError> {
        let state = self.state.lock().unwrap();
        state
            .products
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| AdapterError::Http {
                status: 404,
                body: format!("product {id} not found"),
                retry_after: None,
            })
    }

    async fn get_orders(
        &self,
        options: &OrderListOptions,
    ) -> Result<Page<ExternalOrder>, AdapterError> {
        let state = self.state.lock().unwrap();
        let page_size = state.page_size.unwrap_or(options.limit as usize).max(1);
        Ok(paginate(&state.orders, options.cursor.as_deref(), page_size))
    }

    async fn get_order(&self, id: &str) -> Result<ExternalOrder, AdapterError> {
        let state = self.state.lock().unwrap();
        state
            .orders
            .iter()
            .find(|o| o.id == id)
            .cloned()
            .ok_or_else(|| AdapterError::Http {
                status: 404,
                body: format!("order {id} not found"),
                retry_after: None,
            })
    }

    async fn get_inventory(
        &self,
        skus: &[String],
    ) -> Result<HashMap<String, InventoryLevel>, AdapterError> {
        let state = self.state.lock().unwrap();
        Ok(skus
            .iter()
            .filter_map(|sku| {
                state.inventory.get(sku).map(|quantity| {
                    (
                        sku.clone(),
                        InventoryLevel {
                            sku: sku.clone(),
                            quantity: *quantity,
                            location_id: None,
                            updated_at: None,
                        },
                    )
                })
            })
            .collect())
    }

    fn verify_webhook(&self, payload: &[u8], signature: &str, secret: &str) -> bool {
        verify_hmac_sha256(payload, secret, signature, SignatureEncoding::Base64)
    }

    /// Body shape: `{"id": "...", "updated_at": "...", "version": n}`.
    fn parse_webhook(
        &self,
        payload: &[u8],
        context: &WebhookContext,
    ) -> Result<WebhookEvent, AdapterError> {
        let body: Value = serde_json::from_slice(payload)
            .map_err(|e| AdapterError::malformed(format!("webhook body: {e}")))?;
        let topic = context
            .topic
            .clone()
            .ok_or_else(|| AdapterError::malformed("missing topic"))?;
        let timestamp = body
            .get("updated_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Ok(WebhookEvent {
            event_id: context
                .delivery_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            resource_type: ResourceType::infer(&topic),
            event_type: topic,
            resource_id: body.get("id").and_then(Value::as_str).map(str::to_string),
            version: body.get("version").and_then(Value::as_i64),
            timestamp,
            payload: body,
        })
    }
}
