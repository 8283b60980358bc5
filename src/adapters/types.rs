//! Marketplace-neutral shapes returned by adapters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Paging options for catalog listings.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub limit: u32,
    pub cursor: Option<String>,
    pub updated_after: Option<DateTime<Utc>>,
    pub status: Option<String>,
}

/// Paging and filter options for order listings.
#[derive(Debug, Clone, Default)]
pub struct OrderListOptions {
    pub limit: u32,
    pub cursor: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub updated_after: Option<DateTime<Utc>>,
    pub status: Option<String>,
}

/// One page of results plus the cursor for the next page.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
    pub total: Option<u64>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
            has_more: false,
            total: None,
        }
    }

    pub fn with_next(items: Vec<T>, next_cursor: Option<String>) -> Self {
        let has_more = next_cursor.is_some();
        Self {
            items,
            next_cursor,
            has_more,
            total: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalVariant {
    pub id: String,
    pub sku: Option<String>,
    pub title: Option<String>,
    pub price: Option<String>,
    pub inventory_quantity: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalProduct {
    pub id: String,
    pub title: String,
    pub status: Option<String>,
    pub vendor: Option<String>,
    pub variants: Vec<ExternalVariant>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ExternalProduct {
    /// First variant SKU that is present and non-empty.
    pub fn primary_sku(&self) -> Option<&str> {
        self.variants
            .iter()
            .filter_map(|v| v.sku.as_deref())
            .find(|sku| !sku.is_empty())
    }

    /// Sum of reported variant quantities, if any variant reported one.
    pub fn total_quantity(&self) -> Option<i64> {
        let mut seen = false;
        let total = self
            .variants
            .iter()
            .filter_map(|v| v.inventory_quantity)
            .inspect(|_| seen = true)
            .sum();
        seen.then_some(total)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalLineItem {
    pub id: Option<String>,
    pub sku: Option<String>,
    pub title: Option<String>,
    pub quantity: i64,
    pub price: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalOrder {
    pub id: String,
    pub order_number: Option<String>,
    pub status: Option<String>,
    pub financial_status: Option<String>,
    pub fulfillment_status: Option<String>,
    pub currency: Option<String>,
    pub total_price: Option<String>,
    pub line_items: Vec<ExternalLineItem>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InventoryLevel {
    pub sku: String,
    pub quantity: i64,
    pub location_id: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct TokenResult {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Resource family a webhook refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Product,
    Order,
    Inventory,
    Unknown,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Product => "product",
            ResourceType::Order => "order",
            ResourceType::Inventory => "inventory",
            ResourceType::Unknown => "unknown",
        }
    }

    /// Infers the resource from an event name such as `orders/create` or `ORDER_CHANGE`.
    pub fn infer(event_type: &str) -> Self {
        let lower = event_type.to_ascii_lowercase();
        if lower.contains("order") {
            ResourceType::Order
        } else if lower.contains("inventory") || lower.contains("stock") {
            ResourceType::Inventory
        } else if lower.contains("product") || lower.contains("listing") {
            ResourceType::Product
        } else {
            ResourceType::Unknown
        }
    }
}

/// Parsed webhook delivery.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub event_id: String,
    pub event_type: String,
    pub resource_type: ResourceType,
    pub resource_id: Option<String>,
    pub version: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

/// Transport metadata that some marketplaces only send as headers.
#[derive(Debug, Clone, Default)]
pub struct WebhookContext {
    pub topic: Option<String>,
    pub delivery_id: Option<String>,
}
