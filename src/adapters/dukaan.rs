//! Dukaan storefront API adapter.
//!
//! Page-numbered pagination; the cursor is the next page number as a string.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::RequestBuilder;
use serde::Deserialize;
use serde_json::Value;
use tracing::instrument;

use super::{
    http::{HttpClient, optional_credential, required_credential},
    signature::{SignatureEncoding, verify_hmac_sha256},
    trait_::{AdapterError, MarketplaceAdapter},
    types::{
        ExternalLineItem, ExternalOrder, ExternalProduct, ExternalVariant, InventoryLevel,
        ListOptions, OrderListOptions, Page, ResourceType, TokenResult, WebhookContext,
        WebhookEvent,
    },
};
use crate::models::marketplace_connection::MarketplaceType;

const DEFAULT_BASE_URL: &str = "https://api.mydukaan.io/api/v1";
const REQUESTS_PER_SECOND: f64 = 10.0;
const BURST: u32 = 10;
const DEFAULT_LIMIT: u32 = 50;
const INVENTORY_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Clone)]
struct DukaanSettings {
    base_url: String,
    api_key: String,
    store_id: String,
}

pub struct DukaanAdapter {
    http: HttpClient,
    settings: Option<DukaanSettings>,
}

impl DukaanAdapter {
    pub fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            http: HttpClient::new(REQUESTS_PER_SECOND, BURST)?,
            settings: None,
        })
    }

    fn request(&self, path: &str) -> Result<RequestBuilder, AdapterError> {
        let settings = self
            .settings
            .as_ref()
            .ok_or_else(|| AdapterError::configuration("dukaan adapter not initialized"))?;
        Ok(self
            .http
            .client()
            .get(format!("{}{}", settings.base_url, path))
            .bearer_auth(&settings.api_key)
            .header("X-Store-ID", &settings.store_id))
    }
}

fn page_number(cursor: Option<&str>) -> Result<u32, AdapterError> {
    match cursor {
        None => Ok(1),
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|_| AdapterError::configuration(format!("invalid dukaan cursor '{raw}'"))),
    }
}

fn next_cursor(pagination: &DukaanPagination) -> Option<String> {
    let has_next = pagination.has_next || pagination.current_page < pagination.total_pages;
    has_next.then(|| (pagination.current_page + 1).to_string())
}

#[async_trait]
impl MarketplaceAdapter for DukaanAdapter {
    fn marketplace(&self) -> MarketplaceType {
        MarketplaceType::Dukaan
    }

    async fn initialize(&mut self, credentials: &Value) -> Result<(), AdapterError> {
        let api_key = required_credential(credentials, "api_key")?;
        let store_id = required_credential(credentials, "store_id")?;
        let base_url = optional_credential(credentials, "base_url")
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        self.settings = Some(DukaanSettings {
            base_url,
            api_key,
            store_id,
        });
        Ok(())
    }

    async fn test_connection(&self) -> Result<(), AdapterError> {
        let request = self.request("/store")?;
        self.http.send(request).await?;
        Ok(())
    }

    async fn refresh_token(&self) -> Result<TokenResult, AdapterError> {
        Err(AdapterError::Unsupported(
            "dukaan api keys do not expire".to_string(),
        ))
    }

    #[instrument(skip(self, options), fields(cursor = ?options.cursor))]
    async fn get_products(
        &self,
        options: &ListOptions,
    ) -> Result<Page<ExternalProduct>, AdapterError> {
        let page = page_number(options.cursor.as_deref())?;
        let limit = if options.limit == 0 {
            DEFAULT_LIMIT
        } else {
            options.limit
        };
        let mut query = vec![("limit", limit.to_string()), ("page", page.to_string())];
        if let Some(status) = &options.status {
            query.push(("status", status.clone()));
        }
        if let Some(updated_after) = options.updated_after {
            query.push(("updated_after", updated_after.to_rfc3339()));
        }

        let request = self.request("/products")?.query(&query);
        let body: DukaanListEnvelope<ProductsData> = self.http.send_json(request).await?;
        if !body.success {
            return Err(AdapterError::malformed("dukaan reported success=false"));
        }

        let next = next_cursor(&body.data.pagination);
        let mut result = Page::with_next(
            body.data.products.into_iter().map(Into::into).collect(),
            next,
        );
        result.total = Some(body.data.pagination.total);
        Ok(result)
    }

    async fn get_product(&self, id: &str) -> Result<ExternalProduct, AdapterError> {
        let request = self.request(&format!("/products/{id}"))?;
        let body: DukaanItemEnvelope<DukaanProduct> = self.http.send_json(request).await?;
        Ok(body.data.into())
    }

    #[instrument(skip(self, options), fields(cursor = ?options.cursor))]
    async fn get_orders(
        &self,
        options: &OrderListOptions,
    ) -> Result<Page<ExternalOrder>, AdapterError> {
        let page = page_number(options.cursor.as_deref())?;
        let limit = if options.limit == 0 {
            DEFAULT_LIMIT
        } else {
            options.limit
        };
        let mut query = vec![("limit", limit.to_string()), ("page", page.to_string())];
        // Dukaan filters by calendar date only.
        let created_after = options.created_after.or(options.updated_after);
        if let Some(after) = created_after {
            query.push(("created_after", after.format("%Y-%m-%d").to_string()));
        }
        if let Some(before) = options.created_before {
            query.push(("created_before", before.format("%Y-%m-%d").to_string()));
        }
        if let Some(status) = &options.status {
            query.push(("status", status.clone()));
        }

        let request = self.request("/orders")?.query(&query);
        let body: DukaanListEnvelope<OrdersData> = self.http.send_json(request).await?;
        if !body.success {
            return Err(AdapterError::malformed("dukaan reported success=false"));
        }

        let next = next_cursor(&body.data.pagination);
        let mut result = Page::with_next(
            body.data.orders.into_iter().map(Into::into).collect(),
            next,
        );
        result.total = Some(body.data.pagination.total);
        Ok(result)
    }

    async fn get_order(&self, id: &str) -> Result<ExternalOrder, AdapterError> {
        let request = self.request(&format!("/orders/{id}"))?;
        let body: DukaanItemEnvelope<DukaanOrder> = self.http.send_json(request).await?;
        Ok(body.data.into())
    }

    /// Stock is only exposed on products, so this walks the catalog.
    async fn get_inventory(
        &self,
        skus: &[String],
    ) -> Result<HashMap<String, InventoryLevel>, AdapterError> {
        let mut levels = HashMap::new();
        if skus.is_empty() {
            return Ok(levels);
        }

        let mut options = ListOptions {
            limit: INVENTORY_PAGE_LIMIT,
            ..ListOptions::default()
        };
        loop {
            let page = self.get_products(&options).await?;
            for product in page.items {
                for variant in &product.variants {
                    let Some(sku) = variant.sku.as_ref() else {
                        continue;
                    };
                    if skus.contains(sku) {
                        levels.insert(
                            sku.clone(),
                            InventoryLevel {
                                sku: sku.clone(),
                                quantity: variant.inventory_quantity.unwrap_or(0),
                                location_id: None,
                                updated_at: product.updated_at,
                            },
                        );
                    }
                }
            }
            if levels.len() >= skus.len() || !page.has_more {
                break;
            }
            options.cursor = page.next_cursor;
        }
        Ok(levels)
    }

    fn verify_webhook(&self, payload: &[u8], signature: &str, secret: &str) -> bool {
        verify_hmac_sha256(payload, secret, signature, SignatureEncoding::Hex)
    }

    fn parse_webhook(
        &self,
        payload: &[u8],
        context: &WebhookContext,
    ) -> Result<WebhookEvent, AdapterError> {
        let body: DukaanWebhook = serde_json::from_slice(payload)
            .map_err(|e| AdapterError::malformed(format!("webhook body: {e}")))?;
        let raw: Value = serde_json::from_slice(payload)
            .map_err(|e| AdapterError::malformed(format!("webhook body: {e}")))?;

        let event_type = body
            .event
            .or_else(|| context.topic.clone())
            .ok_or_else(|| AdapterError::malformed("missing dukaan event name"))?;
        let event_id = body
            .id
            .as_ref()
            .and_then(value_to_string)
            .or_else(|| context.delivery_id.clone())
            .ok_or_else(|| AdapterError::malformed("missing dukaan event id"))?;
        let resource_id = body
            .data
            .as_ref()
            .and_then(|d| d.get("id"))
            .and_then(value_to_string);
        let timestamp = body
            .data
            .as_ref()
            .and_then(|d| d.get("updated_at"))
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(WebhookEvent {
            event_id,
            resource_type: ResourceType::infer(&event_type),
            event_type,
            resource_id,
            version: body.version,
            timestamp,
            payload: raw,
        })
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn money(value: f64) -> String {
    format!("{value:.2}")
}

fn fulfillment_status(status: &str) -> String {
    match status {
        "pending" | "processing" => "unfulfilled",
        "shipped" | "delivered" => "fulfilled",
        other => other,
    }
    .to_string()
}

#[derive(Debug, Deserialize)]
struct DukaanWebhook {
    event: Option<String>,
    id: Option<Value>,
    version: Option<i64>,
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct DukaanListEnvelope<T> {
    #[serde(default)]
    success: bool,
    data: T,
}

#[derive(Debug, Deserialize)]
struct DukaanItemEnvelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct DukaanPagination {
    current_page: u32,
    #[serde(default)]
    total_pages: u32,
    #[serde(default)]
    total: u64,
    #[serde(default)]
    has_next: bool,
}

#[derive(Debug, Deserialize)]
struct ProductsData {
    #[serde(default)]
    products: Vec<DukaanProduct>,
    pagination: DukaanPagination,
}

#[derive(Debug, Deserialize)]
struct OrdersData {
    #[serde(default)]
    orders: Vec<DukaanOrder>,
    pagination: DukaanPagination,
}

#[derive(Debug, Deserialize)]
struct DukaanProduct {
    id: String,
    #[serde(default)]
    name: String,
    sku: Option<String>,
    #[serde(default)]
    stock: i64,
    #[serde(default)]
    price: f64,
    sale_price: Option<f64>,
    #[serde(default)]
    variants: Vec<DukaanVariant>,
    status: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct DukaanVariant {
    id: String,
    name: Option<String>,
    sku: Option<String>,
    #[serde(default)]
    price: f64,
    sale_price: Option<f64>,
    #[serde(default)]
    stock: i64,
}

impl From<DukaanProduct> for ExternalProduct {
    fn from(p: DukaanProduct) -> Self {
        // A product without variants is its own single variant.
        let variants = if p.variants.is_empty() {
            vec![ExternalVariant {
                id: p.id.clone(),
                sku: p.sku,
                title: Some(p.name.clone()),
                price: Some(money(p.sale_price.unwrap_or(p.price))),
                inventory_quantity: Some(p.stock),
            }]
        } else {
            p.variants
                .into_iter()
                .map(|v| ExternalVariant {
                    id: v.id,
                    sku: v.sku,
                    title: v.name,
                    price: Some(money(v.sale_price.unwrap_or(v.price))),
                    inventory_quantity: Some(v.stock),
                })
                .collect()
        };
        ExternalProduct {
            id: p.id,
            title: p.name,
            status: p.status,
            vendor: None,
            variants,
            created_at: p.created_at,
            updated_at: p.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DukaanOrder {
    id: String,
    order_number: Option<String>,
    #[serde(default)]
    status: String,
    payment_status: Option<String>,
    #[serde(default)]
    total: f64,
    currency: Option<String>,
    #[serde(default)]
    line_items: Vec<DukaanLineItem>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct DukaanLineItem {
    id: Option<String>,
    name: Option<String>,
    sku: Option<String>,
    #[serde(default)]
    quantity: i64,
    #[serde(default)]
    price: f64,
}

impl From<DukaanOrder> for ExternalOrder {
    fn from(o: DukaanOrder) -> Self {
        ExternalOrder {
            id: o.id,
            order_number: o.order_number,
            fulfillment_status: Some(fulfillment_status(&o.status)),
            status: Some(o.status),
            financial_status: o.payment_status,
            currency: o.currency,
            total_price: Some(money(o.total)),
            line_items: o
                .line_items
                .into_iter()
                .map(|li| ExternalLineItem {
                    id: li.id,
                    sku: li.sku,
                    title: li.name,
                    quantity: li.quantity,
                    price: Some(money(li.price)),
                })
                .collect(),
            created_at: o.created_at,
            updated_at: o.updated_at,
        }
    }
}
