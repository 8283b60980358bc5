//! Shopify Admin REST adapter.
//!
//! Pagination follows the `Link: <...page_info=...>; rel="next"` header.
//! Access tokens issued to custom apps never expire.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, LINK};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};
use url::Url;

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

const DEFAULT_API_VERSION: &str = "2024-01";
const REQUESTS_PER_SECOND: f64 = 2.0;
const BURST: u32 = 4;
const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 250;
const INVENTORY_ITEM_CHUNK: usize = 50;
const ACCESS_TOKEN_HEADER: &str = "X-Shopify-Access-Token";

#[derive(Debug, Clone)]
struct ShopifySettings {
    base_url: String,
    access_token: String,
}

pub struct ShopifyAdapter {
    http: HttpClient,
    settings: Option<ShopifySettings>,
}

impl ShopifyAdapter {
    pub fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            http: HttpClient::new(REQUESTS_PER_SECOND, BURST)?,
            settings: None,
        })
    }

    fn settings(&self) -> Result<&ShopifySettings, AdapterError> {
        self.settings
            .as_ref()
            .ok_or_else(|| AdapterError::configuration("shopify adapter not initialized"))
    }

    fn url(&self, path: &str) -> Result<Url, AdapterError> {
        let settings = self.settings()?;
        Url::parse(&format!("{}{}", settings.base_url, path))
            .map_err(|e| AdapterError::configuration(format!("invalid shopify url: {e}")))
    }

    async fn get<T: for<'de> Deserialize<'de>>(
        &self,
        url: Url,
    ) -> Result<(T, Option<String>), AdapterError> {
        let settings = self.settings()?;
        let request = self
            .http
            .client()
            .get(url)
            .header(ACCESS_TOKEN_HEADER, &settings.access_token);
        let response = self.http.send(request).await?;
        let next = next_page_info(response.headers());
        let body = response
            .json::<T>()
            .await
            .map_err(|e| AdapterError::malformed(e.to_string()))?;
        Ok((body, next))
    }

    /// Maps SKU to inventory item id for the requested SKUs by walking the catalog.
    async fn inventory_items_for(
        &self,
        skus: &[String],
    ) -> Result<HashMap<i64, String>, AdapterError> {
        let mut wanted: HashMap<i64, String> = HashMap::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut url = self.url("/products.json")?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("limit", &MAX_LIMIT.to_string());
                query.append_pair("fields", "id,variants");
                if let Some(page_info) = &cursor {
                    query.append_pair("page_info", page_info);
                }
            }
            let (body, next): (ProductsEnvelope, _) = self.get(url).await?;
            for product in body.products {
                for variant in product.variants {
                    if let (Some(sku), Some(item_id)) = (variant.sku, variant.inventory_item_id) {
                        if skus.iter().any(|s| s == &sku) {
                            wanted.insert(item_id, sku);
                        }
                    }
                }
            }
            if wanted.len() >= skus.len() || next.is_none() {
                break;
            }
            cursor = next;
        }
        Ok(wanted)
    }
}

#[async_trait]
impl MarketplaceAdapter for ShopifyAdapter {
    fn marketplace(&self) -> MarketplaceType {
        MarketplaceType::Shopify
    }

    async fn initialize(&mut self, credentials: &Value) -> Result<(), AdapterError> {
        let access_token = required_credential(credentials, "access_token")?;
        let base_url = match optional_credential(credentials, "base_url") {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                let store = required_credential(credentials, "store")?;
                let version = optional_credential(credentials, "api_version")
                    .unwrap_or_else(|| DEFAULT_API_VERSION.to_string());
                let host = if store.contains('.') {
                    store
                } else {
                    format!("{store}.myshopify.com")
                };
                format!("https://{host}/admin/api/{version}")
            }
        };
        self.settings = Some(ShopifySettings {
            base_url,
            access_token,
        });
        Ok(())
    }

    async fn test_connection(&self) -> Result<(), AdapterError> {
        let url = self.url("/shop.json")?;
        let _: (Value, _) = self.get(url).await?;
        Ok(())
    }

    async fn refresh_token(&self) -> Result<TokenResult, AdapterError> {
        let settings = self.settings()?;
        Ok(TokenResult {
            access_token: settings.access_token.clone(),
            refresh_token: None,
            expires_at: None,
        })
    }

    #[instrument(skip(self, options), fields(cursor = ?options.cursor))]
    async fn get_products(
        &self,
        options: &ListOptions,
    ) -> Result<Page<ExternalProduct>, AdapterError> {
        let mut url = self.url("/products.json")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &page_limit(options.limit).to_string());
            // Shopify rejects filters alongside page_info.
            if let Some(page_info) = &options.cursor {
                query.append_pair("page_info", page_info);
            } else {
                if let Some(updated_after) = options.updated_after {
                    query.append_pair("updated_at_min", &updated_after.to_rfc3339());
                }
                if let Some(status) = &options.status {
                    query.append_pair("status", status);
                }
            }
        }
        let (body, next): (ProductsEnvelope, _) = self.get(url).await?;
        debug!(count = body.products.len(), has_next = next.is_some(), "fetched shopify products");
        Ok(Page::with_next(
            body.products.into_iter().map(Into::into).collect(),
            next,
        ))
    }

    async fn get_product(&self, id: &str) -> Result<ExternalProduct, AdapterError> {
        let url = self.url(&format!("/products/{id}.json"))?;
        let (body, _): (ProductEnvelope, _) = self.get(url).await?;
        Ok(body.product.into())
    }

    #[instrument(skip(self, options), fields(cursor = ?options.cursor))]
    async fn get_orders(
        &self,
        options: &OrderListOptions,
    ) -> Result<Page<ExternalOrder>, AdapterError> {
        let mut url = self.url("/orders.json")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &page_limit(options.limit).to_string());
            if let Some(page_info) = &options.cursor {
                query.append_pair("page_info", page_info);
            } else {
                query.append_pair("status", options.status.as_deref().unwrap_or("any"));
                if let Some(after) = options.created_after {
                    query.append_pair("created_at_min", &after.to_rfc3339());
                }
                if let Some(before) = options.created_before {
                    query.append_pair("created_at_max", &before.to_rfc3339());
                }
                if let Some(updated_after) = options.updated_after {
                    query.append_pair("updated_at_min", &updated_after.to_rfc3339());
                }
            }
        }
        let (body, next): (OrdersEnvelope, _) = self.get(url).await?;
        Ok(Page::with_next(
            body.orders.into_iter().map(Into::into).collect(),
            next,
        ))
    }

    async fn get_order(&self, id: &str) -> Result<ExternalOrder, AdapterError> {
        let url = self.url(&format!("/orders/{id}.json"))?;
        let (body, _): (OrderEnvelope, _) = self.get(url).await?;
        Ok(body.order.into())
    }

    async fn get_inventory(
        &self,
        skus: &[String],
    ) -> Result<HashMap<String, InventoryLevel>, AdapterError> {
        if skus.is_empty() {
            return Ok(HashMap::new());
        }
        let items = self.inventory_items_for(skus).await?;
        let ids: Vec<i64> = items.keys().copied().collect();
        let mut levels: HashMap<String, InventoryLevel> = HashMap::new();

        for chunk in ids.chunks(INVENTORY_ITEM_CHUNK) {
            let mut url = self.url("/inventory_levels.json")?;
            let joined = chunk
                .iter()
                .map(i64::to_string)
                .collect::<Vec<_>>()
                .join(",");
            url.query_pairs_mut()
                .append_pair("inventory_item_ids", &joined)
                .append_pair("limit", &MAX_LIMIT.to_string());
            let (body, _): (InventoryLevelsEnvelope, _) = self.get(url).await?;

            for level in body.inventory_levels {
                let Some(sku) = items.get(&level.inventory_item_id) else {
                    continue;
                };
                let location = level.location_id.to_string();
                let entry = levels.entry(sku.clone()).or_insert_with(|| InventoryLevel {
                    sku: sku.clone(),
                    quantity: 0,
                    location_id: Some(location.clone()),
                    updated_at: None,
                });
                entry.quantity += level.available.unwrap_or(0);
                // Quantities summed across several locations have no single location.
                if entry.location_id.as_deref() != Some(location.as_str()) {
                    entry.location_id = None;
                }
                entry.updated_at = entry.updated_at.max(level.updated_at);
            }
        }
        Ok(levels)
    }

    fn verify_webhook(&self, payload: &[u8], signature: &str, secret: &str) -> bool {
        verify_hmac_sha256(payload, secret, signature, SignatureEncoding::Base64)
    }

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
            .ok_or_else(|| AdapterError::malformed("missing shopify webhook topic"))?;
        let resource_type = ResourceType::infer(&topic);

        let resource_id = match resource_type {
            ResourceType::Inventory => body.get("inventory_item_id"),
            _ => body.get("id"),
        }
        .and_then(json_id);

        let timestamp = body
            .get("updated_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let event_id = context.delivery_id.clone().unwrap_or_else(|| {
            format!(
                "{}-{}-{}",
                topic,
                resource_id.as_deref().unwrap_or("unknown"),
                timestamp.timestamp_millis()
            )
        });

        Ok(WebhookEvent {
            event_id,
            event_type: topic,
            resource_type,
            resource_id,
            version: None,
            timestamp,
            payload: body,
        })
    }
}

fn page_limit(limit: u32) -> u32 {
    match limit {
        0 => DEFAULT_LIMIT,
        n => n.min(MAX_LIMIT),
    }
}

fn json_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Extracts `page_info` from the `rel="next"` entry of a Link header.
fn next_page_info(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;
    link.split(',')
        .find(|part| part.contains("rel=\"next\""))
        .and_then(|part| {
            let start = part.find('<')? + 1;
            let end = part.find('>')?;
            Url::parse(part.get(start..end)?).ok()
        })
        .and_then(|url| {
            url.query_pairs()
                .find(|(k, _)| k == "page_info")
                .map(|(_, v)| v.into_owned())
        })
}

#[derive(Debug, Deserialize)]
struct ProductsEnvelope {
    #[serde(default)]
    products: Vec<ShopifyProduct>,
}

#[derive(Debug, Deserialize)]
struct ProductEnvelope {
    product: ShopifyProduct,
}

#[derive(Debug, Deserialize)]
struct ShopifyProduct {
    id: i64,
    #[serde(default)]
    title: String,
    status: Option<String>,
    vendor: Option<String>,
    #[serde(default)]
    variants: Vec<ShopifyVariant>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ShopifyVariant {
    id: i64,
    sku: Option<String>,
    title: Option<String>,
    price: Option<String>,
    inventory_quantity: Option<i64>,
    inventory_item_id: Option<i64>,
}

impl From<ShopifyProduct> for ExternalProduct {
    fn from(p: ShopifyProduct) -> Self {
        ExternalProduct {
            id: p.id.to_string(),
            title: p.title,
            status: p.status,
            vendor: p.vendor,
            variants: p
                .variants
                .into_iter()
                .map(|v| ExternalVariant {
                    id: v.id.to_string(),
                    sku: v.sku,
                    title: v.title,
                    price: v.price,
                    inventory_quantity: v.inventory_quantity,
                })
                .collect(),
            created_at: p.created_at,
            updated_at: p.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OrdersEnvelope {
    #[serde(default)]
    orders: Vec<ShopifyOrder>,
}

#[derive(Debug, Deserialize)]
struct OrderEnvelope {
    order: ShopifyOrder,
}

#[derive(Debug, Deserialize)]
struct ShopifyOrder {
    id: i64,
    name: Option<String>,
    financial_status: Option<String>,
    fulfillment_status: Option<String>,
    cancelled_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
    currency: Option<String>,
    total_price: Option<String>,
    #[serde(default)]
    line_items: Vec<ShopifyLineItem>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ShopifyLineItem {
    id: Option<i64>,
    sku: Option<String>,
    title: Option<String>,
    #[serde(default)]
    quantity: i64,
    price: Option<String>,
}

impl From<ShopifyOrder> for ExternalOrder {
    fn from(o: ShopifyOrder) -> Self {
        let status = if o.cancelled_at.is_some() {
            "cancelled"
        } else if o.closed_at.is_some() {
            "closed"
        } else {
            "open"
        };
        ExternalOrder {
            id: o.id.to_string(),
            order_number: o.name,
            status: Some(status.to_string()),
            financial_status: o.financial_status,
            fulfillment_status: o.fulfillment_status,
            currency: o.currency,
            total_price: o.total_price,
            line_items: o
                .line_items
                .into_iter()
                .map(|li| ExternalLineItem {
                    id: li.id.map(|id| id.to_string()),
                    sku: li.sku,
                    title: li.title,
                    quantity: li.quantity,
                    price: li.price,
                })
                .collect(),
            created_at: o.created_at,
            updated_at: o.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct InventoryLevelsEnvelope {
    #[serde(default)]
    inventory_levels: Vec<ShopifyInventoryLevel>,
}

#[derive(Debug, Deserialize)]
struct ShopifyInventoryLevel {
    inventory_item_id: i64,
    location_id: i64,
    available: Option<i64>,
    updated_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn link_header_next_page_info() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static(
                "<https://shop.myshopify.com/admin/api/2024-01/products.json?limit=50&page_info=prev1>; rel=\"previous\", \
                 <https://shop.myshopify.com/admin/api/2024-01/products.json?limit=50&page_info=next2>; rel=\"next\"",
            ),
        );
        assert_eq!(next_page_info(&headers).as_deref(), Some("next2"));
        assert_eq!(next_page_info(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn parse_webhook_uses_topic_and_delivery_headers() {
        let mut adapter = ShopifyAdapter::new().unwrap();
        adapter
            .initialize(&serde_json::json!({"store": "demo", "access_token": "tok"}))
            .await
            .unwrap();

        let body = br#"{"id": 450789469, "updated_at": "2025-03-01T10:00:00-05:00"}"#;
        let event = adapter
            .parse_webhook(
                body,
                &WebhookContext {
                    topic: Some("orders/updated".into()),
                    delivery_id: Some("delivery-1".into()),
                },
            )
            .unwrap();

        assert_eq!(event.event_id, "delivery-1");
        assert_eq!(event.resource_type, ResourceType::Order);
        assert_eq!(event.resource_id.as_deref(), Some("450789469"));
        assert_eq!(event.timestamp.to_rfc3339(), "2025-03-01T15:00:00+00:00");
        assert_eq!(event.version, None);
    }
}
