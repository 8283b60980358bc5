//! Amazon Selling Partner API adapter.
//!
//! Access tokens come from Login with Amazon and are refreshed when they are
//! within five minutes of expiry.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::RequestBuilder;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use super::{
    http::{HttpClient, optional_credential, required_credential},
    signature::{SignatureEncoding, verify_hmac_sha256},
    trait_::{AdapterError, MarketplaceAdapter},
    types::{
        ExternalOrder, ExternalProduct, InventoryLevel, ListOptions, OrderListOptions, Page,
        ResourceType, TokenResult, WebhookContext, WebhookEvent,
    },
};
use crate::models::marketplace_connection::MarketplaceType;

const NA_ENDPOINT: &str = "https://sellingpartnerapi-na.amazon.com";
const EU_ENDPOINT: &str = "https://sellingpartnerapi-eu.amazon.com";
const FE_ENDPOINT: &str = "https://sellingpartnerapi-fe.amazon.com";
const LWA_TOKEN_ENDPOINT: &str = "https://api.amazon.com/auth/o2/token";
const REQUESTS_PER_SECOND: f64 = 5.0;
const BURST: u32 = 5;
const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 100;
const SKUS_PER_INVENTORY_CALL: usize = 50;
const TOKEN_REFRESH_MARGIN_MINUTES: i64 = 5;
const ACCESS_TOKEN_HEADER: &str = "x-amz-access-token";

#[derive(Debug, Clone)]
struct AmazonSettings {
    base_url: String,
    token_url: String,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    seller_id: String,
    marketplace_id: String,
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now < expires_at - ChronoDuration::minutes(TOKEN_REFRESH_MARGIN_MINUTES),
            None => false,
        }
    }
}

pub struct AmazonAdapter {
    http: HttpClient,
    settings: Option<AmazonSettings>,
    token: RwLock<Option<AccessToken>>,
}

pub fn regional_endpoint(region: &str) -> &'static str {
    match region.to_ascii_lowercase().as_str() {
        "eu" => EU_ENDPOINT,
        "fe" => FE_ENDPOINT,
        _ => NA_ENDPOINT,
    }
}

impl AmazonAdapter {
    pub fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            http: HttpClient::new(REQUESTS_PER_SECOND, BURST)?,
            settings: None,
            token: RwLock::new(None),
        })
    }

    fn settings(&self) -> Result<&AmazonSettings, AdapterError> {
        self.settings
            .as_ref()
            .ok_or_else(|| AdapterError::configuration("amazon adapter not initialized"))
    }

    /// Returns a token that is valid for at least the refresh margin.
    async fn access_token(&self) -> Result<String, AdapterError> {
        {
            let guard = self.token.read().await;
            if let Some(token) = guard.as_ref() {
                if token.is_fresh(Utc::now()) {
                    return Ok(token.value.clone());
                }
            }
        }
        let refreshed = self.refresh_token().await?;
        Ok(refreshed.access_token)
    }

    async fn request(&self, path: &str) -> Result<RequestBuilder, AdapterError> {
        let token = self.access_token().await?;
        let settings = self.settings()?;
        Ok(self
            .http
            .client()
            .get(format!("{}{}", settings.base_url, path))
            .header(ACCESS_TOKEN_HEADER, token))
    }
}

#[async_trait]
impl MarketplaceAdapter for AmazonAdapter {
    fn marketplace(&self) -> MarketplaceType {
        MarketplaceType::Amazon
    }

    async fn initialize(&mut self, credentials: &Value) -> Result<(), AdapterError> {
        let region =
            optional_credential(credentials, "region").unwrap_or_else(|| "na".to_string());
        let settings = AmazonSettings {
            base_url: optional_credential(credentials, "base_url")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| regional_endpoint(&region).to_string()),
            token_url: optional_credential(credentials, "token_url")
                .unwrap_or_else(|| LWA_TOKEN_ENDPOINT.to_string()),
            client_id: required_credential(credentials, "client_id")?,
            client_secret: required_credential(credentials, "client_secret")?,
            refresh_token: required_credential(credentials, "refresh_token")?,
            seller_id: required_credential(credentials, "seller_id")?,
            marketplace_id: required_credential(credentials, "marketplace_id")?,
        };
        self.settings = Some(settings);

        if let Some(value) = optional_credential(credentials, "access_token") {
            let expires_at = optional_credential(credentials, "token_expires_at")
                .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
                .map(|dt| dt.with_timezone(&Utc));
            *self.token.get_mut() = Some(AccessToken { value, expires_at });
        }

        let fresh = self
            .token
            .get_mut()
            .as_ref()
            .map(|t| t.is_fresh(Utc::now()))
            .unwrap_or(false);
        if !fresh {
            self.refresh_token().await?;
        }
        Ok(())
    }

    async fn test_connection(&self) -> Result<(), AdapterError> {
        let request = self.request("/sellers/v1/marketplaceParticipations").await?;
        self.http.send(request).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn refresh_token(&self) -> Result<TokenResult, AdapterError> {
        let settings = self.settings()?;
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", settings.refresh_token.as_str()),
            ("client_id", settings.client_id.as_str()),
            ("client_secret", settings.client_secret.as_str()),
        ];
        let request = self.http.client().post(&settings.token_url).form(&form);
        let response: LwaTokenResponse =
            self.http.send_json(request).await.map_err(|err| match err {
                AdapterError::Http { status, body, .. } if status == 400 || status == 401 => {
                    AdapterError::Authentication {
                        details: format!("token refresh rejected ({status}): {body}"),
                    }
                }
                other => other,
            })?;

        let expires_at = Utc::now() + ChronoDuration::seconds(response.expires_in);
        *self.token.write().await = Some(AccessToken {
            value: response.access_token.clone(),
            expires_at: Some(expires_at),
        });
        info!(%expires_at, "refreshed amazon access token");

        Ok(TokenResult {
            access_token: response.access_token,
            // Refresh tokens are not rotated.
            refresh_token: Some(settings.refresh_token.clone()),
            expires_at: Some(expires_at),
        })
    }

    #[instrument(skip(self, options), fields(cursor = ?options.cursor))]
    async fn get_products(
        &self,
        options: &ListOptions,
    ) -> Result<Page<ExternalProduct>, AdapterError> {
        let settings = self.settings()?;
        let page_size = match options.limit {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };
        let mut query = vec![
            ("marketplaceIds", settings.marketplace_id.clone()),
            ("sellerId", settings.seller_id.clone()),
            ("includedData", "summaries".to_string()),
            ("pageSize", page_size.to_string()),
        ];
        if let Some(token) = &options.cursor {
            query.push(("pageToken", token.clone()));
        }

        let request = self.request("/catalog/2022-04-01/items").await?.query(&query);
        let body: CatalogSearchResponse = self.http.send_json(request).await?;
        let marketplace_id = settings.marketplace_id.as_str();
        let items = body
            .items
            .into_iter()
            .map(|item| item.into_product(marketplace_id))
            .collect();
        let next = body
            .pagination
            .and_then(|p| p.next_token)
            .filter(|t| !t.is_empty());
        Ok(Page::with_next(items, next))
    }

    async fn get_product(&self, id: &str) -> Result<ExternalProduct, AdapterError> {
        let settings = self.settings()?;
        let request = self
            .request(&format!("/catalog/2022-04-01/items/{id}"))
            .await?
            .query(&[
                ("marketplaceIds", settings.marketplace_id.as_str()),
                ("includedData", "summaries"),
            ]);
        let item: CatalogItem = self.http.send_json(request).await?;
        Ok(item.into_product(&settings.marketplace_id))
    }

    #[instrument(skip(self, options), fields(cursor = ?options.cursor))]
    async fn get_orders(
        &self,
        options: &OrderListOptions,
    ) -> Result<Page<ExternalOrder>, AdapterError> {
        let settings = self.settings()?;
        let mut query = vec![("MarketplaceIds", settings.marketplace_id.clone())];
        if let Some(token) = &options.cursor {
            query.push(("NextToken", token.clone()));
        } else {
            // The Orders API requires either CreatedAfter or LastUpdatedAfter.
            match (options.updated_after, options.created_after) {
                (Some(updated), _) => query.push(("LastUpdatedAfter", updated.to_rfc3339())),
                (None, Some(created)) => query.push(("CreatedAfter", created.to_rfc3339())),
                (None, None) => query.push((
                    "CreatedAfter",
                    (Utc::now() - ChronoDuration::days(30)).to_rfc3339(),
                )),
            }
            if let Some(before) = options.created_before {
                query.push(("CreatedBefore", before.to_rfc3339()));
            }
            if let Some(status) = &options.status {
                query.push(("OrderStatuses", status.clone()));
            }
        }
        if options.limit > 0 {
            query.push(("MaxResultsPerPage", options.limit.min(MAX_PAGE_SIZE).to_string()));
        }

        let request = self.request("/orders/v0/orders").await?.query(&query);
        let body: OrdersResponse = self.http.send_json(request).await?;
        let next = body.payload.next_token.filter(|t| !t.is_empty());
        Ok(Page::with_next(
            body.payload.orders.into_iter().map(Into::into).collect(),
            next,
        ))
    }

    async fn get_order(&self, id: &str) -> Result<ExternalOrder, AdapterError> {
        let request = self.request(&format!("/orders/v0/orders/{id}")).await?;
        let body: OrderResponse = self.http.send_json(request).await?;
        Ok(body.payload.into())
    }

    async fn get_inventory(
        &self,
        skus: &[String],
    ) -> Result<HashMap<String, InventoryLevel>, AdapterError> {
        let settings = self.settings()?;
        let mut levels = HashMap::new();
        for chunk in skus.chunks(SKUS_PER_INVENTORY_CALL) {
            let request = self
                .request("/fba/inventory/v1/summaries")
                .await?
                .query(&[
                    ("granularityType", "Marketplace"),
                    ("granularityId", settings.marketplace_id.as_str()),
                    ("marketplaceIds", settings.marketplace_id.as_str()),
                    ("sellerSkus", chunk.join(",").as_str()),
                ]);
            let body: InventoryResponse = self.http.send_json(request).await?;
            for summary in body.payload.inventory_summaries {
                let updated_at = summary
                    .last_updated_time
                    .as_deref()
                    .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                    .map(|dt| dt.with_timezone(&Utc));
                levels.insert(
                    summary.seller_sku.clone(),
                    InventoryLevel {
                        sku: summary.seller_sku,
                        quantity: summary.fulfillable_quantity,
                        location_id: None,
                        updated_at,
                    },
                );
            }
        }
        debug!(requested = skus.len(), found = levels.len(), "fetched amazon inventory");
        Ok(levels)
    }

    fn verify_webhook(&self, payload: &[u8], signature: &str, secret: &str) -> bool {
        verify_hmac_sha256(payload, secret, signature, SignatureEncoding::Hex)
    }

    fn parse_webhook(
        &self,
        payload: &[u8],
        _context: &WebhookContext,
    ) -> Result<WebhookEvent, AdapterError> {
        let notification: Notification = serde_json::from_slice(payload)
            .map_err(|e| AdapterError::malformed(format!("notification body: {e}")))?;
        let raw: Value = serde_json::from_slice(payload)
            .map_err(|e| AdapterError::malformed(format!("notification body: {e}")))?;

        let timestamp = notification
            .event_time
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let resource_type = ResourceType::infer(&notification.notification_type);
        let resource_id = notification.payload.as_ref().and_then(|p| {
            [
                "/OrderChangeNotification/AmazonOrderId",
                "/AmazonOrderId",
                "/SellerSKU",
                "/ASIN",
            ]
            .iter()
            .find_map(|pointer| p.pointer(pointer).and_then(Value::as_str))
            .map(str::to_string)
        });

        Ok(WebhookEvent {
            event_id: notification.notification_id,
            event_type: notification.notification_type,
            resource_type,
            resource_id,
            version: None,
            timestamp,
            payload: raw,
        })
    }
}

fn order_financial_status(status: &str) -> String {
    match status {
        "Pending" | "PendingAvailability" => "pending".to_string(),
        "Unshipped" | "Shipped" | "PartiallyShipped" => "paid".to_string(),
        "Canceled" => "cancelled".to_string(),
        other => other.to_ascii_lowercase(),
    }
}

fn order_fulfillment_status(status: &str) -> String {
    match status {
        "Shipped" => "fulfilled",
        "PartiallyShipped" => "partial",
        _ => "unfulfilled",
    }
    .to_string()
}

#[derive(Debug, Deserialize)]
struct LwaTokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Debug, Deserialize)]
struct Notification {
    #[serde(rename = "NotificationType")]
    notification_type: String,
    #[serde(rename = "NotificationId")]
    notification_id: String,
    #[serde(rename = "EventTime")]
    event_time: Option<String>,
    #[serde(rename = "Payload")]
    payload: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CatalogSearchResponse {
    #[serde(default)]
    items: Vec<CatalogItem>,
    pagination: Option<CatalogPagination>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogPagination {
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CatalogItem {
    asin: String,
    #[serde(default)]
    summaries: Vec<CatalogSummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogSummary {
    marketplace_id: String,
    item_name: Option<String>,
    brand: Option<String>,
}

impl CatalogItem {
    fn into_product(self, marketplace_id: &str) -> ExternalProduct {
        let summary = self
            .summaries
            .into_iter()
            .find(|s| s.marketplace_id == marketplace_id);
        let (title, vendor) = match summary {
            Some(s) => (s.item_name.unwrap_or_default(), s.brand),
            None => (String::new(), None),
        };
        ExternalProduct {
            id: self.asin,
            title,
            status: Some("active".to_string()),
            vendor,
            variants: Vec::new(),
            created_at: None,
            updated_at: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OrdersResponse {
    payload: OrdersPayload,
}

#[derive(Debug, Deserialize)]
struct OrdersPayload {
    #[serde(rename = "Orders", default)]
    orders: Vec<AmazonOrder>,
    #[serde(rename = "NextToken")]
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    payload: AmazonOrder,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AmazonOrder {
    amazon_order_id: String,
    purchase_date: Option<DateTime<Utc>>,
    last_update_date: Option<DateTime<Utc>>,
    #[serde(default)]
    order_status: String,
    order_total: Option<Money>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Money {
    amount: Option<String>,
    currency_code: Option<String>,
}

impl From<AmazonOrder> for ExternalOrder {
    fn from(o: AmazonOrder) -> Self {
        let (total_price, currency) = match o.order_total {
            Some(m) => (m.amount, m.currency_code),
            None => (None, None),
        };
        ExternalOrder {
            order_number: Some(o.amazon_order_id.clone()),
            id: o.amazon_order_id,
            financial_status: Some(order_financial_status(&o.order_status)),
            fulfillment_status: Some(order_fulfillment_status(&o.order_status)),
            status: Some(o.order_status),
            currency,
            total_price,
            line_items: Vec::new(),
            created_at: o.purchase_date,
            updated_at: o.last_update_date.or(o.purchase_date),
        }
    }
}

#[derive(Debug, Deserialize)]
struct InventoryResponse {
    payload: InventoryPayload,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InventoryPayload {
    #[serde(default)]
    inventory_summaries: Vec<InventorySummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InventorySummary {
    seller_sku: String,
    #[serde(default)]
    fulfillable_quantity: i64,
    last_updated_time: Option<String>,
}
