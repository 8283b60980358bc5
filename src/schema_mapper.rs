//! Maps marketplace-shaped products and orders onto the canonical record
//! format stored in `canonical_records.data`.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use thiserror::Error;

use crate::adapters::{ExternalOrder, ExternalProduct};
use crate::models::external_mapping::{ENTITY_ORDER, ENTITY_PRODUCT};
use crate::models::marketplace_connection::MarketplaceType;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("payload missing required field: {field}")]
    MissingField { field: &'static str },
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Canonical form of one external entity.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalEntity {
    pub entity_type: &'static str,
    pub external_id: String,
    pub sku: Option<String>,
    pub data: Value,
    /// Marketplace-side modification time, used to skip stale snapshots
    pub external_updated_at: Option<DateTime<Utc>>,
}

pub trait SchemaMapper: Send + Sync {
    fn map_product(
        &self,
        marketplace: MarketplaceType,
        product: &ExternalProduct,
    ) -> Result<CanonicalEntity, MappingError>;

    fn map_order(
        &self,
        marketplace: MarketplaceType,
        order: &ExternalOrder,
    ) -> Result<CanonicalEntity, MappingError>;
}

/// Field-for-field mapper shared by all marketplaces.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSchemaMapper;

impl SchemaMapper for DefaultSchemaMapper {
    fn map_product(
        &self,
        marketplace: MarketplaceType,
        product: &ExternalProduct,
    ) -> Result<CanonicalEntity, MappingError> {
        if product.id.trim().is_empty() {
            return Err(MappingError::MissingField { field: "id" });
        }
        if product.title.trim().is_empty() {
            return Err(MappingError::MissingField { field: "title" });
        }

        let variants: Vec<Value> = product
            .variants
            .iter()
            .map(|variant| -> Result<Value, MappingError> {
                Ok(json!({
                    "external_id": variant.id,
                    "sku": variant.sku,
                    "title": variant.title,
                    "price": parse_price("variants.price", variant.price.as_deref())?,
                    "quantity": variant.inventory_quantity,
                }))
            })
            .collect::<Result<_, MappingError>>()?;

        let sku = product.primary_sku().map(str::to_string);
        Ok(CanonicalEntity {
            entity_type: ENTITY_PRODUCT,
            external_id: product.id.clone(),
            data: json!({
                "marketplace": marketplace.as_str(),
                "external_id": product.id,
                "title": product.title.trim(),
                "status": normalize_product_status(product.status.as_deref()),
                "vendor": product.vendor,
                "sku": sku,
                "quantity": product.total_quantity(),
                "variants": variants,
                "created_at": product.created_at.map(|t| t.to_rfc3339()),
                "updated_at": product.updated_at.map(|t| t.to_rfc3339()),
            }),
            sku,
            external_updated_at: product.updated_at,
        })
    }

    fn map_order(
        &self,
        marketplace: MarketplaceType,
        order: &ExternalOrder,
    ) -> Result<CanonicalEntity, MappingError> {
        if order.id.trim().is_empty() {
            return Err(MappingError::MissingField { field: "id" });
        }

        let mut line_items = Vec::with_capacity(order.line_items.len());
        for item in &order.line_items {
            if item.quantity < 0 {
                return Err(MappingError::InvalidValue {
                    field: "line_items.quantity",
                    reason: format!("negative quantity {}", item.quantity),
                });
            }
            line_items.push(json!({
                "external_id": item.id,
                "sku": item.sku,
                "title": item.title,
                "quantity": item.quantity,
                "price": parse_price("line_items.price", item.price.as_deref())?,
            }));
        }

        Ok(CanonicalEntity {
            entity_type: ENTITY_ORDER,
            external_id: order.id.clone(),
            sku: None,
            data: json!({
                "marketplace": marketplace.as_str(),
                "external_id": order.id,
                "order_number": order.order_number,
                "status": order.status.as_deref().map(str::to_ascii_lowercase),
                "financial_status": order.financial_status,
                "fulfillment_status": order.fulfillment_status,
                "currency": order.currency.as_deref().map(str::to_ascii_uppercase),
                "total_price": parse_price("total_price", order.total_price.as_deref())?,
                "line_items": line_items,
                "placed_at": order.created_at.map(|t| t.to_rfc3339()),
                "updated_at": order.updated_at.map(|t| t.to_rfc3339()),
            }),
            external_updated_at: order.updated_at,
        })
    }
}

fn normalize_product_status(status: Option<&str>) -> &'static str {
    match status.map(str::to_ascii_lowercase).as_deref() {
        None | Some("active") | Some("published") | Some("live") => "active",
        Some("draft") | Some("inactive") | Some("unpublished") => "draft",
        Some("archived") | Some("deleted") => "archived",
        Some(_) => "unknown",
    }
}

/// Prices travel as strings; the canonical form is a decimal string with
/// two fraction digits.
fn parse_price(field: &'static str, raw: Option<&str>) -> Result<Option<String>, MappingError> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    let value: f64 = raw.parse().map_err(|_| MappingError::InvalidValue {
        field,
        reason: format!("not a number: {raw}"),
    })?;
    if !value.is_finite() || value < 0.0 {
        return Err(MappingError::InvalidValue {
            field,
            reason: format!("out of range: {raw}"),
        });
    }
    Ok(Some(format!("{value:.2}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{ExternalLineItem, ExternalVariant};

    fn product() -> ExternalProduct {
        ExternalProduct {
            id: "gid-1".into(),
            title: " Linen Shirt ".into(),
            status: Some("ACTIVE".into()),
            vendor: Some("Acme".into()),
            variants: vec![
                ExternalVariant {
                    id: "v1".into(),
                    sku: Some("SHIRT-S".into()),
                    title: Some("S".into()),
                    price: Some("19.5".into()),
                    inventory_quantity: Some(4),
                },
                ExternalVariant {
                    id: "v2".into(),
                    sku: Some("SHIRT-M".into()),
                    title: Some("M".into()),
                    price: None,
                    inventory_quantity: Some(6),
                },
            ],
            created_at: None,
            updated_at: Some(Utc::now()),
        }
    }

    #[test]
    fn maps_product_fields() {
        let mapped = DefaultSchemaMapper
            .map_product(MarketplaceType::Shopify, &product())
            .expect("maps");
        assert_eq!(mapped.entity_type, ENTITY_PRODUCT);
        assert_eq!(mapped.sku.as_deref(), Some("SHIRT-S"));
        assert_eq!(mapped.data["title"], "Linen Shirt");
        assert_eq!(mapped.data["status"], "active");
        assert_eq!(mapped.data["quantity"], 10);
        assert_eq!(mapped.data["variants"][0]["price"], "19.50");
    }

    #[test]
    fn product_without_title_is_rejected() {
        let mut p = product();
        p.title = "  ".into();
        let err = DefaultSchemaMapper
            .map_product(MarketplaceType::Dukaan, &p)
            .unwrap_err();
        assert_eq!(err, MappingError::MissingField { field: "title" });
    }

    #[test]
    fn order_with_negative_quantity_is_rejected() {
        let order = ExternalOrder {
            id: "1001".into(),
            order_number: Some("#1001".into()),
            status: Some("Open".into()),
            financial_status: None,
            fulfillment_status: None,
            currency: Some("inr".into()),
            total_price: Some("abc".into()),
            line_items: vec![ExternalLineItem {
                id: None,
                sku: Some("SKU".into()),
                title: None,
                quantity: -1,
                price: None,
            }],
            created_at: None,
            updated_at: None,
        };
        let err = DefaultSchemaMapper
            .map_order(MarketplaceType::Amazon, &order)
            .unwrap_err();
        assert!(matches!(err, MappingError::InvalidValue { field: "line_items.quantity", .. }));
    }

    #[test]
    fn unparseable_price_is_invalid() {
        assert!(parse_price("price", Some("12,00")).is_err());
        assert_eq!(parse_price("price", Some(" 7 ")).unwrap().as_deref(), Some("7.00"));
        assert_eq!(parse_price("price", None).unwrap(), None);
    }
}
