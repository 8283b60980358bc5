//! Marketplace adapter trait definition
//!
//! Every marketplace client implements [`MarketplaceAdapter`]; the rest of the
//! engine never branches on marketplace type except to pick an adapter.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use super::types::{
    ExternalOrder, ExternalProduct, InventoryLevel, ListOptions, OrderListOptions, Page,
    TokenResult, WebhookContext, WebhookEvent,
};
use crate::models::marketplace_connection::MarketplaceType;
use crate::resilience::Retryable;

/// Adapter-level failures, classified for the retrier.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    /// Non-success HTTP status from the marketplace
    #[error("HTTP error {status}: {body}")]
    Http {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },
    /// The request never produced a response
    #[error("network error: {details}")]
    Network { details: String },
    #[error("malformed response: {details}")]
    MalformedResponse { details: String },
    #[error("authentication error: {details}")]
    Authentication { details: String },
    #[error("configuration error: {details}")]
    Configuration { details: String },
    #[error("webhook signature verification failed")]
    InvalidSignature,
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl AdapterError {
    pub fn configuration<S: Into<String>>(details: S) -> Self {
        AdapterError::Configuration {
            details: details.into(),
        }
    }

    pub fn malformed<S: Into<String>>(details: S) -> Self {
        AdapterError::MalformedResponse {
            details: details.into(),
        }
    }
}

impl Retryable for AdapterError {
    fn status(&self) -> Option<u16> {
        match self {
            AdapterError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn is_network(&self) -> bool {
        matches!(self, AdapterError::Network { .. })
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            AdapterError::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            AdapterError::MalformedResponse {
                details: err.to_string(),
            }
        } else {
            AdapterError::Network {
                details: err.to_string(),
            }
        }
    }
}

/// Sync-facing classification of an adapter failure.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SyncError {
    #[serde(flatten)]
    pub kind: SyncErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// Authentication/authorization failure
    Unauthorized,
    /// Rate limited with optional retry after hint
    RateLimited {
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
    /// Transient/retryable error
    Transient,
    /// Permanent/non-retryable error
    Permanent,
}

impl SyncError {
    fn new<S: Into<String>>(kind: SyncErrorKind, message: S) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            SyncErrorKind::Transient | SyncErrorKind::RateLimited { .. }
        )
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match &self.kind {
            SyncErrorKind::Unauthorized => "unauthorized",
            SyncErrorKind::RateLimited { .. } => "rate limited",
            SyncErrorKind::Transient => "transient",
            SyncErrorKind::Permanent => "permanent",
        };
        match &self.message {
            Some(message) => write!(f, "{label}: {message}"),
            None => write!(f, "{label}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<&AdapterError> for SyncError {
    fn from(err: &AdapterError) -> Self {
        match err {
            AdapterError::Http {
                status,
                retry_after,
                ..
            } => match *status {
                401 | 403 => SyncError::new(SyncErrorKind::Unauthorized, err.to_string()),
                429 => SyncError::new(
                    SyncErrorKind::RateLimited {
                        retry_after_secs: retry_after.map(|d| d.as_secs()),
                    },
                    err.to_string(),
                ),
                400..=499 => SyncError::new(SyncErrorKind::Permanent, err.to_string()),
                _ => SyncError::new(SyncErrorKind::Transient, err.to_string()),
            },
            AdapterError::Network { .. } => {
                SyncError::new(SyncErrorKind::Transient, err.to_string())
            }
            AdapterError::Authentication { .. } => {
                SyncError::new(SyncErrorKind::Unauthorized, err.to_string())
            }
            AdapterError::MalformedResponse { .. }
            | AdapterError::Configuration { .. }
            | AdapterError::InvalidSignature
            | AdapterError::Unsupported(_) => {
                SyncError::new(SyncErrorKind::Permanent, err.to_string())
            }
        }
    }
}

/// Contract every marketplace client fulfils.
///
/// Implementations rate-limit their own outbound calls and refresh access
/// tokens before they expire.
#[async_trait]
pub trait MarketplaceAdapter: Send + Sync {
    fn marketplace(&self) -> MarketplaceType;

    /// Load credentials. Called once by the factory before the adapter is shared.
    async fn initialize(&mut self, credentials: &Value) -> Result<(), AdapterError>;

    async fn test_connection(&self) -> Result<(), AdapterError>;

    async fn refresh_token(&self) -> Result<TokenResult, AdapterError>;

    async fn get_products(
        &self,
        options: &ListOptions,
    ) -> Result<Page<ExternalProduct>, AdapterError>;

    async fn get_product(&self, id: &str) -> Result<ExternalProduct, AdapterError>;

    async fn get_orders(
        &self,
        options: &OrderListOptions,
    ) -> Result<Page<ExternalOrder>, AdapterError>;

    async fn get_order(&self, id: &str) -> Result<ExternalOrder, AdapterError>;

    /// Current quantities keyed by SKU. SKUs the marketplace does not report are absent.
    async fn get_inventory(
        &self,
        skus: &[String],
    ) -> Result<HashMap<String, InventoryLevel>, AdapterError>;

    fn verify_webhook(&self, payload: &[u8], signature: &str, secret: &str) -> bool;

    fn parse_webhook(
        &self,
        payload: &[u8],
        context: &WebhookContext,
    ) -> Result<WebhookEvent, AdapterError>;
}
