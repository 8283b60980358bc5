//! Marketplace adapters: one client per external marketplace behind a shared trait.

pub mod amazon;
pub mod dukaan;
pub mod factory;
pub mod http;
pub mod rate_limit;
pub mod shopify;
pub mod signature;
pub mod trait_;
pub mod types;

pub use factory::{AdapterConstructor, AdapterFactory};
pub use trait_::{AdapterError, MarketplaceAdapter, SyncError, SyncErrorKind};
pub use types::{
    ExternalLineItem, ExternalOrder, ExternalProduct, ExternalVariant, InventoryLevel,
    ListOptions, OrderListOptions, Page, ResourceType, TokenResult, WebhookContext, WebhookEvent,
};
