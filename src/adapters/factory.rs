//! Selects and initializes the adapter for a connection's marketplace.

use std::{collections::HashMap, sync::Arc};

use serde_json::Value;
use tracing::debug;

use super::{
    amazon::AmazonAdapter,
    dukaan::DukaanAdapter,
    shopify::ShopifyAdapter,
    trait_::{AdapterError, MarketplaceAdapter},
};
use crate::models::marketplace_connection::MarketplaceType;

/// Builds an uninitialized adapter.
pub type AdapterConstructor =
    Arc<dyn Fn() -> Result<Box<dyn MarketplaceAdapter>, AdapterError> + Send + Sync>;

#[derive(Clone)]
pub struct AdapterFactory {
    constructors: HashMap<MarketplaceType, AdapterConstructor>,
}

impl AdapterFactory {
    /// Factory with the built-in Shopify, Dukaan and Amazon clients.
    pub fn new() -> Self {
        let mut factory = Self::empty();
        factory.register(MarketplaceType::Shopify, || {
            Ok(Box::new(ShopifyAdapter::new()?) as Box<dyn MarketplaceAdapter>)
        });
        factory.register(MarketplaceType::Dukaan, || {
            Ok(Box::new(DukaanAdapter::new()?) as Box<dyn MarketplaceAdapter>)
        });
        factory.register(MarketplaceType::Amazon, || {
            Ok(Box::new(AmazonAdapter::new()?) as Box<dyn MarketplaceAdapter>)
        });
        factory
    }

    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Installs or replaces the constructor for a marketplace.
    pub fn register<F>(&mut self, marketplace: MarketplaceType, constructor: F)
    where
        F: Fn() -> Result<Box<dyn MarketplaceAdapter>, AdapterError> + Send + Sync + 'static,
    {
        self.constructors.insert(marketplace, Arc::new(constructor));
    }

    pub fn supports(&self, marketplace: MarketplaceType) -> bool {
        self.constructors.contains_key(&marketplace)
    }

    /// Constructs and initializes an adapter with the given credentials.
    pub async fn create(
        &self,
        marketplace: MarketplaceType,
        credentials: &Value,
    ) -> Result<Arc<dyn MarketplaceAdapter>, AdapterError> {
        let constructor = self.constructors.get(&marketplace).ok_or_else(|| {
            AdapterError::Unsupported(format!("no adapter for marketplace {marketplace}"))
        })?;
        let mut adapter = constructor()?;
        adapter.initialize(credentials).await?;
        debug!(marketplace = %marketplace, "initialized marketplace adapter");
        Ok(Arc::from(adapter))
    }

    /// Constructs an adapter without credentials, for webhook verification and parsing.
    pub fn create_uninitialized(
        &self,
        marketplace: MarketplaceType,
    ) -> Result<Arc<dyn MarketplaceAdapter>, AdapterError> {
        let constructor = self.constructors.get(&marketplace).ok_or_else(|| {
            AdapterError::Unsupported(format!("no adapter for marketplace {marketplace}"))
        })?;
        Ok(Arc::from(constructor()?))
    }
}

impl Default for AdapterFactory {
    fn default() -> Self {
        Self::new()
    }
}
