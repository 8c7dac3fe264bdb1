//! Read-only view of the marketplace catalog the scheduler depends on.
//!
//! Providers and service items are owned by the surrounding application;
//! the engine only looks them up by id when it needs them.

use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Money, ProviderId, ServiceItemId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceItem {
    pub id: ServiceItemId,
    pub name: String,
    pub base_price: Money,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub id: ProviderId,
    /// Account that acts for this provider.
    pub user_id: UserId,
    #[serde(default)]
    pub name: Option<String>,
}

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn service_item(&self, id: ServiceItemId) -> Option<ServiceItem>;
    async fn provider(&self, id: ProviderId) -> Option<Provider>;
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed catalog file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Seed file layout.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CatalogSeed {
    #[serde(default)]
    pub providers: Vec<Provider>,
    #[serde(default)]
    pub service_items: Vec<ServiceItem>,
}

pub struct InMemoryCatalog {
    providers: DashMap<ProviderId, Provider>,
    service_items: DashMap<ServiceItemId, ServiceItem>,
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self {
            providers: DashMap::new(),
            service_items: DashMap::new(),
        }
    }

    pub fn from_seed(seed: CatalogSeed) -> Self {
        let catalog = Self::new();
        for provider in seed.providers {
            catalog.insert_provider(provider);
        }
        for item in seed.service_items {
            catalog.insert_service_item(item);
        }
        catalog
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path)?;
        let seed: CatalogSeed = serde_json::from_str(&raw)?;
        Ok(Self::from_seed(seed))
    }

    pub fn insert_provider(&self, provider: Provider) {
        self.providers.insert(provider.id, provider);
    }

    pub fn remove_provider(&self, id: &ProviderId) -> Option<Provider> {
        self.providers.remove(id).map(|(_, p)| p)
    }

    pub fn insert_service_item(&self, item: ServiceItem) {
        self.service_items.insert(item.id, item);
    }

    /// Flip the active flag; returns false if the item is unknown.
    pub fn set_service_item_active(&self, id: &ServiceItemId, active: bool) -> bool {
        match self.service_items.get_mut(id) {
            Some(mut item) => {
                item.is_active = active;
                true
            }
            None => false,
        }
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    pub fn service_item_count(&self) -> usize {
        self.service_items.len()
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn service_item(&self, id: ServiceItemId) -> Option<ServiceItem> {
        self.service_items.get(&id).map(|e| e.value().clone())
    }

    async fn provider(&self, id: ProviderId) -> Option<Provider> {
        self.providers.get(&id).map(|e| e.value().clone())
    }
}
