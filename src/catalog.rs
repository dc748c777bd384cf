use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use ulid::Ulid;

use crate::model::{CancellationPolicy, Listing};

/// Read-only view of the property catalog.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn listing(&self, property_id: Ulid) -> Option<Listing>;

    async fn cancellation_policy(&self, policy_id: Ulid) -> Option<CancellationPolicy>;
}

/// Catalog seed file: `{"policies": [...], "listings": [...]}`.
#[derive(Debug, Default, Deserialize)]
pub struct CatalogSeed {
    #[serde(default)]
    pub policies: Vec<CancellationPolicy>,
    #[serde(default)]
    pub listings: Vec<Listing>,
}

/// Catalog held in memory. Used by the binary (seeded from JSON) and by tests.
#[derive(Default)]
pub struct InMemoryCatalog {
    listings: DashMap<Ulid, Listing>,
    policies: DashMap<Ulid, CancellationPolicy>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: CatalogSeed) -> Self {
        let catalog = Self::new();
        for policy in seed.policies {
            catalog.insert_policy(policy);
        }
        for listing in seed.listings {
            catalog.insert_listing(listing);
        }
        catalog
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let raw = std::fs::read(path)?;
        let seed: CatalogSeed = serde_json::from_slice(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Self::from_seed(seed))
    }

    pub fn insert_listing(&self, listing: Listing) {
        self.listings.insert(listing.property_id, listing);
    }

    pub fn insert_policy(&self, policy: CancellationPolicy) {
        self.policies.insert(policy.id, policy);
    }

    pub fn listing_count(&self) -> usize {
        self.listings.len()
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn listing(&self, property_id: Ulid) -> Option<Listing> {
        self.listings.get(&property_id).map(|e| e.value().clone())
    }

    async fn cancellation_policy(&self, policy_id: Ulid) -> Option<CancellationPolicy> {
        self.policies.get(&policy_id).map(|e| e.value().clone())
    }
}
