//! In-process registry backed by a `DashMap`.
//!
//! Per-record atomicity comes from the map's shard locks: `insert` goes through
//! the entry API and `update` mutates under `get_mut`.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::RwLock;

use super::{MigrationRecord, RegistryStore};
use crate::errors::StoreError;
use crate::models::service::{NewService, ServicePatch, ServiceRecord};

#[derive(Default)]
pub struct MemoryStore {
    services: DashMap<String, ServiceRecord>,
    migrations: RwLock<Vec<MigrationRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn bootstrap(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<ServiceRecord, StoreError> {
        self.services
            .get(name)
            .map(|r| r.value().clone())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn list(&self) -> Result<Vec<ServiceRecord>, StoreError> {
        let mut all: Vec<ServiceRecord> = self.services.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn insert(&self, new: NewService) -> Result<ServiceRecord, StoreError> {
        let record = ServiceRecord::create(new, Utc::now())?;
        match self.services.entry(record.name.clone()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(record.name)),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }

    async fn update(&self, name: &str, patch: ServicePatch) -> Result<ServiceRecord, StoreError> {
        let mut entry = self
            .services
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        entry.apply_patch(patch, Utc::now())?;
        Ok(entry.value().clone())
    }

    async fn applied_migrations(&self) -> Result<Vec<MigrationRecord>, StoreError> {
        Ok(self.migrations.read().await.clone())
    }

    async fn record_migration(&self, name: &str) -> Result<(), StoreError> {
        let mut ledger = self.migrations.write().await;
        if !ledger.iter().any(|m| m.name == name) {
            ledger.push(MigrationRecord {
                name: name.to_string(),
                applied_at: Utc::now(),
            });
        }
        Ok(())
    }
}
