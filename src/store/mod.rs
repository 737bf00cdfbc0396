pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::StoreError;
use crate::models::service::{NewService, ServicePatch, ServiceRecord};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// A migration that has been applied at least once.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

/// Durable table of service records plus the migration ledger.
///
/// Writes are atomic per record. Implementations: [`MemoryStore`] for tests and
/// database-less runs, [`PgStore`] for PostgreSQL.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Prepare backing tables. Safe to call repeatedly.
    async fn bootstrap(&self) -> Result<(), StoreError>;

    async fn get(&self, name: &str) -> Result<ServiceRecord, StoreError>;

    /// All records ordered by name.
    async fn list(&self) -> Result<Vec<ServiceRecord>, StoreError>;

    /// Fails with `AlreadyExists` when the name is taken.
    async fn insert(&self, new: NewService) -> Result<ServiceRecord, StoreError>;

    /// Fails with `NotFound` when the name is absent.
    async fn update(&self, name: &str, patch: ServicePatch) -> Result<ServiceRecord, StoreError>;

    async fn applied_migrations(&self) -> Result<Vec<MigrationRecord>, StoreError>;

    /// Record a migration as applied. Recording an already-known name is a no-op.
    async fn record_migration(&self, name: &str) -> Result<(), StoreError>;
}
