use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::{MigrationRecord, RegistryStore};
use crate::errors::StoreError;
use crate::models::service::{
    ActionGrants, ApiKey, NewService, ServicePatch, ServiceRecord,
};

const SERVICE_COLUMNS: &str = "id, name, display_name, description, endpoint, api_key, enabled, trusted, trust_level, actions, allowed_actions, capabilities, rate_limit, health_status, version, created_by, created_at, updated_at";

const CREATE_SERVICES: &str = r#"
CREATE TABLE IF NOT EXISTS services (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    endpoint TEXT,
    api_key TEXT,
    enabled BOOLEAN NOT NULL DEFAULT false,
    trusted BOOLEAN NOT NULL DEFAULT false,
    trust_level TEXT NOT NULL DEFAULT 'medium',
    actions JSONB NOT NULL DEFAULT '[]',
    allowed_actions JSONB NOT NULL DEFAULT '[]',
    capabilities JSONB NOT NULL DEFAULT '[]',
    rate_limit BIGINT NOT NULL CHECK (rate_limit > 0),
    health_status TEXT NOT NULL DEFAULT 'unknown',
    version TEXT NOT NULL DEFAULT '',
    created_by TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    name TEXT PRIMARY KEY,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Raw `services` row; list columns are JSONB arrays of strings.
#[derive(Debug, sqlx::FromRow)]
struct ServiceRow {
    id: Uuid,
    name: String,
    display_name: String,
    description: String,
    endpoint: Option<String>,
    api_key: Option<String>,
    enabled: bool,
    trusted: bool,
    trust_level: String,
    actions: Json<BTreeSet<String>>,
    allowed_actions: Json<BTreeSet<String>>,
    capabilities: Json<BTreeSet<String>>,
    rate_limit: i64,
    health_status: String,
    version: String,
    created_by: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ServiceRow> for ServiceRecord {
    type Error = StoreError;

    fn try_from(row: ServiceRow) -> Result<Self, Self::Error> {
        let rate_limit = u32::try_from(row.rate_limit).map_err(|_| {
            StoreError::SchemaViolation(format!(
                "service '{}' has out-of-range rate_limit {}",
                row.name, row.rate_limit
            ))
        })?;
        Ok(ServiceRecord {
            id: row.id,
            grants: ActionGrants::new(row.actions.0, row.allowed_actions.0)?,
            display_name: row.display_name,
            description: row.description,
            endpoint: row.endpoint,
            api_key: row.api_key.map(ApiKey::new),
            enabled: row.enabled,
            trusted: row.trusted,
            trust_level: row.trust_level.parse()?,
            capabilities: row.capabilities.0,
            rate_limit,
            health_status: row.health_status.parse()?,
            version: row.version,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
            name: row.name,
        })
    }
}

#[async_trait]
impl RegistryStore for PgStore {
    async fn bootstrap(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_SERVICES).execute(&self.pool).await?;
        sqlx::query(CREATE_MIGRATIONS).execute(&self.pool).await?;
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<ServiceRecord, StoreError> {
        let row = sqlx::query_as::<_, ServiceRow>(&format!(
            "SELECT {} FROM services WHERE name = $1",
            SERVICE_COLUMNS
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        row.try_into()
    }

    async fn list(&self) -> Result<Vec<ServiceRecord>, StoreError> {
        let rows = sqlx::query_as::<_, ServiceRow>(&format!(
            "SELECT {} FROM services ORDER BY name ASC",
            SERVICE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ServiceRecord::try_from).collect()
    }

    async fn insert(&self, new: NewService) -> Result<ServiceRecord, StoreError> {
        let record = ServiceRecord::create(new, Utc::now())?;
        let result = sqlx::query(&format!(
            r#"INSERT INTO services ({})
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
               ON CONFLICT (name) DO NOTHING"#,
            SERVICE_COLUMNS
        ))
        .bind(record.id)
        .bind(&record.name)
        .bind(&record.display_name)
        .bind(&record.description)
        .bind(&record.endpoint)
        .bind(record.api_key.as_ref().map(ApiKey::expose))
        .bind(record.enabled)
        .bind(record.trusted)
        .bind(record.trust_level.as_str())
        .bind(Json(record.grants.actions()))
        .bind(Json(record.grants.allowed_actions()))
        .bind(Json(&record.capabilities))
        .bind(record.rate_limit as i64)
        .bind(record.health_status.as_str())
        .bind(&record.version)
        .bind(&record.created_by)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(record.name));
        }
        Ok(record)
    }

    async fn update(&self, name: &str, patch: ServicePatch) -> Result<ServiceRecord, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, ServiceRow>(&format!(
            "SELECT {} FROM services WHERE name = $1 FOR UPDATE",
            SERVICE_COLUMNS
        ))
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        let mut record = ServiceRecord::try_from(row)?;
        record.apply_patch(patch, Utc::now())?;

        sqlx::query(
            r#"UPDATE services SET
                   display_name = $2, description = $3, endpoint = $4, api_key = $5,
                   enabled = $6, trusted = $7, trust_level = $8, actions = $9,
                   allowed_actions = $10, capabilities = $11, rate_limit = $12,
                   health_status = $13, version = $14, updated_at = $15
               WHERE name = $1"#,
        )
        .bind(&record.name)
        .bind(&record.display_name)
        .bind(&record.description)
        .bind(&record.endpoint)
        .bind(record.api_key.as_ref().map(ApiKey::expose))
        .bind(record.enabled)
        .bind(record.trusted)
        .bind(record.trust_level.as_str())
        .bind(Json(record.grants.actions()))
        .bind(Json(record.grants.allowed_actions()))
        .bind(Json(&record.capabilities))
        .bind(record.rate_limit as i64)
        .bind(record.health_status.as_str())
        .bind(&record.version)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(record)
    }

    async fn applied_migrations(&self) -> Result<Vec<MigrationRecord>, StoreError> {
        let rows = sqlx::query_as::<_, (String, DateTime<Utc>)>(
            "SELECT name, applied_at FROM schema_migrations ORDER BY name ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(name, applied_at)| MigrationRecord { name, applied_at })
            .collect())
    }

    async fn record_migration(&self, name: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO schema_migrations (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
