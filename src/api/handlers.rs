use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::service::{
    HealthStatus, NewService, ServicePatch, ServiceRecord, TrustLevel,
};
use crate::store::MigrationRecord;
use crate::AppState;

// ── Request / Response DTOs ──────────────────────────────────

/// Admin view of a service. The raw api key never leaves the gateway.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceView {
    pub id: Uuid,
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub endpoint: Option<String>,
    pub api_key_set: bool,
    pub api_key_hint: Option<String>,
    pub enabled: bool,
    pub trusted: bool,
    pub trust_level: TrustLevel,
    pub actions: BTreeSet<String>,
    pub allowed_actions: BTreeSet<String>,
    pub capabilities: BTreeSet<String>,
    pub rate_limit: u32,
    pub health_status: HealthStatus,
    pub version: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ServiceRecord> for ServiceView {
    fn from(r: ServiceRecord) -> Self {
        Self {
            api_key_set: r.api_key.is_some(),
            api_key_hint: r.api_key.as_ref().map(|k| k.masked()),
            actions: r.grants.actions().clone(),
            allowed_actions: r.grants.allowed_actions().clone(),
            id: r.id,
            name: r.name,
            display_name: r.display_name,
            description: r.description,
            endpoint: r.endpoint,
            enabled: r.enabled,
            trusted: r.trusted,
            trust_level: r.trust_level,
            capabilities: r.capabilities,
            rate_limit: r.rate_limit,
            health_status: r.health_status,
            version: r.version,
            created_by: r.created_by,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SetHealthRequest {
    pub status: HealthStatus,
}

// ── Services ─────────────────────────────────────────────────

/// GET /api/v1/services
pub async fn list_services(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ServiceView>>, AppError> {
    let services = state.store.list().await?;
    Ok(Json(services.into_iter().map(ServiceView::from).collect()))
}

/// POST /api/v1/services
pub async fn create_service(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewService>,
) -> Result<(StatusCode, Json<ServiceView>), AppError> {
    let created = state.store.insert(payload).await?;
    tracing::info!(service = %created.name, "service registered");
    Ok((StatusCode::CREATED, Json(created.into())))
}

/// GET /api/v1/services/:name
pub async fn get_service(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ServiceView>, AppError> {
    Ok(Json(state.store.get(&name).await?.into()))
}

/// PATCH /api/v1/services/:name
pub async fn update_service(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(patch): Json<ServicePatch>,
) -> Result<Json<ServiceView>, AppError> {
    if patch.is_empty() {
        return Err(AppError::SchemaViolation("empty update".into()));
    }
    let updated = state.store.update(&name, patch).await?;
    tracing::info!(service = %updated.name, "service updated");
    Ok(Json(updated.into()))
}

/// PUT /api/v1/services/:name/health
pub async fn set_service_health(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<SetHealthRequest>,
) -> Result<Json<ServiceView>, AppError> {
    let patch = ServicePatch {
        health_status: Some(req.status),
        ..Default::default()
    };
    let updated = state.store.update(&name, patch).await?;
    tracing::info!(service = %updated.name, status = req.status.as_str(), "health status set");
    Ok(Json(updated.into()))
}

// ── Migrations ───────────────────────────────────────────────

/// GET /api/v1/migrations
pub async fn list_migrations(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<MigrationRecord>>, AppError> {
    Ok(Json(state.store.applied_migrations().await?))
}
