//! Upsert-style registry seeding.
//!
//! A seed step looks up its target service by name. When absent, it inserts
//! the full record; when present, it only rewrites the fields it owns
//! (`endpoint` and `api_key`), sourced from named overrides with literal
//! fallbacks.

use async_trait::async_trait;

use super::{Migration, MigrationOutcome};
use crate::config::Overrides;
use crate::errors::StoreError;
use crate::models::service::{
    action_set, ApiKey, NewService, ServicePatch, ServiceRecord, TrustLevel,
};
use crate::store::RegistryStore;

/// An override name with its literal fallback.
#[derive(Debug, Clone, Copy)]
pub struct Setting {
    pub env: &'static str,
    pub default: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct SecretSetting {
    pub env: &'static str,
    pub default: Option<&'static str>,
}

/// Static description of a service a seed step owns.
#[derive(Debug, Clone)]
pub struct ServiceSeed {
    pub service: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
    pub endpoint: Setting,
    pub api_key: SecretSetting,
    pub actions: &'static [&'static str],
    pub allowed_actions: &'static [&'static str],
    pub capabilities: &'static [&'static str],
    pub trust_level: TrustLevel,
    pub trusted: bool,
    pub rate_limit: u32,
    pub version: &'static str,
}

/// Config-derived values of the fields a seed owns.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSeed {
    pub endpoint: String,
    pub api_key: Option<ApiKey>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    Insert(Box<NewService>),
    Update(ServicePatch),
    Unchanged,
}

impl ServiceSeed {
    pub fn resolve(&self, overrides: &Overrides) -> anyhow::Result<ResolvedSeed> {
        Ok(ResolvedSeed {
            endpoint: overrides.resolve(self.endpoint.env, self.endpoint.default),
            api_key: overrides
                .resolve_secret(self.api_key.env, self.api_key.default)?
                .map(ApiKey::new),
        })
    }

    fn new_service(&self, resolved: &ResolvedSeed) -> NewService {
        let mut new = NewService::named(self.service);
        new.display_name = Some(self.display_name.to_string());
        new.description = self.description.to_string();
        new.endpoint = Some(resolved.endpoint.clone());
        new.api_key = resolved.api_key.clone();
        new.enabled = true;
        new.trusted = self.trusted;
        new.trust_level = self.trust_level;
        new.actions = action_set(self.actions.iter().copied());
        new.allowed_actions = action_set(self.allowed_actions.iter().copied());
        new.capabilities = action_set(self.capabilities.iter().copied());
        new.rate_limit = self.rate_limit;
        new.version = self.version.to_string();
        new.created_by = "migration".to_string();
        new
    }

    /// Decide what to do given the current registry state. Pure.
    ///
    /// An unset api key override never clears a key that is already stored.
    pub fn plan(&self, resolved: &ResolvedSeed, current: Option<&ServiceRecord>) -> Plan {
        let Some(current) = current else {
            return Plan::Insert(Box::new(self.new_service(resolved)));
        };

        let mut patch = ServicePatch::default();
        if current.endpoint.as_deref() != Some(resolved.endpoint.as_str()) {
            patch.endpoint = Some(Some(resolved.endpoint.clone()));
        }
        if let Some(key) = &resolved.api_key {
            if current.api_key.as_ref() != Some(key) {
                patch.api_key = Some(Some(key.clone()));
            }
        }

        if patch.is_empty() {
            Plan::Unchanged
        } else {
            Plan::Update(patch)
        }
    }
}

/// Migration step that upserts one [`ServiceSeed`].
pub struct UpsertService {
    name: &'static str,
    seed: ServiceSeed,
}

impl UpsertService {
    pub fn new(name: &'static str, seed: ServiceSeed) -> Self {
        Self { name, seed }
    }
}

#[async_trait]
impl Migration for UpsertService {
    fn name(&self) -> &str {
        self.name
    }

    fn repeatable(&self) -> bool {
        true
    }

    async fn apply(
        &self,
        store: &dyn RegistryStore,
        overrides: &Overrides,
    ) -> Result<MigrationOutcome, StoreError> {
        let resolved = self.seed.resolve(overrides)?;

        let current = match store.get(self.seed.service).await {
            Ok(record) => Some(record),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        match self.seed.plan(&resolved, current.as_ref()) {
            Plan::Insert(new) => {
                store.insert(*new).await?;
                tracing::info!(service = self.seed.service, "seeded service");
                Ok(MigrationOutcome::Inserted)
            }
            Plan::Update(patch) => {
                let rotated_key = patch.api_key.is_some();
                store.update(self.seed.service, patch).await?;
                tracing::info!(
                    service = self.seed.service,
                    rotated_key,
                    "updated service from configuration"
                );
                Ok(MigrationOutcome::Updated)
            }
            Plan::Unchanged => Ok(MigrationOutcome::Skipped),
        }
    }
}

pub const SCREEN_INTELLIGENCE: ServiceSeed = ServiceSeed {
    service: "screen-intelligence",
    display_name: "Screen Intelligence",
    description: "Describes and operates on the user's screen for the desktop overlay",
    endpoint: Setting {
        env: "SCREEN_INTELLIGENCE_ENDPOINT",
        default: "http://127.0.0.1:8765/v1/invoke",
    },
    api_key: SecretSetting {
        env: "SCREEN_INTELLIGENCE_API_KEY",
        default: None,
    },
    actions: &["screen.describe", "screen.capture", "screen.click", "screen.type"],
    allowed_actions: &["screen.describe", "screen.capture"],
    capabilities: &["vision", "streaming"],
    trust_level: TrustLevel::Medium,
    trusted: true,
    rate_limit: 60,
    version: "1.0.0",
};

pub fn builtin_migrations() -> Vec<Box<dyn Migration>> {
    vec![Box::new(UpsertService::new(
        "0001_register_screen_intelligence",
        SCREEN_INTELLIGENCE,
    ))]
}
