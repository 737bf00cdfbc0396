//! Batch rotation of upstream API keys from named overrides.
//!
//! Each service reads its key from `<NAME>_API_KEY`, with the service name
//! upper-cased and `-` replaced by `_` (`screen-intelligence` →
//! `SCREEN_INTELLIGENCE_API_KEY`). A failing service is reported and the
//! batch moves on to the next one.

use std::path::Path;

use anyhow::Context;

use crate::config::Overrides;
use crate::models::service::{ApiKey, ServicePatch};
use crate::store::RegistryStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySync {
    Rotated,
    Unchanged,
    /// No override for this service.
    Missing,
    Failed(String),
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub results: Vec<(String, KeySync)>,
}

impl SyncReport {
    pub fn count(&self, outcome: fn(&KeySync) -> bool) -> usize {
        self.results.iter().filter(|(_, r)| outcome(r)).count()
    }

    pub fn rotated(&self) -> usize {
        self.count(|r| matches!(r, KeySync::Rotated))
    }

    pub fn failed(&self) -> usize {
        self.count(|r| matches!(r, KeySync::Failed(_)))
    }
}

pub fn key_var(service: &str) -> String {
    format!("{}_API_KEY", service.to_uppercase().replace('-', "_"))
}

/// Read overrides from a dotenv-formatted file without touching the process
/// environment.
pub fn overrides_from_file(path: &Path) -> anyhow::Result<Overrides> {
    let iter = dotenvy::from_path_iter(path)
        .with_context(|| format!("cannot read env file {}", path.display()))?;
    let mut values = Vec::new();
    for item in iter {
        let (k, v) = item.with_context(|| format!("malformed line in {}", path.display()))?;
        values.push((k, v));
    }
    Ok(Overrides::from_map(values))
}

pub async fn sync_keys(store: &dyn RegistryStore, overrides: &Overrides) -> anyhow::Result<SyncReport> {
    let services = store.list().await.context("listing services")?;
    let mut report = SyncReport::default();

    for record in services {
        let var = key_var(&record.name);
        let outcome = match overrides.get(&var) {
            None => KeySync::Missing,
            Some(key) if record.api_key.as_ref().map(|k| k.expose()) == Some(key) => {
                KeySync::Unchanged
            }
            Some(key) => {
                let patch = ServicePatch {
                    api_key: Some(Some(ApiKey::new(key))),
                    ..Default::default()
                };
                match store.update(&record.name, patch).await {
                    Ok(_) => {
                        tracing::info!(service = %record.name, "api key rotated");
                        KeySync::Rotated
                    }
                    Err(e) => {
                        tracing::error!(service = %record.name, "api key sync failed: {}", e);
                        KeySync::Failed(e.to_string())
                    }
                }
            }
        };
        report.results.push((record.name, outcome));
    }

    Ok(report)
}
