use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;
use zeroize::Zeroize;

use crate::errors::StoreError;

static SERVICE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]*$").expect("static regex"));

/// Sorted, de-duplicated set of action names (e.g. `screen.describe`).
pub type ActionSet = BTreeSet<String>;

/// Privilege tier of a service. Stored alongside the legacy `trusted` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl TrustLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Low => "low",
            TrustLevel::Medium => "medium",
            TrustLevel::High => "high",
        }
    }
}

impl FromStr for TrustLevel {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(TrustLevel::Low),
            "medium" => Ok(TrustLevel::Medium),
            "high" => Ok(TrustLevel::High),
            other => Err(StoreError::SchemaViolation(format!(
                "unknown trust level '{}'",
                other
            ))),
        }
    }
}

/// Last known health of a service endpoint, written by the health checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Down,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Down => "down",
        }
    }
}

impl FromStr for HealthStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(HealthStatus::Unknown),
            "healthy" => Ok(HealthStatus::Healthy),
            "degraded" => Ok(HealthStatus::Degraded),
            "down" => Ok(HealthStatus::Down),
            other => Err(StoreError::SchemaViolation(format!(
                "unknown health status '{}'",
                other
            ))),
        }
    }
}

/// Upstream credential. Zeroed on drop; `Debug` only ever shows a masked form.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// `abcd…wxyz` for keys longer than 8 chars, `****` otherwise.
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() > 8 {
            let head: String = chars[..4].iter().collect();
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("{}…{}", head, tail)
        } else {
            "****".to_string()
        }
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey({})", self.masked())
    }
}

impl Drop for ApiKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// The declared and the forwarded action sets of a service.
///
/// `allowed` is always a subset of `declared`; the only ways to build one go
/// through [`ActionGrants::new`], which rejects violations instead of
/// trimming them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawGrants")]
pub struct ActionGrants {
    actions: ActionSet,
    allowed_actions: ActionSet,
}

#[derive(Deserialize)]
struct RawGrants {
    #[serde(default)]
    actions: ActionSet,
    #[serde(default)]
    allowed_actions: ActionSet,
}

impl TryFrom<RawGrants> for ActionGrants {
    type Error = StoreError;

    fn try_from(raw: RawGrants) -> Result<Self, Self::Error> {
        ActionGrants::new(raw.actions, raw.allowed_actions)
    }
}

impl ActionGrants {
    pub fn new(actions: ActionSet, allowed_actions: ActionSet) -> Result<Self, StoreError> {
        let undeclared: Vec<&str> = allowed_actions
            .difference(&actions)
            .map(String::as_str)
            .collect();
        if !undeclared.is_empty() {
            return Err(StoreError::SchemaViolation(format!(
                "allowed_actions not declared in actions: {}",
                undeclared.join(", ")
            )));
        }
        Ok(Self {
            actions,
            allowed_actions,
        })
    }

    pub fn actions(&self) -> &ActionSet {
        &self.actions
    }

    pub fn allowed_actions(&self) -> &ActionSet {
        &self.allowed_actions
    }

    pub fn permits(&self, action: &str) -> bool {
        self.allowed_actions.contains(action)
    }
}

/// A registered capability provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRecord {
    pub id: Uuid,
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub endpoint: Option<String>,
    pub api_key: Option<ApiKey>,
    pub enabled: bool,
    pub trusted: bool,
    pub trust_level: TrustLevel,
    pub grants: ActionGrants,
    pub capabilities: BTreeSet<String>,
    pub rate_limit: u32,
    pub health_status: HealthStatus,
    pub version: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServiceRecord {
    /// Build a fresh record from an insert request, stamping id and timestamps.
    pub fn create(new: NewService, now: DateTime<Utc>) -> Result<Self, StoreError> {
        let grants = ActionGrants::new(new.actions, new.allowed_actions)?;
        let record = Self {
            id: Uuid::new_v4(),
            display_name: new.display_name.unwrap_or_else(|| new.name.clone()),
            name: new.name,
            description: new.description,
            endpoint: new.endpoint,
            api_key: new.api_key,
            enabled: new.enabled,
            trusted: new.trusted,
            trust_level: new.trust_level,
            grants,
            capabilities: new.capabilities,
            rate_limit: new.rate_limit,
            health_status: HealthStatus::Unknown,
            version: new.version,
            created_by: new.created_by,
            created_at: now,
            updated_at: now,
        };
        record.validate()?;
        Ok(record)
    }

    /// Apply a partial update. The record is left untouched on error.
    pub fn apply_patch(&mut self, patch: ServicePatch, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut next = self.clone();

        if patch.actions.is_some() || patch.allowed_actions.is_some() {
            let actions = patch
                .actions
                .unwrap_or_else(|| next.grants.actions().clone());
            let allowed = patch
                .allowed_actions
                .unwrap_or_else(|| next.grants.allowed_actions().clone());
            next.grants = ActionGrants::new(actions, allowed)?;
        }
        if let Some(v) = patch.display_name {
            next.display_name = v;
        }
        if let Some(v) = patch.description {
            next.description = v;
        }
        if let Some(v) = patch.endpoint {
            next.endpoint = v;
        }
        if let Some(v) = patch.api_key {
            next.api_key = v;
        }
        if let Some(v) = patch.enabled {
            next.enabled = v;
        }
        if let Some(v) = patch.trusted {
            next.trusted = v;
        }
        if let Some(v) = patch.trust_level {
            next.trust_level = v;
        }
        if let Some(v) = patch.capabilities {
            next.capabilities = v;
        }
        if let Some(v) = patch.rate_limit {
            next.rate_limit = v;
        }
        if let Some(v) = patch.health_status {
            next.health_status = v;
        }
        if let Some(v) = patch.version {
            next.version = v;
        }

        next.validate()?;
        next.updated_at = now;
        *self = next;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if !SERVICE_NAME.is_match(&self.name) {
            return Err(StoreError::SchemaViolation(format!(
                "invalid service name '{}'",
                self.name
            )));
        }
        if self.rate_limit == 0 {
            return Err(StoreError::SchemaViolation(
                "rate_limit must be positive".into(),
            ));
        }
        match &self.endpoint {
            Some(endpoint) => {
                url::Url::parse(endpoint).map_err(|e| {
                    StoreError::SchemaViolation(format!("invalid endpoint '{}': {}", endpoint, e))
                })?;
            }
            None if self.enabled => {
                return Err(StoreError::SchemaViolation(format!(
                    "service '{}' cannot be enabled without an endpoint",
                    self.name
                )));
            }
            None => {}
        }
        Ok(())
    }
}

fn default_rate_limit() -> u32 {
    60
}

fn default_created_by() -> String {
    "system".to_string()
}

/// Insert request for a new service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewService {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<ApiKey>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub trusted: bool,
    #[serde(default)]
    pub trust_level: TrustLevel,
    #[serde(default)]
    pub actions: ActionSet,
    #[serde(default)]
    pub allowed_actions: ActionSet,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    #[serde(default)]
    pub version: String,
    #[serde(default = "default_created_by")]
    pub created_by: String,
}

impl NewService {
    /// Minimal insert request; everything else takes its default.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            description: String::new(),
            endpoint: None,
            api_key: None,
            enabled: false,
            trusted: false,
            trust_level: TrustLevel::default(),
            actions: ActionSet::new(),
            allowed_actions: ActionSet::new(),
            capabilities: BTreeSet::new(),
            rate_limit: default_rate_limit(),
            version: String::new(),
            created_by: default_created_by(),
        }
    }
}

/// Field-level update. `None` leaves the field as it is; `name`, `id` and
/// `created_*` are not patchable.
///
/// `endpoint` and `api_key` are nullable: `Some(None)` (JSON `null`) clears
/// the stored value.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePatch {
    pub display_name: Option<String>,
    pub description: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub endpoint: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub api_key: Option<Option<ApiKey>>,
    pub enabled: Option<bool>,
    pub trusted: Option<bool>,
    pub trust_level: Option<TrustLevel>,
    pub actions: Option<ActionSet>,
    pub allowed_actions: Option<ActionSet>,
    pub capabilities: Option<BTreeSet<String>>,
    pub rate_limit: Option<u32>,
    pub health_status: Option<HealthStatus>,
    pub version: Option<String>,
}

impl ServicePatch {
    pub fn is_empty(&self) -> bool {
        *self == ServicePatch::default()
    }
}

/// A field that is present deserializes to `Some`, even when it is `null`.
fn present<'de, D, T>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

/// Build an [`ActionSet`] from string literals.
pub fn action_set<I, S>(items: I) -> ActionSet
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
