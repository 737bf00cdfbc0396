//! Ordered, idempotent registry migrations applied at boot.
//!
//! Steps are named `<ordinal>_<description>` and run in ordinal order, one at
//! a time, before the gateway accepts traffic. A failing step aborts the run.

pub mod seed;

use std::collections::HashSet;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::config::Overrides;
use crate::errors::{MigrationError, StoreError};
use crate::store::RegistryStore;

static MIGRATION_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)_[a-z0-9][a-z0-9_]*$").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationOutcome {
    Inserted,
    Updated,
    Skipped,
}

/// One named evolution step against the registry.
#[async_trait]
pub trait Migration: Send + Sync {
    fn name(&self) -> &str;

    /// Repeatable steps run on every boot even when already in the ledger.
    /// They must converge to the same state for the same configuration.
    fn repeatable(&self) -> bool {
        false
    }

    async fn apply(
        &self,
        store: &dyn RegistryStore,
        overrides: &Overrides,
    ) -> Result<MigrationOutcome, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    pub name: String,
    pub outcome: MigrationOutcome,
}

/// Extract the ordinal prefix from a migration name.
pub fn parse_ordinal(name: &str) -> Result<u32, MigrationError> {
    MIGRATION_NAME
        .captures(name)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .ok_or_else(|| MigrationError::InvalidName(name.to_string()))
}

pub struct Migrator {
    steps: Vec<(u32, Box<dyn Migration>)>,
}

impl Migrator {
    /// Order steps by ordinal. Malformed names and shared ordinals are rejected.
    pub fn new(steps: Vec<Box<dyn Migration>>) -> Result<Self, MigrationError> {
        let mut ordered = Vec::with_capacity(steps.len());
        for step in steps {
            let ordinal = parse_ordinal(step.name())?;
            ordered.push((ordinal, step));
        }
        ordered.sort_by_key(|(ordinal, _)| *ordinal);

        for pair in ordered.windows(2) {
            if pair[0].0 == pair[1].0 {
                return Err(MigrationError::DuplicateOrdinal {
                    ordinal: pair[0].0,
                    first: pair[0].1.name().to_string(),
                    second: pair[1].1.name().to_string(),
                });
            }
        }

        Ok(Self { steps: ordered })
    }

    /// The migrations shipped with the gateway.
    pub fn builtin() -> Result<Self, MigrationError> {
        Self::new(seed::builtin_migrations())
    }

    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|(_, s)| s.name()).collect()
    }

    /// Apply every step in order. Stops at the first failure.
    pub async fn run(
        &self,
        store: &dyn RegistryStore,
        overrides: &Overrides,
    ) -> Result<Vec<StepReport>, MigrationError> {
        store.bootstrap().await.map_err(MigrationError::Ledger)?;

        let applied: HashSet<String> = store
            .applied_migrations()
            .await
            .map_err(MigrationError::Ledger)?
            .into_iter()
            .map(|m| m.name)
            .collect();

        let mut report = Vec::with_capacity(self.steps.len());

        for (_, step) in &self.steps {
            let name = step.name();
            let seen = applied.contains(name);

            if seen && !step.repeatable() {
                tracing::debug!(migration = name, "already applied");
                report.push(StepReport {
                    name: name.to_string(),
                    outcome: MigrationOutcome::Skipped,
                });
                continue;
            }

            let outcome = match step.apply(store, overrides).await {
                Ok(outcome) => outcome,
                Err(source) => {
                    tracing::error!(migration = name, error = %source, "migration failed");
                    return Err(MigrationError::Step {
                        name: name.to_string(),
                        source,
                    });
                }
            };

            if !seen {
                store
                    .record_migration(name)
                    .await
                    .map_err(|source| MigrationError::Step {
                        name: name.to_string(),
                        source,
                    })?;
            }

            tracing::info!(migration = name, outcome = ?outcome, "migration applied");
            report.push(StepReport {
                name: name.to_string(),
                outcome,
            });
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::{Arc, Mutex};

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl Migration for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn apply(
            &self,
            _store: &dyn RegistryStore,
            _overrides: &Overrides,
        ) -> Result<MigrationOutcome, StoreError> {
            self.log.lock().unwrap().push(self.name);
            if self.fail {
                return Err(StoreError::SchemaViolation("boom".into()));
            }
            Ok(MigrationOutcome::Inserted)
        }
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Box<dyn Migration> {
        Box::new(Recorder {
            name,
            log: log.clone(),
            fail: false,
        })
    }

    #[test]
    fn test_parse_ordinal() {
        assert_eq!(parse_ordinal("0001_seed").unwrap(), 1);
        assert_eq!(parse_ordinal("20240105_add_voice").unwrap(), 20240105);
        assert!(parse_ordinal("seed").is_err());
        assert!(parse_ordinal("0001-seed").is_err());
        assert!(parse_ordinal("0001_").is_err());
    }

    #[tokio::test]
    async fn test_runs_in_ordinal_order_regardless_of_declaration() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let migrator = Migrator::new(vec![
            recorder("0010_third", &log),
            recorder("0002_second", &log),
            recorder("0001_first", &log),
        ])
        .unwrap();
        assert_eq!(migrator.names(), vec!["0001_first", "0002_second", "0010_third"]);

        let store = MemoryStore::new();
        migrator.run(&store, &Overrides::default()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["0001_first", "0002_second", "0010_third"]);
    }

    #[test]
    fn test_duplicate_ordinal_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let err = Migrator::new(vec![recorder("0001_a", &log), recorder("1_b", &log)])
            .err()
            .unwrap();
        assert!(matches!(err, MigrationError::DuplicateOrdinal { ordinal: 1, .. }));
    }

    #[tokio::test]
    async fn test_non_repeatable_step_runs_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let migrator = Migrator::new(vec![recorder("0001_once", &log)]).unwrap();
        let store = MemoryStore::new();

        let first = migrator.run(&store, &Overrides::default()).await.unwrap();
        let second = migrator.run(&store, &Overrides::default()).await.unwrap();

        assert_eq!(first[0].outcome, MigrationOutcome::Inserted);
        assert_eq!(second[0].outcome, MigrationOutcome::Skipped);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_stops_run_and_names_step() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let migrator = Migrator::new(vec![
            recorder("0001_ok", &log),
            Box::new(Recorder {
                name: "0002_broken",
                log: log.clone(),
                fail: true,
            }),
            recorder("0003_never", &log),
        ])
        .unwrap();
        let store = MemoryStore::new();

        let err = migrator.run(&store, &Overrides::default()).await.unwrap_err();
        assert!(matches!(err, MigrationError::Step { ref name, .. } if name == "0002_broken"));
        assert_eq!(*log.lock().unwrap(), vec!["0001_ok", "0002_broken"]);

        let ledger: Vec<String> = store
            .applied_migrations()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(ledger, vec!["0001_ok"]);
    }
}
